//! Local metadata persistence.
//!
//! When no external metadata manager is present, the instance map (with
//! partition state stripped; slices are runtime-only) is persisted under the
//! fixed key `"IndexInstMap"` in a single-keyspace key-value file. Writes go
//! to a temp file with a checksummed header and are renamed into place on an
//! explicit commit.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kestrel_common::error::StorageError;
use kestrel_common::types::IndexInstance;
use kestrel_common::KestrelResult;

/// Key under which the instance map is stored.
pub const INST_MAP_KEY: &str = "IndexInstMap";

const META_MAGIC: &[u8; 4] = b"KSTM";
const META_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Default, Debug)]
struct MetaPayload {
    kv: BTreeMap<String, Vec<u8>>,
}

/// Single-file metadata store with a manual commit.
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    state: Mutex<MetaPayload>,
}

impl MetaStore {
    /// Open (or create) the store at `dir/meta`.
    pub fn open(dir: impl AsRef<Path>) -> KestrelResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(StorageError::Io)?;
        let path = dir.join("meta");
        let payload = if path.exists() {
            Self::read_file(&path)?
        } else {
            MetaPayload::default()
        };
        Ok(MetaStore {
            path,
            state: Mutex::new(payload),
        })
    }

    fn read_file(path: &Path) -> KestrelResult<MetaPayload> {
        let mut f = File::open(path).map_err(StorageError::Io)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(StorageError::Io)?;
        if buf.len() < 12 || &buf[0..4] != META_MAGIC {
            return Err(StorageError::Corrupted(format!("{}: bad metadata header", path.display())).into());
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != META_FORMAT_VERSION {
            return Err(StorageError::Corrupted(format!(
                "{}: unsupported metadata version {version}",
                path.display()
            ))
            .into());
        }
        let stored_crc = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let body = &buf[12..];
        if crc32fast::hash(body) != stored_crc {
            return Err(
                StorageError::Corrupted(format!("{}: metadata checksum mismatch", path.display())).into(),
            );
        }
        bincode::deserialize(body)
            .map_err(|e| StorageError::Encoding(format!("metadata decode: {e}")).into())
    }

    /// Stage a key-value pair; visible on disk after `commit`.
    pub fn set_kv(&self, key: &str, value: Vec<u8>) {
        self.state.lock().kv.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().kv.get(key).cloned()
    }

    /// Flush staged state: temp file, fsync, rename.
    pub fn commit(&self) -> KestrelResult<()> {
        let body = {
            let state = self.state.lock();
            bincode::serialize(&*state)
                .map_err(|e| StorageError::Encoding(format!("metadata encode: {e}")))?
        };
        let mut buf = Vec::with_capacity(body.len() + 12);
        buf.extend_from_slice(META_MAGIC);
        buf.extend_from_slice(&META_FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&body);

        let tmp = self.path.with_extension("tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(StorageError::Io)?;
            f.write_all(&buf).map_err(StorageError::Io)?;
            f.sync_all().map_err(StorageError::Io)?;
        }
        fs::rename(&tmp, &self.path).map_err(StorageError::Io)?;
        Ok(())
    }
}

/// Deterministic binary encoding of an instance map (BTreeMap keying gives a
/// stable byte layout; partitions are not part of [`IndexInstance`]).
pub fn encode_instance_map(
    instances: &HashMap<kestrel_common::types::InstanceId, IndexInstance>,
) -> KestrelResult<Vec<u8>> {
    let ordered: BTreeMap<u64, &IndexInstance> =
        instances.iter().map(|(id, inst)| (id.0, inst)).collect();
    bincode::serialize(&ordered)
        .map_err(|e| StorageError::Encoding(format!("instance map encode: {e}")).into())
}

pub fn decode_instance_map(
    bytes: &[u8],
) -> KestrelResult<HashMap<kestrel_common::types::InstanceId, IndexInstance>> {
    let ordered: BTreeMap<u64, IndexInstance> = bincode::deserialize(bytes)
        .map_err(|e| StorageError::Encoding(format!("instance map decode: {e}")))?;
    Ok(ordered
        .into_iter()
        .map(|(id, inst)| (kestrel_common::types::InstanceId(id), inst))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::{DefnId, IndexDefn, IndexState, InstanceId, KeyspaceId, StreamId};

    fn sample_instances() -> HashMap<InstanceId, IndexInstance> {
        let mut m = HashMap::new();
        for id in [3u64, 1, 2] {
            m.insert(
                InstanceId(id),
                IndexInstance {
                    inst_id: InstanceId(id),
                    defn: IndexDefn {
                        defn_id: DefnId(id),
                        name: format!("idx_{id}"),
                        keyspace: KeyspaceId::new("travel"),
                        is_primary: false,
                        is_array: false,
                        sec_exprs: vec!["city".into()],
                        desc: vec![false],
                        where_clause: None,
                    },
                    state: IndexState::Active,
                    stream: StreamId::Maint,
                },
            );
        }
        m
    }

    #[test]
    fn test_set_commit_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.set_kv(INST_MAP_KEY, vec![1, 2, 3]);
        store.commit().unwrap();

        let reopened = MetaStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(INST_MAP_KEY), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_uncommitted_writes_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.set_kv(INST_MAP_KEY, vec![9]);
        drop(store);
        let reopened = MetaStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(INST_MAP_KEY), None);
    }

    #[test]
    fn test_corrupt_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.set_kv(INST_MAP_KEY, vec![1]);
        store.commit().unwrap();

        let path = dir.path().join("meta");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = MetaStore::open(dir.path()).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_instance_map_encoding_deterministic_and_lossless() {
        let m = sample_instances();
        let a = encode_instance_map(&m).unwrap();
        let b = encode_instance_map(&m).unwrap();
        assert_eq!(a, b);

        let back = decode_instance_map(&a).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[&InstanceId(2)].defn.name, "idx_2");
        assert_eq!(back[&InstanceId(3)].state, IndexState::Active);
    }
}
