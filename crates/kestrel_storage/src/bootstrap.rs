//! Rebuilding snapshot containers from storage.
//!
//! Used at warmup and after a rollback: each matching instance's container is
//! torn down and repopulated from the newest usable snapshot each slice still
//! retains. Storage corruption that leaves a slice with snapshots but none
//! usable is not recoverable here; the caller turns it into a fatal exit.

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_common::error::{KestrelError, StorageError};
use kestrel_common::timestamp::TsVector;
use kestrel_common::types::{InstanceId, KeyspaceId, StreamId};
use kestrel_common::KestrelResult;

use crate::container::SnapshotContainer;
use crate::context::{CoreContext, PartitionMap};
use crate::notify::{NotifyFanout, SnapshotEvent};
use crate::snapshot::{IndexSnapshot, PartitionSnapshot, SliceSnapshot};

/// Rebuild containers for every instance matching `(stream, keyspace)`;
/// `None` filters match everything (warmup).
pub async fn rebuild_snapshots(
    ctx: &Arc<CoreContext>,
    stream: Option<StreamId>,
    keyspace: Option<&KeyspaceId>,
    notify: &NotifyFanout,
) -> KestrelResult<()> {
    let instances = ctx.instances();
    let partitions = ctx.partitions();
    for (inst_id, partn_map) in partitions.iter() {
        let Some(inst) = instances.get(inst_id) else {
            continue;
        };
        if let (Some(stream), Some(keyspace)) = (stream, keyspace) {
            if !inst.matches_stream(stream, keyspace) {
                continue;
            }
        }
        rebuild_instance(ctx, *inst_id, partn_map, notify).await?;
    }
    Ok(())
}

/// Rebuild one instance's container from storage.
pub async fn rebuild_instance(
    ctx: &Arc<CoreContext>,
    inst_id: InstanceId,
    partn_map: &PartitionMap,
    notify: &NotifyFanout,
) -> KestrelResult<()> {
    tracing::info!(inst = %inst_id, partitions = partn_map.len(), "rebuilding snapshot container from storage");

    // Tear down the existing container first so a concurrent reader can never
    // observe the pre-rollback tree.
    let existing = {
        let _guard = ctx.lock_maps();
        let mut snap_map = (*ctx.snapshots()).clone();
        let existing = snap_map.remove(&inst_id);
        ctx.set_snapshots(snap_map);
        existing
    };
    if let Some(container) = existing {
        let keyspace = ctx
            .instance(inst_id)
            .map(|i| i.defn.keyspace.clone())
            .unwrap_or_else(|| KeyspaceId::new(""));
        let num_vb = ctx.config().num_vbuckets;
        container.mark_deleted(IndexSnapshot::epoch(
            inst_id,
            TsVector::new(keyspace, num_vb),
            0,
        ));
        notify.publish(inst_id, SnapshotEvent::Deleted(inst_id));
    }

    let mut partn_snaps: Option<HashMap<_, PartitionSnapshot>> = Some(HashMap::new());
    let mut tree_ts: Option<TsVector> = None;

    'partitions: for (partn_id, partn) in partn_map.iter() {
        let mut ps = PartitionSnapshot::new(*partn_id);
        for slice in &partn.slices {
            let infos = slice.get_snapshots().await?;
            if infos.is_empty() {
                tracing::info!(inst = %inst_id, partition = %partn_id, "no retained snapshot found");
                partn_snaps = None;
                break 'partitions;
            }

            let mut opened = None;
            for info in &infos {
                match slice.open_snapshot(info).await {
                    Ok(handle) => {
                        opened = Some((info.clone(), handle));
                        break;
                    }
                    Err(KestrelError::Storage(StorageError::Corrupted(reason))) => {
                        // The slice discarded the files; an older snapshot
                        // may still be intact.
                        tracing::warn!(inst = %inst_id, slice = %slice.id(), reason,
                            "snapshot unusable, trying older");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some((info, handle)) = opened else {
                return Err(StorageError::Corrupted(format!(
                    "{inst_id}: slice {} has snapshots but none usable",
                    slice.id()
                ))
                .into());
            };

            // An out-of-sequence-order disk snapshot cannot restart a
            // stream; the whole instance reverts to empty.
            if info.ts.snap_type.is_oso() {
                tracing::info!(inst = %inst_id, "newest usable snapshot is OSO, reverting instance to zero");
                drop(handle);
                for (pid, p) in partn_map.iter() {
                    for s in &p.slices {
                        crate::rollback::rollback_to_snapshot(inst_id, *pid, s.as_ref(), None, false)
                            .await?;
                    }
                }
                partn_snaps = None;
                break 'partitions;
            }

            tree_ts = Some(info.ts.clone());
            ps.slices
                .insert(slice.id(), SliceSnapshot::new(slice.id(), handle));
        }
        if let Some(map) = partn_snaps.as_mut() {
            map.insert(*partn_id, ps);
        }
    }

    let keyspace = ctx
        .instance(inst_id)
        .map(|i| i.defn.keyspace.clone())
        .unwrap_or_else(|| KeyspaceId::new(""));
    let num_vb = ctx.config().num_vbuckets;

    let snapshot = match (partn_snaps, tree_ts) {
        (Some(map), Some(ts)) if !map.is_empty() => {
            IndexSnapshot::new(inst_id, ts, map, ctx.next_snap_id())
        }
        _ => {
            tracing::info!(inst = %inst_id, "installing epoch snapshot");
            IndexSnapshot::epoch(inst_id, TsVector::new(keyspace, num_vb), ctx.next_snap_id())
        }
    };

    let clone = snapshot.clone_snapshot();
    {
        let _guard = ctx.lock_maps();
        let mut snap_map = (*ctx.snapshots()).clone();
        snap_map.insert(inst_id, Arc::new(SnapshotContainer::new(snapshot)));
        ctx.set_snapshots(snap_map);
    }
    notify.publish(inst_id, SnapshotEvent::Created(clone));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PartitionInstance;
    use crate::mem::MemSlice;
    use crate::slice::SnapshotInfo;
    use kestrel_common::config::CoreConfig;
    use kestrel_common::timestamp::SnapshotType;
    use kestrel_common::types::{
        DefnId, IndexDefn, IndexInstance, IndexState, PartitionId, SliceId,
    };

    fn ts(seq: u64, snap_type: SnapshotType) -> TsVector {
        let mut t = TsVector::new(KeyspaceId::new("b"), 1);
        t.seqnos = vec![seq];
        t.snap_type = snap_type;
        t
    }

    fn ctx_with_instance(slice: Arc<MemSlice>) -> Arc<CoreContext> {
        let mut cfg = CoreConfig::default();
        cfg.num_vbuckets = 1;
        let ctx = CoreContext::new(cfg);
        let inst = IndexInstance {
            inst_id: InstanceId(1),
            defn: IndexDefn {
                defn_id: DefnId(1),
                name: "idx".into(),
                keyspace: KeyspaceId::new("b"),
                is_primary: false,
                is_array: false,
                sec_exprs: vec!["a".into()],
                desc: vec![],
                where_clause: None,
            },
            state: IndexState::Active,
            stream: StreamId::Maint,
        };
        let mut instances = HashMap::new();
        instances.insert(InstanceId(1), inst);
        ctx.set_instances(instances);

        let mut partn_map = PartitionMap::new();
        partn_map.insert(
            PartitionId(0),
            PartitionInstance::new(PartitionId(0), vec![slice as Arc<dyn crate::slice::Slice>]),
        );
        let mut partitions = HashMap::new();
        partitions.insert(InstanceId(1), partn_map);
        ctx.set_partitions(partitions);
        ctx
    }

    #[tokio::test]
    async fn test_rebuild_opens_newest_snapshot() {
        let slice = MemSlice::new(SliceId(0));
        slice.seed_snapshot(SnapshotInfo {
            ts: ts(10, SnapshotType::Disk),
            committed: true,
        });
        slice.seed_snapshot(SnapshotInfo {
            ts: ts(20, SnapshotType::Disk),
            committed: true,
        });
        let ctx = ctx_with_instance(slice.clone());
        let notify = NotifyFanout::new(1, 8);

        rebuild_snapshots(&ctx, None, None, &notify).await.unwrap();

        let snap_map = ctx.snapshots();
        let container = snap_map.get(&InstanceId(1)).unwrap();
        assert_eq!(container.current_ts().seqnos, vec![20]);
        assert_eq!(slice.total_snapshot_refs(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_without_snapshots_installs_epoch() {
        let slice = MemSlice::new(SliceId(0));
        let ctx = ctx_with_instance(slice);
        let notify = NotifyFanout::new(1, 8);

        rebuild_snapshots(&ctx, None, None, &notify).await.unwrap();

        let snap_map = ctx.snapshots();
        let container = snap_map.get(&InstanceId(1)).unwrap();
        let snap = container.clone_current().unwrap();
        assert!(snap.epoch);
        assert!(snap.partitions.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_oso_reverts_to_zero() {
        let slice = MemSlice::new(SliceId(0));
        slice.seed_snapshot(SnapshotInfo {
            ts: ts(10, SnapshotType::DiskOso),
            committed: true,
        });
        let ctx = ctx_with_instance(slice.clone());
        let notify = NotifyFanout::new(1, 8);

        rebuild_snapshots(&ctx, None, None, &notify).await.unwrap();

        assert_eq!(slice.rollback_to_zero_count(), 1);
        let snap_map = ctx.snapshots();
        assert!(snap_map
            .get(&InstanceId(1))
            .unwrap()
            .clone_current()
            .unwrap()
            .epoch);
    }
}
