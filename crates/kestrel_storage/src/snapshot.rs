//! The snapshot tree: instance → partition → slice.
//!
//! An [`IndexSnapshot`] is an immutable, refcount-correct view of one index
//! instance at one timestamp. Cloning the tree bumps every slice-level
//! storage refcount; dropping it releases every reference exactly once.
//! Nothing in the tree points back at containers or maps; upward navigation
//! always goes through the instance and partition ids.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use kestrel_common::timestamp::TsVector;
use kestrel_common::types::{InstanceId, PartitionId, SliceId};

use crate::slice::SnapshotRef;

/// One slice's open storage snapshot inside the tree.
#[derive(Debug)]
pub struct SliceSnapshot {
    pub slice_id: SliceId,
    pub snap: SnapshotRef,
}

impl SliceSnapshot {
    pub fn new(slice_id: SliceId, snap: SnapshotRef) -> Self {
        SliceSnapshot { slice_id, snap }
    }

    fn clone_snapshot(&self) -> SliceSnapshot {
        SliceSnapshot {
            slice_id: self.slice_id,
            snap: self.snap.clone_ref(),
        }
    }
}

/// All slice snapshots of one partition.
#[derive(Debug)]
pub struct PartitionSnapshot {
    pub partition_id: PartitionId,
    pub slices: HashMap<SliceId, SliceSnapshot>,
}

impl PartitionSnapshot {
    pub fn new(partition_id: PartitionId) -> Self {
        PartitionSnapshot {
            partition_id,
            slices: HashMap::new(),
        }
    }

    fn clone_snapshot(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            partition_id: self.partition_id,
            slices: self
                .slices
                .iter()
                .map(|(id, s)| (*id, s.clone_snapshot()))
                .collect(),
        }
    }
}

/// Readable snapshot of an index instance.
#[derive(Debug)]
pub struct IndexSnapshot {
    pub inst_id: InstanceId,
    pub ts: TsVector,
    pub partitions: HashMap<PartitionId, PartitionSnapshot>,
    /// True for the placeholder installed before the first flush.
    pub epoch: bool,
    pub snap_id: u64,
    pub creation_time: u64,
}

impl IndexSnapshot {
    pub fn new(
        inst_id: InstanceId,
        ts: TsVector,
        partitions: HashMap<PartitionId, PartitionSnapshot>,
        snap_id: u64,
    ) -> Self {
        IndexSnapshot {
            inst_id,
            ts,
            partitions,
            epoch: false,
            snap_id,
            creation_time: now_nanos(),
        }
    }

    /// Placeholder snapshot for an instance with no flushed data yet. The
    /// zero timestamp hashes to crc64 == 0.
    pub fn epoch(inst_id: InstanceId, ts: TsVector, snap_id: u64) -> Self {
        IndexSnapshot {
            inst_id,
            ts,
            partitions: HashMap::new(),
            epoch: true,
            snap_id,
            creation_time: now_nanos(),
        }
    }

    /// Deep clone of the tree, bumping every slice storage refcount.
    pub fn clone_snapshot(&self) -> IndexSnapshot {
        self.deep_clone(None)
    }

    /// Deep clone restricted to `keep` partitions when given. Every cloned
    /// slice snapshot takes one extra storage reference; partitions outside
    /// `keep` are not referenced by the clone at all.
    pub fn deep_clone(&self, keep: Option<&[PartitionId]>) -> IndexSnapshot {
        let partitions = self
            .partitions
            .iter()
            .filter(|(id, _)| match keep {
                None => true,
                Some(keep) => keep.contains(id),
            })
            .map(|(id, p)| (*id, p.clone_snapshot()))
            .collect();
        IndexSnapshot {
            inst_id: self.inst_id,
            ts: self.ts.clone(),
            partitions,
            epoch: self.epoch,
            snap_id: self.snap_id,
            creation_time: now_nanos(),
        }
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Total slice snapshots across all partitions.
    pub fn slice_count(&self) -> usize {
        self.partitions.values().map(|p| p.slices.len()).sum()
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSlice;
    use crate::slice::Slice;
    use kestrel_common::timestamp::SnapshotType;
    use kestrel_common::types::KeyspaceId;

    async fn build_tree(num_partitions: u64) -> (Vec<std::sync::Arc<MemSlice>>, IndexSnapshot) {
        let mut slices = Vec::new();
        let mut partitions = HashMap::new();
        let mut ts = TsVector::new(KeyspaceId::new("b"), 1);
        ts.seqnos = vec![5];
        ts.snap_type = SnapshotType::Disk;

        for p in 0..num_partitions {
            let slice = MemSlice::new(SliceId(p));
            let info = slice.new_snapshot(&ts, true).await.unwrap();
            let h = slice.open_snapshot(&info).await.unwrap();
            let mut ps = PartitionSnapshot::new(PartitionId(p));
            ps.slices
                .insert(SliceId(p), SliceSnapshot::new(SliceId(p), h));
            partitions.insert(PartitionId(p), ps);
            slices.push(slice);
        }
        let is = IndexSnapshot::new(InstanceId(1), ts, partitions, 1);
        (slices, is)
    }

    #[tokio::test]
    async fn test_clone_bumps_every_slice_ref() {
        let (slices, is) = build_tree(3).await;
        for s in &slices {
            assert_eq!(s.total_snapshot_refs(), 1);
        }
        let clone = is.clone_snapshot();
        for s in &slices {
            assert_eq!(s.total_snapshot_refs(), 2);
        }
        drop(clone);
        for s in &slices {
            assert_eq!(s.total_snapshot_refs(), 1);
        }
    }

    #[tokio::test]
    async fn test_drop_releases_every_ref_exactly_once() {
        let (slices, is) = build_tree(2).await;
        drop(is);
        for s in &slices {
            assert_eq!(s.total_snapshot_refs(), 0);
        }
    }

    #[tokio::test]
    async fn test_pruned_clone_references_only_kept_partitions() {
        let (slices, is) = build_tree(3).await;
        let clone = is.deep_clone(Some(&[PartitionId(0), PartitionId(2)]));
        assert_eq!(clone.partition_ids(), vec![PartitionId(0), PartitionId(2)]);
        assert_eq!(slices[0].total_snapshot_refs(), 2);
        assert_eq!(slices[1].total_snapshot_refs(), 1);
        assert_eq!(slices[2].total_snapshot_refs(), 2);
        drop(clone);
        drop(is);
        for s in &slices {
            assert_eq!(s.total_snapshot_refs(), 0);
        }
    }

    #[tokio::test]
    async fn test_empty_keep_set_clones_no_partitions() {
        let (slices, is) = build_tree(2).await;
        let clone = is.deep_clone(Some(&[]));
        assert!(clone.partitions.is_empty());
        for s in &slices {
            assert_eq!(s.total_snapshot_refs(), 1);
        }
    }

    #[test]
    fn test_epoch_snapshot_has_zero_crc() {
        let ts = TsVector::new(KeyspaceId::new("b"), 4);
        let is = IndexSnapshot::epoch(InstanceId(9), ts, 0);
        assert!(is.epoch);
        assert_eq!(is.ts.crc64, 0);
        assert!(is.partitions.is_empty());
    }
}
