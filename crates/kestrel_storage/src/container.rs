//! Per-instance snapshot cell.
//!
//! A [`SnapshotContainer`] holds the current readable snapshot of one index
//! instance plus a `deleted` flag, and serialises publish against destroy.
//! The lock is held only long enough to clone or swap the snapshot; no slice
//! call ever happens under it.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use kestrel_common::timestamp::TsVector;

use crate::snapshot::IndexSnapshot;

struct ContainerInner {
    current: IndexSnapshot,
    deleted: bool,
}

pub struct SnapshotContainer {
    inner: Mutex<ContainerInner>,
    creation_time: u64,
}

impl SnapshotContainer {
    pub fn new(initial: IndexSnapshot) -> Self {
        SnapshotContainer {
            inner: Mutex::new(ContainerInner {
                current: initial,
                deleted: false,
            }),
            creation_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
        }
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    /// Clone of the current snapshot, bumping slice refcounts. `None` when
    /// the container belongs to a deleted instance.
    pub fn clone_current(&self) -> Option<IndexSnapshot> {
        let inner = self.inner.lock();
        if inner.deleted {
            return None;
        }
        Some(inner.current.clone_snapshot())
    }

    /// Timestamp of the current snapshot.
    pub fn current_ts(&self) -> TsVector {
        self.inner.lock().current.ts.clone()
    }

    /// Swap in a new snapshot. The previous one is dropped under the lock,
    /// releasing its slice references. Returns false (and releases `next`)
    /// when the container was already marked deleted.
    pub fn publish(&self, next: IndexSnapshot) -> bool {
        let mut inner = self.inner.lock();
        if inner.deleted {
            return false;
        }
        inner.current = next;
        true
    }

    /// Mark the container deleted and release the current snapshot's
    /// references, replacing it with `tombstone` (an epoch placeholder).
    pub fn mark_deleted(&self, tombstone: IndexSnapshot) {
        let mut inner = self.inner.lock();
        inner.current = tombstone;
        inner.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().deleted
    }

    /// Run `f` with the current snapshot under the container lock. Used by
    /// merge validation, which must see a stable pair of containers.
    pub fn with_current<R>(&self, f: impl FnOnce(&IndexSnapshot, bool) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.current, inner.deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSlice;
    use crate::slice::Slice;
    use crate::snapshot::{PartitionSnapshot, SliceSnapshot};
    use kestrel_common::timestamp::SnapshotType;
    use kestrel_common::types::{InstanceId, KeyspaceId, PartitionId, SliceId};
    use std::collections::HashMap;

    async fn snapshot_with_slice(seq: u64) -> (std::sync::Arc<MemSlice>, IndexSnapshot) {
        let slice = MemSlice::new(SliceId(0));
        let mut ts = TsVector::new(KeyspaceId::new("b"), 1);
        ts.seqnos = vec![seq];
        ts.snap_type = SnapshotType::Disk;
        let info = slice.new_snapshot(&ts, true).await.unwrap();
        let h = slice.open_snapshot(&info).await.unwrap();
        let mut ps = PartitionSnapshot::new(PartitionId(0));
        ps.slices.insert(SliceId(0), SliceSnapshot::new(SliceId(0), h));
        let mut partitions = HashMap::new();
        partitions.insert(PartitionId(0), ps);
        (slice, IndexSnapshot::new(InstanceId(1), ts, partitions, 1))
    }

    fn epoch(inst: InstanceId) -> IndexSnapshot {
        IndexSnapshot::epoch(inst, TsVector::new(KeyspaceId::new("b"), 1), 0)
    }

    #[tokio::test]
    async fn test_publish_releases_previous() {
        let (slice_a, snap_a) = snapshot_with_slice(5).await;
        let (slice_b, snap_b) = snapshot_with_slice(9).await;
        let c = SnapshotContainer::new(snap_a);
        assert_eq!(slice_a.total_snapshot_refs(), 1);

        assert!(c.publish(snap_b));
        assert_eq!(slice_a.total_snapshot_refs(), 0);
        assert_eq!(slice_b.total_snapshot_refs(), 1);
        assert_eq!(c.current_ts().seqnos, vec![9]);
    }

    #[tokio::test]
    async fn test_clone_current_bumps_refs() {
        let (slice, snap) = snapshot_with_slice(5).await;
        let c = SnapshotContainer::new(snap);
        let clone = c.clone_current().unwrap();
        assert_eq!(slice.total_snapshot_refs(), 2);
        drop(clone);
        assert_eq!(slice.total_snapshot_refs(), 1);
    }

    #[tokio::test]
    async fn test_deleted_container_rejects_reads_and_publishes() {
        let (slice, snap) = snapshot_with_slice(5).await;
        let c = SnapshotContainer::new(snap);
        c.mark_deleted(epoch(InstanceId(1)));
        assert!(c.is_deleted());
        assert_eq!(slice.total_snapshot_refs(), 0);
        assert!(c.clone_current().is_none());

        let (slice_b, snap_b) = snapshot_with_slice(9).await;
        assert!(!c.publish(snap_b));
        // The rejected snapshot was dropped, releasing its references.
        assert_eq!(slice_b.total_snapshot_refs(), 0);
    }
}
