//! The slice capability boundary.
//!
//! A [`Slice`] is one storage shard of a partition: the unit of snapshot
//! creation and rollback. The coordinator never sees storage internals; it
//! drives slices through this trait and holds storage snapshots only through
//! refcounted [`SnapshotRef`] guards.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use kestrel_common::timestamp::TsVector;
use kestrel_common::types::SliceId;
use kestrel_common::KestrelResult;

/// Descriptor of a snapshot a slice has materialized.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub ts: TsVector,
    /// True when the snapshot was committed to stable storage.
    pub committed: bool,
}

impl SnapshotInfo {
    /// Out-of-sequence-order snapshots are never valid rollback targets.
    pub fn is_oso(&self) -> bool {
        self.ts.snap_type.is_oso()
    }
}

impl fmt::Display for SnapshotInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snapinfo(crc64={}, committed={}, type={:?})",
            self.ts.crc64, self.committed, self.ts.snap_type
        )
    }
}

/// An open, refcounted storage snapshot.
///
/// `open` and `close` adjust the storage-level reference count; the snapshot
/// stays reclaimable-never while the count is above zero.
pub trait StorageSnapshot: Send + Sync {
    fn info(&self) -> SnapshotInfo;
    fn timestamp(&self) -> TsVector;
    fn open(&self);
    fn close(&self);
    fn ref_count(&self) -> u64;
}

/// Owning guard over one reference to a [`StorageSnapshot`].
///
/// Cloning a guard bumps the storage refcount; dropping it releases exactly
/// one reference. Passing a `SnapshotRef` by value transfers ownership of the
/// reference, which is what keeps the release-exactly-once discipline a
/// compile-time property instead of a convention.
pub struct SnapshotRef {
    snap: Arc<dyn StorageSnapshot>,
}

impl SnapshotRef {
    /// Adopt an already-counted reference (e.g. the one `open_snapshot`
    /// returns).
    pub fn adopt(snap: Arc<dyn StorageSnapshot>) -> Self {
        SnapshotRef { snap }
    }

    /// Take an additional reference on the same storage snapshot.
    pub fn clone_ref(&self) -> Self {
        self.snap.open();
        SnapshotRef {
            snap: Arc::clone(&self.snap),
        }
    }

    pub fn timestamp(&self) -> TsVector {
        self.snap.timestamp()
    }

    pub fn info(&self) -> SnapshotInfo {
        self.snap.info()
    }

    pub fn ref_count(&self) -> u64 {
        self.snap.ref_count()
    }
}

impl Drop for SnapshotRef {
    fn drop(&mut self) {
        self.snap.close();
    }
}

impl fmt::Debug for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotRef(refs={})", self.snap.ref_count())
    }
}

/// Storage statistics reported by a slice.
#[derive(Debug, Clone, Default)]
pub struct SliceStats {
    pub data_size: i64,
    pub data_size_on_disk: i64,
    pub log_space: i64,
    pub disk_size: i64,
    pub mem_used: i64,
    pub get_bytes: i64,
    pub insert_bytes: i64,
    pub delete_bytes: i64,
    pub extra_snap_data_size: i64,
}

impl SliceStats {
    /// Fraction of log space not occupied by live data.
    pub fn fragmentation(&self) -> f64 {
        if self.log_space <= 0 {
            return 0.0;
        }
        let wasted = if self.data_size_on_disk != 0 && self.log_space > self.data_size_on_disk {
            self.log_space - self.data_size_on_disk
        } else {
            0
        };
        wasted as f64 * 100.0 / self.log_space as f64
    }
}

/// Abstract per-partition storage capability.
///
/// Async methods are the suspension points of the coordinator; none of them
/// is ever called under a snapshot container lock. `get_snapshots` returns
/// descriptors newest-first.
#[async_trait]
pub trait Slice: Send + Sync {
    fn id(&self) -> SliceId;

    /// Materialize a new snapshot at `ts`, committing when asked.
    async fn new_snapshot(&self, ts: &TsVector, commit: bool) -> KestrelResult<SnapshotInfo>;

    /// Open a snapshot for reading; the returned guard owns one reference.
    async fn open_snapshot(&self, info: &SnapshotInfo) -> KestrelResult<SnapshotRef>;

    /// Descriptors of all retained snapshots, newest first.
    async fn get_snapshots(&self) -> KestrelResult<Vec<SnapshotInfo>>;

    /// Revert the slice's contents to `info`.
    async fn rollback(&self, info: &SnapshotInfo) -> KestrelResult<()>;

    /// Discard everything; the slice restarts from an empty state.
    async fn rollback_to_zero(&self) -> KestrelResult<()>;

    /// Mutations arrived since the last commit.
    fn is_dirty(&self) -> bool;

    /// Hook called when a flush batch has fully drained into the slice.
    fn flush_done(&self);

    fn last_rollback_ts(&self) -> Option<TsVector>;
    fn set_last_rollback_ts(&self, ts: Option<TsVector>);

    fn incr_ref(&self);
    fn decr_ref(&self);
    /// Take a reference unless the slice is already being torn down.
    fn check_and_incr_ref(&self) -> bool;

    async fn statistics(&self, consumer_filter: u64) -> KestrelResult<SliceStats>;

    async fn compact(&self, deadline: Instant, min_frag: f64) -> KestrelResult<()>;
}
