//! In-memory slice implementation.
//!
//! Backs unit and integration tests and embedders that want the coordinator
//! without a disk engine. Snapshots are descriptor-only; the refcount
//! semantics are identical to the on-disk engines.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use kestrel_common::error::StorageError;
use kestrel_common::timestamp::TsVector;
use kestrel_common::types::SliceId;
use kestrel_common::KestrelResult;

use crate::slice::{Slice, SliceStats, SnapshotInfo, SnapshotRef, StorageSnapshot};

/// A snapshot retained by a [`MemSlice`].
pub struct MemSnapshot {
    info: SnapshotInfo,
    refs: AtomicU64,
}

impl MemSnapshot {
    fn new(info: SnapshotInfo) -> Self {
        MemSnapshot {
            info,
            refs: AtomicU64::new(0),
        }
    }
}

impl StorageSnapshot for MemSnapshot {
    fn info(&self) -> SnapshotInfo {
        self.info.clone()
    }

    fn timestamp(&self) -> TsVector {
        self.info.ts.clone()
    }

    fn open(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "storage snapshot refcount underflow");
    }

    fn ref_count(&self) -> u64 {
        self.refs.load(Ordering::SeqCst)
    }
}

struct MemSliceState {
    snapshots: Vec<Arc<MemSnapshot>>,
    dirty: bool,
    last_rollback_ts: Option<TsVector>,
    rollbacks: u64,
    rollbacks_to_zero: u64,
}

/// In-memory [`Slice`].
pub struct MemSlice {
    id: SliceId,
    state: Mutex<MemSliceState>,
    refs: AtomicU64,
    tearing_down: AtomicBool,
    snapshots_created: AtomicU64,
    fail_next_snapshot: AtomicBool,
}

impl MemSlice {
    pub fn new(id: SliceId) -> Arc<Self> {
        Arc::new(MemSlice {
            id,
            state: Mutex::new(MemSliceState {
                snapshots: Vec::new(),
                dirty: false,
                last_rollback_ts: None,
                rollbacks: 0,
                rollbacks_to_zero: 0,
            }),
            refs: AtomicU64::new(1),
            tearing_down: AtomicBool::new(false),
            snapshots_created: AtomicU64::new(0),
            fail_next_snapshot: AtomicBool::new(false),
        })
    }

    /// Mark the slice dirty, as a drained mutation batch would.
    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    /// Pre-seed a retained snapshot (newest-first order is maintained).
    pub fn seed_snapshot(&self, info: SnapshotInfo) {
        let mut st = self.state.lock();
        st.snapshots.insert(0, Arc::new(MemSnapshot::new(info)));
    }

    /// Number of snapshots materialized through `new_snapshot`.
    pub fn snapshots_created(&self) -> u64 {
        self.snapshots_created.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.state.lock().rollbacks
    }

    pub fn rollback_to_zero_count(&self) -> u64 {
        self.state.lock().rollbacks_to_zero
    }

    /// Make the next `new_snapshot` call fail, to exercise the skip path.
    pub fn fail_next_snapshot(&self) {
        self.fail_next_snapshot.store(true, Ordering::SeqCst);
    }

    /// Total outstanding references across all retained snapshots.
    pub fn total_snapshot_refs(&self) -> u64 {
        self.state
            .lock()
            .snapshots
            .iter()
            .map(|s| s.ref_count())
            .sum()
    }
}

#[async_trait]
impl Slice for MemSlice {
    fn id(&self) -> SliceId {
        self.id
    }

    async fn new_snapshot(&self, ts: &TsVector, commit: bool) -> KestrelResult<SnapshotInfo> {
        if self.fail_next_snapshot.swap(false, Ordering::SeqCst) {
            return Err(StorageError::SnapshotCreate {
                slice: self.id.to_string(),
                reason: "injected failure".into(),
            }
            .into());
        }
        let info = SnapshotInfo {
            ts: ts.clone(),
            committed: commit,
        };
        let mut st = self.state.lock();
        st.snapshots.insert(0, Arc::new(MemSnapshot::new(info.clone())));
        st.dirty = false;
        self.snapshots_created.fetch_add(1, Ordering::SeqCst);
        Ok(info)
    }

    async fn open_snapshot(&self, info: &SnapshotInfo) -> KestrelResult<SnapshotRef> {
        let st = self.state.lock();
        let found = st
            .snapshots
            .iter()
            .find(|s| s.info.ts.equal(&info.ts) && s.info.ts.snap_type == info.ts.snap_type);
        match found {
            Some(s) => {
                s.open();
                Ok(SnapshotRef::adopt(Arc::clone(s) as Arc<dyn StorageSnapshot>))
            }
            None => Err(StorageError::Corrupted(format!(
                "{}: snapshot not found for {}",
                self.id, info
            ))
            .into()),
        }
    }

    async fn get_snapshots(&self) -> KestrelResult<Vec<SnapshotInfo>> {
        Ok(self.state.lock().snapshots.iter().map(|s| s.info.clone()).collect())
    }

    async fn rollback(&self, info: &SnapshotInfo) -> KestrelResult<()> {
        let mut st = self.state.lock();
        let pos = st.snapshots.iter().position(|s| s.info.ts.equal(&info.ts));
        match pos {
            Some(p) => {
                // Everything newer than the target is discarded.
                st.snapshots.drain(..p);
                st.rollbacks += 1;
                st.dirty = false;
                Ok(())
            }
            None => Err(StorageError::RollbackFailed(format!(
                "{}: no retained snapshot matches {}",
                self.id, info
            ))
            .into()),
        }
    }

    async fn rollback_to_zero(&self) -> KestrelResult<()> {
        let mut st = self.state.lock();
        st.snapshots.clear();
        st.rollbacks_to_zero += 1;
        st.dirty = false;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    fn flush_done(&self) {}

    fn last_rollback_ts(&self) -> Option<TsVector> {
        self.state.lock().last_rollback_ts.clone()
    }

    fn set_last_rollback_ts(&self, ts: Option<TsVector>) {
        self.state.lock().last_rollback_ts = ts;
    }

    fn incr_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn decr_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    fn check_and_incr_ref(&self) -> bool {
        if self.tearing_down.load(Ordering::SeqCst) {
            return false;
        }
        self.refs.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn statistics(&self, _consumer_filter: u64) -> KestrelResult<SliceStats> {
        let st = self.state.lock();
        Ok(SliceStats {
            data_size: st.snapshots.len() as i64 * 1024,
            ..Default::default()
        })
    }

    async fn compact(&self, _deadline: Instant, _min_frag: f64) -> KestrelResult<()> {
        Ok(())
    }
}
