//! Opaque counters the coordinator maintains.
//!
//! The full latency/histogram stats subsystem lives outside the core; these
//! are the plain counters the core itself bumps. Per-instance entries live in
//! a concurrent map so snapshot worker shards can update them without
//! coordination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use kestrel_common::types::{InstanceId, KeyspaceId, StreamId};

#[derive(Default)]
pub struct InstanceStats {
    pub num_snapshots: AtomicU64,
    pub num_commits: AtomicU64,
    pub num_snapshot_waiters: AtomicI64,
    pub num_last_snapshot_reply: AtomicI64,
    pub num_compactions: AtomicU64,
}

impl InstanceStats {
    pub fn snapshots(&self) -> u64 {
        self.num_snapshots.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.num_commits.load(Ordering::Relaxed)
    }

    pub fn waiters(&self) -> i64 {
        self.num_snapshot_waiters.load(Ordering::Relaxed)
    }
}

/// Per-(stream, keyspace) counters, swapped wholesale by the supervisor.
#[derive(Default)]
pub struct KeyspaceStats {
    pub num_rollbacks: AtomicU64,
    pub num_rollbacks_to_zero: AtomicU64,
    pub last_snap_done_ns: AtomicU64,
}

pub type KeyspaceStatsMap = HashMap<(StreamId, KeyspaceId), Arc<KeyspaceStats>>;

#[derive(Default)]
pub struct CoreStats {
    instances: DashMap<InstanceId, Arc<InstanceStats>>,
    keyspaces: RwLock<Arc<KeyspaceStatsMap>>,
    pub num_rollbacks: AtomicU64,
    pub num_rollbacks_to_zero: AtomicU64,
    pub num_flushes: AtomicU64,
    pub num_nonzero_notify_drops: AtomicU64,
}

impl CoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-instance counters, created on first touch.
    pub fn for_instance(&self, inst: InstanceId) -> Arc<InstanceStats> {
        self.instances
            .entry(inst)
            .or_insert_with(|| Arc::new(InstanceStats::default()))
            .clone()
    }

    pub fn remove_instance(&self, inst: InstanceId) {
        self.instances.remove(&inst);
    }

    /// Atomically swap in a new keyspace stats map.
    pub fn set_keyspace_stats_map(&self, m: KeyspaceStatsMap) {
        *self.keyspaces.write() = Arc::new(m);
    }

    pub fn keyspace_stats(&self, stream: StreamId, keyspace: &KeyspaceId) -> Option<Arc<KeyspaceStats>> {
        self.keyspaces
            .read()
            .get(&(stream, keyspace.clone()))
            .cloned()
    }

    pub fn rollbacks(&self) -> u64 {
        self.num_rollbacks.load(Ordering::Relaxed)
    }

    pub fn rollbacks_to_zero(&self) -> u64 {
        self.num_rollbacks_to_zero.load(Ordering::Relaxed)
    }
}
