//! Snapshot notification fan-out.
//!
//! Downstream scan pipelines subscribe to per-shard queues keyed by
//! `instance_id mod N`. The queues are bounded with drop-oldest semantics: a
//! slow consumer sees the newer of two rapidly successive snapshots and never
//! stalls the lifecycle manager. Waiters remain the authoritative delivery
//! path; dropped notifications are only counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use kestrel_common::types::InstanceId;

use crate::snapshot::IndexSnapshot;

/// Event published to downstream listeners. The consumer owns any snapshot it
/// receives; dropping it releases the slice references.
#[derive(Debug)]
pub enum SnapshotEvent {
    Created(IndexSnapshot),
    Deleted(InstanceId),
}

pub struct NotifyQueue {
    inner: Mutex<VecDeque<SnapshotEvent>>,
    cap: usize,
    bell: Notify,
    dropped: AtomicU64,
}

impl NotifyQueue {
    pub fn new(cap: usize) -> Self {
        NotifyQueue {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            cap: cap.max(1),
            bell: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an event, evicting the oldest when full. Never blocks.
    pub fn push(&self, ev: SnapshotEvent) {
        {
            let mut q = self.inner.lock();
            if q.len() >= self.cap {
                // The evicted snapshot's references are released on drop.
                q.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            q.push_back(ev);
        }
        self.bell.notify_one();
    }

    pub fn try_recv(&self) -> Option<SnapshotEvent> {
        self.inner.lock().pop_front()
    }

    pub async fn recv(&self) -> SnapshotEvent {
        loop {
            if let Some(ev) = self.try_recv() {
                return ev;
            }
            self.bell.notified().await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Per-shard fan-out, keyed by `instance_id mod shards`.
pub struct NotifyFanout {
    shards: Vec<Arc<NotifyQueue>>,
}

impl NotifyFanout {
    pub fn new(num_shards: usize, queue_cap: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| Arc::new(NotifyQueue::new(queue_cap)))
            .collect();
        NotifyFanout { shards }
    }

    pub fn shard_for(&self, inst: InstanceId) -> &Arc<NotifyQueue> {
        &self.shards[(inst.0 % self.shards.len() as u64) as usize]
    }

    pub fn publish(&self, inst: InstanceId, ev: SnapshotEvent) {
        self.shard_for(inst).push(ev);
    }

    pub fn shards(&self) -> &[Arc<NotifyQueue>] {
        &self.shards
    }

    pub fn total_dropped(&self) -> u64 {
        self.shards.iter().map(|s| s.dropped()).sum()
    }
}
