//! Scan-freshness waiters.
//!
//! A waiter is a suspended snapshot request: it parks until a published
//! snapshot satisfies its consistency predicate, its deadline passes, or the
//! instance goes away. Replies travel over oneshot channels, so a drain never
//! blocks; a reply whose receiver is gone is simply dropped (the cloned
//! snapshot's references are released on drop).

use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use kestrel_common::consistency::{is_snapshot_consistent, Consistency};
use kestrel_common::error::ScanError;
use kestrel_common::timestamp::TsVector;
use kestrel_common::types::InstanceId;
use kestrel_common::{KestrelError, KestrelResult};

use crate::snapshot::IndexSnapshot;

/// A parked snapshot request.
pub struct SnapshotWaiter {
    pub inst_id: InstanceId,
    pub ts: Option<TsVector>,
    pub cons: Consistency,
    pub expires_at: Option<Instant>,
    reply: oneshot::Sender<KestrelResult<IndexSnapshot>>,
}

impl SnapshotWaiter {
    pub fn new(
        inst_id: InstanceId,
        ts: Option<TsVector>,
        cons: Consistency,
        expires_at: Option<Instant>,
        reply: oneshot::Sender<KestrelResult<IndexSnapshot>>,
    ) -> Self {
        SnapshotWaiter {
            inst_id,
            ts,
            cons,
            expires_at,
            reply,
        }
    }

    fn notify(self, snap: IndexSnapshot) {
        let _ = self.reply.send(Ok(snap));
    }

    fn error(self, err: KestrelError) {
        let _ = self.reply.send(Err(err));
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|d| now >= d).unwrap_or(false)
    }
}

/// Outcome counts of a publish walk, for stats accounting.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub delivered: usize,
    pub expired: usize,
    pub kept: usize,
}

/// Per-instance list of pending waiters under its own lock.
#[derive(Default)]
pub struct WaiterContainer {
    waiters: Mutex<Vec<SnapshotWaiter>>,
}

impl WaiterContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, w: SnapshotWaiter) {
        self.waiters.lock().push(w);
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Walk waiters against a freshly published snapshot: expired waiters get
    /// `ScanTimedOut`, satisfied waiters get a clone, the rest stay parked.
    pub fn notify_publish(&self, snap: &IndexSnapshot, now: Instant) -> NotifyOutcome {
        let mut outcome = NotifyOutcome::default();
        let mut guard = self.waiters.lock();
        let pending = std::mem::take(&mut *guard);
        for w in pending {
            if w.expired(now) {
                tracing::debug!(inst = %w.inst_id, "waiter expired at publish");
                w.error(ScanError::ScanTimedOut.into());
                outcome.expired += 1;
            } else if is_snapshot_consistent(&snap.ts, w.cons, w.ts.as_ref()) {
                w.notify(snap.clone_snapshot());
                outcome.delivered += 1;
            } else {
                guard.push(w);
                outcome.kept += 1;
            }
        }
        outcome
    }

    /// Resolve every pending waiter with an error built by `mk`.
    pub fn drain_with_error(&self, mk: impl Fn() -> KestrelError) -> usize {
        let pending = std::mem::take(&mut *self.waiters.lock());
        let n = pending.len();
        for w in pending {
            w.error(mk());
        }
        n
    }
}
