//! Rollback suite: snapshot selection, zero rewind, waiter draining,
//! restart-ts validation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kestrel_common::config::CoreConfig;
use kestrel_common::consistency::Consistency;
use kestrel_common::error::{KestrelError, ScanError};
use kestrel_common::timestamp::{SnapshotType, TsVector};
use kestrel_common::types::{
    DefnId, IndexDefn, IndexInstance, IndexState, InstanceId, KeyspaceId, PartitionId, SliceId,
    StreamId,
};
use kestrel_common::KestrelResult;
use kestrel_storage::context::{CoreContext, InstanceMap, PartitionInstance, PartitionMap};
use kestrel_storage::manager::{StorageCommand, StorageManager, StorageManagerHandle, SupervisorEvent};
use kestrel_storage::mem::MemSlice;
use kestrel_storage::rollback::{FailoverLog, FailoverLogProvider};
use kestrel_storage::slice::{Slice, SnapshotInfo};

fn ts(seqnos: &[u64], snap_type: SnapshotType) -> TsVector {
    let mut t = TsVector::new(KeyspaceId::new("travel"), seqnos.len());
    t.seqnos = seqnos.to_vec();
    t.snap_type = snap_type;
    t
}

struct FixedFlog(FailoverLog);

#[async_trait]
impl FailoverLogProvider for FixedFlog {
    async fn failover_log(&self, _bucket: &str, _n: usize) -> KestrelResult<FailoverLog> {
        Ok(self.0.clone())
    }
}

fn instance(id: u64) -> IndexInstance {
    IndexInstance {
        inst_id: InstanceId(id),
        defn: IndexDefn {
            defn_id: DefnId(id),
            name: format!("idx_{id}"),
            keyspace: KeyspaceId::new("travel"),
            is_primary: false,
            is_array: false,
            sec_exprs: vec!["city".into()],
            desc: vec![],
            where_clause: None,
        },
        state: IndexState::Active,
        stream: StreamId::Maint,
    }
}

async fn setup(
    slice: Arc<MemSlice>,
    flog: FailoverLog,
) -> (
    Arc<CoreContext>,
    StorageManagerHandle,
    tokio::sync::mpsc::Receiver<SupervisorEvent>,
) {
    let mut cfg = CoreConfig::default();
    cfg.num_vbuckets = 1;
    cfg.cluster.failover_log_retries = 1;
    let ctx = CoreContext::new(cfg);
    let (handle, supv_rx, _join) =
        StorageManager::start(Arc::clone(&ctx), Arc::new(FixedFlog(flog))).unwrap();

    let mut instances = InstanceMap::new();
    instances.insert(InstanceId(1), instance(1));
    handle
        .cmd_tx
        .send(StorageCommand::UpdateInstanceMap { instances })
        .await
        .unwrap();

    let mut partn_map = PartitionMap::new();
    partn_map.insert(
        PartitionId(0),
        PartitionInstance::new(PartitionId(0), vec![slice as Arc<dyn Slice>]),
    );
    let mut partitions = HashMap::new();
    partitions.insert(InstanceId(1), partn_map);
    handle
        .cmd_tx
        .send(StorageCommand::UpdatePartitionMap { partitions })
        .await
        .unwrap();

    // Both map updates are applied once the partition map is visible.
    while ctx.partitions().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    (ctx, handle, supv_rx)
}

fn seeded_slice(seqs: &[u64], snap_type: SnapshotType) -> Arc<MemSlice> {
    let slice = MemSlice::new(SliceId(0));
    for s in seqs {
        slice.seed_snapshot(SnapshotInfo {
            ts: ts(&[*s], snap_type),
            committed: true,
        });
    }
    slice
}

async fn send_rollback(handle: &StorageManagerHandle, rollback_ts: TsVector, session_id: u64) {
    handle
        .cmd_tx
        .send(StorageCommand::Rollback {
            stream: StreamId::Maint,
            keyspace: KeyspaceId::new("travel"),
            rollback_ts,
            session_id,
        })
        .await
        .unwrap();
}

async fn expect_rollback_done(
    supv: &mut tokio::sync::mpsc::Receiver<SupervisorEvent>,
) -> (Option<TsVector>, u64, Option<String>) {
    match supv.recv().await.expect("supervisor channel closed") {
        SupervisorEvent::RollbackDone {
            restart_ts,
            session_id,
            error,
            ..
        } => (restart_ts, session_id, error),
        other => panic!("expected RollbackDone, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rollback_picks_newest_older_snapshot() {
    let slice = seeded_slice(&[10, 20, 30], SnapshotType::Disk);
    let (ctx, handle, mut supv) = setup(slice.clone(), FailoverLog::default()).await;

    let rollback_ts = ts(&[22], SnapshotType::Disk);
    send_rollback(&handle, rollback_ts.clone(), 7).await;
    let (restart, session, error) = expect_rollback_done(&mut supv).await;

    assert!(error.is_none());
    assert_eq!(session, 7);
    let restart = restart.expect("expected a restart timestamp");
    assert_eq!(restart.seqnos, vec![20]);
    // The restart position never overshoots the requested rollback point.
    assert!(rollback_ts.equal_or_greater(&restart, false));

    assert_eq!(slice.rollback_count(), 1);
    // Containers were rebuilt from the surviving snapshot.
    let snap_map = ctx.snapshots();
    assert_eq!(
        snap_map.get(&InstanceId(1)).unwrap().current_ts().seqnos,
        vec![20]
    );
}

#[tokio::test]
async fn test_rollback_to_zero_when_only_oso_snapshots() {
    let slice = seeded_slice(&[10, 20, 30], SnapshotType::DiskOso);
    let (ctx, handle, mut supv) = setup(slice.clone(), FailoverLog::default()).await;

    send_rollback(&handle, ts(&[22], SnapshotType::Disk), 8).await;
    let (restart, session, error) = expect_rollback_done(&mut supv).await;

    assert!(error.is_none());
    assert_eq!(session, 8);
    assert!(restart.is_none(), "OSO snapshots force a zero restart");
    assert!(slice.rollback_to_zero_count() >= 1);

    let snap_map = ctx.snapshots();
    let snap = snap_map
        .get(&InstanceId(1))
        .unwrap()
        .clone_current()
        .unwrap();
    assert!(snap.epoch);
}

#[tokio::test]
async fn test_rollback_drains_waiters_with_rolled_back() {
    let slice = seeded_slice(&[10, 20], SnapshotType::Disk);
    let (_ctx, handle, mut supv) = setup(slice, FailoverLog::default()).await;

    let h2 = handle.clone();
    let waiter = tokio::spawn(async move {
        h2.wait_for_snapshot(
            InstanceId(1),
            Some(ts(&[99], SnapshotType::None)),
            Consistency::Query,
            Some(Duration::from_secs(10)),
            None,
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    send_rollback(&handle, ts(&[15], SnapshotType::Disk), 9).await;
    expect_rollback_done(&mut supv).await;

    let err = waiter.await.unwrap().unwrap_err();
    assert!(
        matches!(err, KestrelError::Scan(ScanError::IndexRolledBack)),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_restart_ts_validated_against_failover_log() {
    let slice = seeded_slice(&[10, 20], SnapshotType::Disk);
    // The upstream's oldest branch for this position is vbuuid 77.
    let flog = FailoverLog {
        vbs: vec![vec![(77, 0)]],
    };
    let (_ctx, handle, mut supv) = setup(slice, flog).await;

    send_rollback(&handle, ts(&[15], SnapshotType::Disk), 1).await;
    let (restart, _, error) = expect_rollback_done(&mut supv).await;

    assert!(error.is_none());
    let restart = restart.unwrap();
    assert_eq!(restart.seqnos, vec![10]);
    assert_eq!(restart.vbuuids, vec![77], "vbuuid replaced from failover log");
    assert!(restart.epoch_manifest);
}

#[tokio::test]
async fn test_zero_seqno_rollback_steps_past_last_used() {
    let slice = seeded_slice(&[10, 20], SnapshotType::Disk);
    slice.set_last_rollback_ts(Some(ts(&[20], SnapshotType::Disk)));
    let (_ctx, handle, mut supv) = setup(slice.clone(), FailoverLog::default()).await;

    send_rollback(&handle, ts(&[0], SnapshotType::Disk), 2).await;
    let (restart, _, error) = expect_rollback_done(&mut supv).await;

    assert!(error.is_none());
    let restart = restart.unwrap();
    assert_eq!(restart.seqnos, vec![10]);
    // A zero-seqno rewind remembers the pick for the next attempt.
    assert_eq!(slice.last_rollback_ts().unwrap().seqnos, vec![10]);
}

#[tokio::test]
async fn test_rollback_counters() {
    let slice = seeded_slice(&[10], SnapshotType::DiskOso);
    let (ctx, handle, mut supv) = setup(slice, FailoverLog::default()).await;

    send_rollback(&handle, ts(&[5], SnapshotType::Disk), 3).await;
    expect_rollback_done(&mut supv).await;

    assert_eq!(ctx.stats.rollbacks(), 1);
    assert_eq!(ctx.stats.rollbacks_to_zero(), 1);
}
