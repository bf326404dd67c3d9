//! Lifecycle suite: flush-driven snapshot creation, waiter delivery, reuse.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel_common::config::CoreConfig;
use kestrel_common::consistency::Consistency;
use kestrel_common::error::{KestrelError, ScanError};
use kestrel_common::timestamp::{SnapshotType, TsVector};
use kestrel_common::types::{
    DefnId, IndexDefn, IndexInstance, IndexState, InstanceId, KeyspaceId, PartitionId, SliceId,
    StreamId,
};
use kestrel_storage::context::{CoreContext, InstanceMap, PartitionInstance, PartitionMap};
use kestrel_storage::manager::{StorageCommand, StorageManager, StorageManagerHandle, SupervisorEvent};
use kestrel_storage::mem::MemSlice;
use kestrel_storage::rollback::NoopFailoverLog;
use kestrel_storage::slice::Slice;

fn ts(seqnos: &[u64], snap_type: SnapshotType) -> TsVector {
    let mut t = TsVector::new(KeyspaceId::new("travel"), seqnos.len());
    t.seqnos = seqnos.to_vec();
    t.snap_type = snap_type;
    t
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

async fn setup_one_instance() -> (
    Arc<CoreContext>,
    StorageManagerHandle,
    tokio::sync::mpsc::Receiver<SupervisorEvent>,
    Arc<MemSlice>,
) {
    let mut cfg = CoreConfig::default();
    cfg.num_vbuckets = 1;
    cfg.snapshot.num_workers = 2;
    let ctx = CoreContext::new(cfg);
    let (handle, supv_rx, _join) = StorageManager::start(Arc::clone(&ctx), Arc::new(NoopFailoverLog)).unwrap();

    let slice = MemSlice::new(SliceId(0));
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
        PartitionInstance::new(PartitionId(0), vec![slice.clone() as Arc<dyn Slice>]),
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

    (ctx, handle, supv_rx, slice)
}

fn drain_notifications(handle: &StorageManagerHandle) {
    for shard in handle.notify.shards() {
        while shard.try_recv().is_some() {}
    }
}

async fn flush(handle: &StorageManagerHandle, t: TsVector) {
    handle
        .cmd_tx
        .send(StorageCommand::FlushDone {
            stream: StreamId::Maint,
            keyspace: KeyspaceId::new("travel"),
            ts: t,
            aborted: false,
            has_all_stream_begins: false,
        })
        .await
        .unwrap();
}

async fn expect_snapshot_done(supv: &mut tokio::sync::mpsc::Receiver<SupervisorEvent>) -> TsVector {
    match supv.recv().await.expect("supervisor channel closed") {
        SupervisorEvent::SnapshotDone { ts, .. } => ts,
        other => panic!("expected SnapshotDone, got {other:?}"),
    }
}

#[tokio::test]
async fn test_flush_satisfies_parked_waiter() {
    let (_ctx, handle, mut supv, slice) = setup_one_instance().await;

    let h2 = handle.clone();
    let waiter = tokio::spawn(async move {
        h2.wait_for_snapshot(
            InstanceId(1),
            Some(ts(&[5], SnapshotType::None)),
            Consistency::Query,
            Some(Duration::from_secs(5)),
            None,
        )
        .await
    });
    // Let the request land in the registry before the flush publishes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    slice.mark_dirty();
    flush(&handle, ts(&[5], SnapshotType::Disk)).await;

    let done_ts = expect_snapshot_done(&mut supv).await;
    assert_eq!(done_ts.seqnos, vec![5]);

    let snap = waiter.await.unwrap().expect("waiter should be satisfied");
    assert_eq!(snap.ts.seqnos, vec![5]);
    // The flush timestamp flows through byte-for-byte.
    assert_eq!(snap.ts.vbuuids, done_ts.vbuuids);
    // The recorded hash matches the vbuuid vector.
    assert_eq!(snap.ts.crc64, snap.ts.hash_vbuuids());

    drain_notifications(&handle);
    assert_eq!(slice.total_snapshot_refs(), 2, "container + delivered clone");
    drop(snap);
    assert_eq!(slice.total_snapshot_refs(), 1, "container only");
}

#[tokio::test]
async fn test_waiter_times_out_without_satisfying_publish() {
    let (_ctx, handle, mut supv, slice) = setup_one_instance().await;

    let h2 = handle.clone();
    let start = Instant::now();
    let waiter = tokio::spawn(async move {
        h2.wait_for_snapshot(
            InstanceId(1),
            Some(ts(&[10], SnapshotType::None)),
            Consistency::Query,
            Some(Duration::from_millis(100)),
            None,
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    slice.mark_dirty();
    flush(&handle, ts(&[5], SnapshotType::Disk)).await;
    expect_snapshot_done(&mut supv).await;

    let err = waiter.await.unwrap().unwrap_err();
    let elapsed = start.elapsed();
    assert!(matches!(err, KestrelError::Scan(ScanError::ScanTimedOut)), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));

    // No snapshot leaked to the timed-out waiter.
    drain_notifications(&handle);
    assert_eq!(slice.total_snapshot_refs(), 1, "container only");
}

#[tokio::test]
async fn test_unchanged_flush_reuses_snapshot() {
    let (_ctx, handle, mut supv, slice) = setup_one_instance().await;

    slice.mark_dirty();
    flush(&handle, ts(&[5], SnapshotType::Disk)).await;
    expect_snapshot_done(&mut supv).await;
    assert_eq!(slice.snapshots_created(), 1);

    // Same timestamp again: the prior slice snapshot is reused with a
    // refcount bump, no new storage snapshot.
    flush(&handle, ts(&[5], SnapshotType::Disk)).await;
    expect_snapshot_done(&mut supv).await;
    assert_eq!(slice.snapshots_created(), 1);

    drain_notifications(&handle);
    assert_eq!(slice.total_snapshot_refs(), 1, "container only");
}

#[tokio::test]
async fn test_force_commit_always_creates() {
    let (_ctx, handle, mut supv, slice) = setup_one_instance().await;

    slice.mark_dirty();
    flush(&handle, ts(&[5], SnapshotType::Disk)).await;
    expect_snapshot_done(&mut supv).await;
    assert_eq!(slice.snapshots_created(), 1);

    // Clean slice, same timestamp, but force-commit overrides the rules.
    flush(&handle, ts(&[5], SnapshotType::ForceCommit)).await;
    expect_snapshot_done(&mut supv).await;
    assert_eq!(slice.snapshots_created(), 2);
}

#[tokio::test]
async fn test_no_snap_flush_skips_creation() {
    let (_ctx, handle, mut supv, slice) = setup_one_instance().await;

    slice.mark_dirty();
    flush(&handle, ts(&[5], SnapshotType::None)).await;
    let done = expect_snapshot_done(&mut supv).await;
    assert_eq!(done.seqnos, vec![5]);
    assert_eq!(slice.snapshots_created(), 0);
    assert!(slice.is_dirty(), "dirty bit untouched by a skipped snapshot");
}

#[tokio::test]
async fn test_aborted_flush_leaves_slices_dirty() {
    let (_ctx, handle, mut supv, slice) = setup_one_instance().await;

    slice.mark_dirty();
    handle
        .cmd_tx
        .send(StorageCommand::FlushDone {
            stream: StreamId::Maint,
            keyspace: KeyspaceId::new("travel"),
            ts: ts(&[5], SnapshotType::Disk),
            aborted: true,
            has_all_stream_begins: false,
        })
        .await
        .unwrap();
    expect_snapshot_done(&mut supv).await;

    assert_eq!(slice.snapshots_created(), 0);
    assert!(slice.is_dirty());
}

#[tokio::test]
async fn test_all_stream_begins_clears_last_rollback_ts() {
    let (_ctx, handle, mut supv, slice) = setup_one_instance().await;
    slice.set_last_rollback_ts(Some(ts(&[3], SnapshotType::Disk)));

    handle
        .cmd_tx
        .send(StorageCommand::FlushDone {
            stream: StreamId::Maint,
            keyspace: KeyspaceId::new("travel"),
            ts: ts(&[5], SnapshotType::None),
            aborted: false,
            has_all_stream_begins: true,
        })
        .await
        .unwrap();
    expect_snapshot_done(&mut supv).await;

    assert!(slice.last_rollback_ts().is_none());
}

#[tokio::test]
async fn test_deleting_instance_drains_waiters_with_not_found() {
    let (_ctx, handle, _supv, _slice) = setup_one_instance().await;

    let h2 = handle.clone();
    let waiter = tokio::spawn(async move {
        h2.wait_for_snapshot(
            InstanceId(1),
            Some(ts(&[10], SnapshotType::None)),
            Consistency::Query,
            Some(Duration::from_secs(5)),
            None,
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut deleted = instance(1);
    deleted.state = IndexState::Deleted;
    let mut instances = InstanceMap::new();
    instances.insert(InstanceId(1), deleted);
    handle
        .cmd_tx
        .send(StorageCommand::UpdateInstanceMap { instances })
        .await
        .unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(
        matches!(err, KestrelError::Scan(ScanError::IndexNotFound(InstanceId(1)))),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_any_consistency_served_from_epoch_snapshot() {
    let (_ctx, handle, _supv, _slice) = setup_one_instance().await;

    let snap = handle
        .wait_for_snapshot(InstanceId(1), None, Consistency::Any, Some(Duration::from_secs(1)), None)
        .await
        .unwrap();
    assert!(snap.epoch);
    assert!(snap.partitions.is_empty());
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let (_ctx, handle, _supv, _slice) = setup_one_instance().await;
    let err = handle
        .wait_for_snapshot(InstanceId(99), None, Consistency::Any, Some(Duration::from_secs(1)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, KestrelError::Scan(ScanError::IndexNotFound(InstanceId(99)))));
}

#[tokio::test]
async fn test_cancel_unblocks_waiter() {
    let (_ctx, handle, _supv, _slice) = setup_one_instance().await;

    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    let h2 = handle.clone();
    let waiter = tokio::spawn(async move {
        h2.wait_for_snapshot(
            InstanceId(1),
            Some(ts(&[10], SnapshotType::None)),
            Consistency::Query,
            Some(Duration::from_secs(30)),
            Some(cancel_rx),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    let _ = cancel_tx.send(());

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, KestrelError::Scan(ScanError::ScanCancelled)), "got {err:?}");
}

#[tokio::test]
async fn test_snapshot_failure_keeps_previous_snapshot() {
    let (ctx, handle, mut supv, slice) = setup_one_instance().await;

    slice.mark_dirty();
    flush(&handle, ts(&[5], SnapshotType::Disk)).await;
    expect_snapshot_done(&mut supv).await;

    slice.mark_dirty();
    slice.fail_next_snapshot();
    flush(&handle, ts(&[9], SnapshotType::Disk)).await;
    expect_snapshot_done(&mut supv).await;

    // The failed cycle did not replace the instance's snapshot.
    let snap_map = ctx.snapshots();
    let container = snap_map.get(&InstanceId(1)).unwrap();
    assert_eq!(container.current_ts().seqnos, vec![5]);

    drain_notifications(&handle);
    assert_eq!(slice.total_snapshot_refs(), 1);
}
