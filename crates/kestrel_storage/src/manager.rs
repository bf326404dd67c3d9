//! Snapshot lifecycle manager.
//!
//! A single command channel feeds the manager; flush, rollback, merge, prune
//! and map updates are handled on that loop, so snapshot creation serialises
//! with everything that mutates the snapshot and waiter maps. Snapshot
//! requests from the scan side arrive on sharded channels served by their own
//! listener tasks. Within one flush, instances are bucketed across snapshot
//! workers that run concurrently and join before `SnapshotDone` is emitted.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use kestrel_common::consistency::{is_snapshot_consistent, Consistency};
use kestrel_common::error::ScanError;
use kestrel_common::timestamp::TsVector;
use kestrel_common::types::{IndexState, InstanceId, KeyspaceId, PartitionId, StreamId};
use kestrel_common::{KestrelError, KestrelResult};

use crate::bootstrap;
use crate::container::SnapshotContainer;
use crate::context::{CoreContext, InstanceMap, InstancePartitionMap, StreamRouting};
use crate::merge;
use crate::metadata::{encode_instance_map, MetaStore, INST_MAP_KEY};
use crate::notify::{NotifyFanout, SnapshotEvent};
use crate::rollback::{
    self, FailoverLogProvider, InstanceRollback,
};
use crate::slice::SliceStats;
use crate::snapshot::{IndexSnapshot, PartitionSnapshot, SliceSnapshot};
use crate::waiters::{SnapshotWaiter, WaiterContainer};

/// Commands accepted on the manager's command channel.
pub enum StorageCommand {
    FlushDone {
        stream: StreamId,
        keyspace: KeyspaceId,
        ts: TsVector,
        aborted: bool,
        has_all_stream_begins: bool,
    },
    Rollback {
        stream: StreamId,
        keyspace: KeyspaceId,
        rollback_ts: TsVector,
        session_id: u64,
    },
    UpdateInstanceMap {
        instances: InstanceMap,
    },
    UpdatePartitionMap {
        partitions: InstancePartitionMap,
    },
    UpdateKeyspaceStatsMap {
        stats: crate::stats::KeyspaceStatsMap,
    },
    MergeSnapshot {
        src: InstanceId,
        tgt: InstanceId,
        partitions: Vec<PartitionId>,
        done: oneshot::Sender<KestrelResult<()>>,
    },
    PruneSnapshot {
        inst: InstanceId,
        keep: Vec<PartitionId>,
        done: oneshot::Sender<KestrelResult<()>>,
    },
    /// Rebuild an instance's snapshot container from storage.
    UpdateSnapMap {
        inst: InstanceId,
        stream: StreamId,
        keyspace: KeyspaceId,
    },
    Compact {
        inst: InstanceId,
        partition: PartitionId,
        deadline: Instant,
        min_frag: f64,
        done: oneshot::Sender<KestrelResult<()>>,
    },
    GetStorageStats {
        instances: Vec<InstanceId>,
        consumer_filter: u64,
        reply: oneshot::Sender<Vec<InstanceStorageStats>>,
    },
    ConfigUpdate {
        config: kestrel_common::config::CoreConfig,
    },
    RecoveryDone,
    Shutdown,
}

/// Asynchronous events emitted to the supervisor.
#[derive(Debug)]
pub enum SupervisorEvent {
    SnapshotDone {
        stream: StreamId,
        keyspace: KeyspaceId,
        ts: TsVector,
        aborted: bool,
    },
    RollbackDone {
        stream: StreamId,
        keyspace: KeyspaceId,
        restart_ts: Option<TsVector>,
        session_id: u64,
        error: Option<String>,
    },
}

/// Aggregated storage statistics for one partition of one instance.
#[derive(Debug, Clone)]
pub struct InstanceStorageStats {
    pub inst_id: InstanceId,
    pub partition_id: PartitionId,
    pub name: String,
    pub keyspace: KeyspaceId,
    pub stats: SliceStats,
}

/// A snapshot request from the scan side.
pub struct SnapshotRequest {
    pub inst_id: InstanceId,
    pub ts: Option<TsVector>,
    pub cons: Consistency,
    pub expires_at: Option<Instant>,
    pub reply: oneshot::Sender<KestrelResult<IndexSnapshot>>,
}

/// Client handle to a running manager.
#[derive(Clone)]
pub struct StorageManagerHandle {
    pub cmd_tx: mpsc::Sender<StorageCommand>,
    req_txs: Vec<mpsc::Sender<SnapshotRequest>>,
    pub notify: Arc<NotifyFanout>,
    ctx: Arc<CoreContext>,
}

impl StorageManagerHandle {
    /// Request a snapshot satisfying `(cons, ts)`, blocking until one is
    /// published, the timeout fires, or `cancel` resolves.
    pub async fn wait_for_snapshot(
        &self,
        inst_id: InstanceId,
        ts: Option<TsVector>,
        cons: Consistency,
        timeout: Option<Duration>,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> KestrelResult<IndexSnapshot> {
        let expires_at = timeout.map(|t| Instant::now() + t);
        let (reply, rx) = oneshot::channel();
        let shard = (inst_id.0 % self.req_txs.len() as u64) as usize;
        self.req_txs[shard]
            .send(SnapshotRequest {
                inst_id,
                ts,
                cons,
                expires_at,
                reply,
            })
            .await
            .map_err(|_| KestrelError::Internal("snapshot request channel closed".into()))?;

        let sleep = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match cancel {
                Some(c) => {
                    let _ = c.await;
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            res = rx => match res {
                Ok(r) => r,
                Err(_) => Err(KestrelError::Internal("snapshot waiter dropped".into())),
            },
            _ = sleep => Err(ScanError::ScanTimedOut.into()),
            _ = cancelled => Err(ScanError::ScanCancelled.into()),
        }
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }
}

/// The lifecycle manager actor.
pub struct StorageManager {
    ctx: Arc<CoreContext>,
    cmd_rx: mpsc::Receiver<StorageCommand>,
    supv_tx: mpsc::Sender<SupervisorEvent>,
    notify: Arc<NotifyFanout>,
    meta: Option<Arc<MetaStore>>,
    failover_log: Arc<dyn FailoverLogProvider>,
}

impl StorageManager {
    /// Build and start the manager; returns the client handle, the supervisor
    /// event stream, and the actor's join handle.
    pub fn start(
        ctx: Arc<CoreContext>,
        failover_log: Arc<dyn FailoverLogProvider>,
    ) -> KestrelResult<(
        StorageManagerHandle,
        mpsc::Receiver<SupervisorEvent>,
        JoinHandle<()>,
    )> {
        let cfg = ctx.config();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (supv_tx, supv_rx) = mpsc::channel(64);
        let notify = Arc::new(NotifyFanout::new(
            cfg.snapshot.num_request_shards,
            cfg.snapshot.notify_queue_len,
        ));

        let meta = if cfg.metadata.enable_manager {
            None
        } else {
            Some(Arc::new(MetaStore::open(&cfg.metadata.data_dir)?))
        };

        let mut req_txs = Vec::new();
        for _ in 0..cfg.snapshot.num_request_shards.max(1) {
            let (tx, rx) = mpsc::channel::<SnapshotRequest>(256);
            req_txs.push(tx);
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { serve_snapshot_requests(ctx, rx).await });
        }

        let handle = StorageManagerHandle {
            cmd_tx,
            req_txs,
            notify: Arc::clone(&notify),
            ctx: Arc::clone(&ctx),
        };

        let mgr = StorageManager {
            ctx,
            cmd_rx,
            supv_tx,
            notify,
            meta,
            failover_log,
        };
        let join = tokio::spawn(async move { mgr.run().await });
        Ok((handle, supv_rx, join))
    }

    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                StorageCommand::FlushDone {
                    stream,
                    keyspace,
                    ts,
                    aborted,
                    has_all_stream_begins,
                } => {
                    self.handle_flush_done(stream, keyspace, ts, aborted, has_all_stream_begins)
                        .await
                }
                StorageCommand::Rollback {
                    stream,
                    keyspace,
                    rollback_ts,
                    session_id,
                } => {
                    self.handle_rollback(stream, keyspace, rollback_ts, session_id)
                        .await
                }
                StorageCommand::UpdateInstanceMap { instances } => {
                    self.handle_update_instance_map(instances)
                }
                StorageCommand::UpdatePartitionMap { partitions } => {
                    let _guard = self.ctx.lock_maps();
                    self.ctx.set_partitions(partitions);
                }
                StorageCommand::UpdateKeyspaceStatsMap { stats } => {
                    self.ctx.stats.set_keyspace_stats_map(stats);
                }
                StorageCommand::MergeSnapshot {
                    src,
                    tgt,
                    partitions,
                    done,
                } => {
                    let res = self.handle_merge(src, tgt, &partitions);
                    let _ = done.send(res);
                }
                StorageCommand::PruneSnapshot { inst, keep, done } => {
                    let res = self.handle_prune(inst, &keep);
                    let _ = done.send(res);
                }
                StorageCommand::UpdateSnapMap {
                    inst,
                    stream,
                    keyspace,
                } => {
                    self.handle_update_snap_map(inst, stream, keyspace).await;
                }
                StorageCommand::Compact {
                    inst,
                    partition,
                    deadline,
                    min_frag,
                    done,
                } => {
                    self.handle_compact(inst, partition, deadline, min_frag, done);
                }
                StorageCommand::GetStorageStats {
                    instances,
                    consumer_filter,
                    reply,
                } => {
                    self.handle_storage_stats(instances, consumer_filter, reply);
                }
                StorageCommand::ConfigUpdate { config } => {
                    self.ctx.set_config(config);
                }
                StorageCommand::RecoveryDone => {
                    tracing::info!("recovery done, storage manager active");
                }
                StorageCommand::Shutdown => {
                    tracing::info!("storage manager shutting down");
                    break;
                }
            }
        }
    }

    // ── Flush → snapshot creation ───────────────────────────────────────────

    async fn handle_flush_done(
        &self,
        stream: StreamId,
        keyspace: KeyspaceId,
        mut ts: TsVector,
        aborted: bool,
        has_all_stream_begins: bool,
    ) {
        ts.compute_crc64();
        let cfg = self.ctx.config();
        let num_workers = cfg.snapshot.effective_workers();

        // Re-shard when the configured worker count changed since the routing
        // maps were last built.
        let routing = self.ctx.routing();
        let needs_reshard = routing
            .worker_buckets(stream, &keyspace)
            .map(|b| b.len() != num_workers)
            .unwrap_or(false);
        let routing = if needs_reshard {
            let _guard = self.ctx.lock_maps();
            let next = StreamRouting::rebuild(&self.ctx.instances(), num_workers);
            tracing::info!(%stream, %keyspace, num_workers, "re-sharding snapshot workers");
            self.ctx.set_routing(next);
            self.ctx.routing()
        } else {
            routing
        };

        if ts.snap_type.is_no_snap() {
            tracing::debug!(%stream, %keyspace, snap_type = ?ts.snap_type, "skipping snapshot for flush");
            if has_all_stream_begins {
                self.clear_last_rollback_ts(stream, &keyspace);
            }
            self.emit_snapshot_done(stream, keyspace, ts, aborted).await;
            return;
        }

        let needs_commit = ts.snap_type.needs_commit();
        let force_commit = ts.snap_type.is_force_commit();

        let buckets = routing
            .worker_buckets(stream, &keyspace)
            .cloned()
            .unwrap_or_default();

        let mut workers = JoinSet::new();
        for bucket in buckets.into_iter().filter(|b| !b.is_empty()) {
            let ctx = Arc::clone(&self.ctx);
            let notify = Arc::clone(&self.notify);
            let ts = ts.clone();
            let keyspace = keyspace.clone();
            workers.spawn(async move {
                for inst_id in bucket {
                    create_snapshot_for_instance(
                        &ctx,
                        &notify,
                        inst_id,
                        stream,
                        &keyspace,
                        &ts,
                        needs_commit,
                        force_commit,
                        aborted,
                        has_all_stream_begins,
                    )
                    .await;
                }
            });
        }
        while workers.join_next().await.is_some() {}

        self.ctx.stats.num_flushes.fetch_add(1, Ordering::Relaxed);
        self.emit_snapshot_done(stream, keyspace, ts, aborted).await;
    }

    async fn emit_snapshot_done(
        &self,
        stream: StreamId,
        keyspace: KeyspaceId,
        ts: TsVector,
        aborted: bool,
    ) {
        if let Some(ks) = self.ctx.stats.keyspace_stats(stream, &keyspace) {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            ks.last_snap_done_ns.store(now, Ordering::Relaxed);
        }
        let _ = self
            .supv_tx
            .send(SupervisorEvent::SnapshotDone {
                stream,
                keyspace,
                ts,
                aborted,
            })
            .await;
    }

    fn clear_last_rollback_ts(&self, stream: StreamId, keyspace: &KeyspaceId) {
        let instances = self.ctx.instances();
        let partitions = self.ctx.partitions();
        for (inst_id, partn_map) in partitions.iter() {
            let Some(inst) = instances.get(inst_id) else {
                continue;
            };
            if !inst.matches_stream(stream, keyspace) {
                continue;
            }
            for partn in partn_map.values() {
                for slice in &partn.slices {
                    slice.set_last_rollback_ts(None);
                }
            }
        }
    }

    // ── Rollback ────────────────────────────────────────────────────────────

    async fn handle_rollback(
        &self,
        stream: StreamId,
        keyspace: KeyspaceId,
        rollback_ts: TsVector,
        session_id: u64,
    ) {
        tracing::info!(%stream, %keyspace, "rollback requested");

        let instances = self.ctx.instances();
        let partitions = self.ctx.partitions();

        let mut restart: Option<TsVector> = None;
        let mut rolled_to_zero = false;
        let mut failure: Option<KestrelError> = None;

        for (inst_id, partn_map) in partitions.iter() {
            let Some(inst) = instances.get(inst_id) else {
                continue;
            };
            if !inst.matches_stream(stream, &keyspace) {
                continue;
            }
            match rollback::rollback_instance(*inst_id, partn_map, &rollback_ts, restart.take())
                .await
            {
                Err(e) => {
                    failure = Some(e);
                    break;
                }
                Ok(InstanceRollback::Zero) => {
                    if let Err(e) = rollback::rollback_all_to_zero(&self.ctx, stream, &keyspace).await
                    {
                        failure = Some(e);
                    }
                    rolled_to_zero = true;
                    restart = None;
                    break;
                }
                Ok(InstanceRollback::RestartAt(ts)) => restart = Some(ts),
            }
        }

        if let Some(e) = failure {
            tracing::error!(%stream, %keyspace, error = %e, "rollback aborted");
            let _ = self
                .supv_tx
                .send(SupervisorEvent::RollbackDone {
                    stream,
                    keyspace,
                    restart_ts: None,
                    session_id,
                    error: Some(e.to_string()),
                })
                .await;
            return;
        }

        // Waiters must drain before containers are rebuilt so none can be
        // satisfied by a stale post-rollback snapshot.
        self.drain_waiters(stream, &keyspace, || ScanError::IndexRolledBack.into());

        if let Err(e) =
            bootstrap::rebuild_snapshots(&self.ctx, Some(stream), Some(&keyspace), &self.notify)
                .await
        {
            if e.is_fatal() {
                e.log_if_fatal();
                std::process::exit(1);
            }
            tracing::error!(error = %e, "snapshot rebuild failed after rollback");
        }

        self.ctx.stats.num_rollbacks.fetch_add(1, Ordering::Relaxed);
        if rolled_to_zero {
            self.ctx
                .stats
                .num_rollbacks_to_zero
                .fetch_add(1, Ordering::Relaxed);
        }
        if let Some(ks) = self.ctx.stats.keyspace_stats(stream, &keyspace) {
            ks.num_rollbacks.fetch_add(1, Ordering::Relaxed);
            if rolled_to_zero {
                ks.num_rollbacks_to_zero.fetch_add(1, Ordering::Relaxed);
            }
        }

        let restart_ts = match restart {
            Some(mut rts) => {
                rts.set_epoch_manifest_if_empty();
                let retries = self.ctx.config().cluster.failover_log_retries;
                Some(
                    rollback::validate_restart_ts(
                        self.failover_log.as_ref(),
                        &keyspace,
                        rts,
                        retries,
                    )
                    .await,
                )
            }
            None => None,
        };

        let _ = self
            .supv_tx
            .send(SupervisorEvent::RollbackDone {
                stream,
                keyspace,
                restart_ts,
                session_id,
                error: None,
            })
            .await;
    }

    fn drain_waiters(
        &self,
        stream: StreamId,
        keyspace: &KeyspaceId,
        mk: impl Fn() -> KestrelError,
    ) {
        let instances = self.ctx.instances();
        let waiter_map = self.ctx.waiters();
        for (inst_id, wc) in waiter_map.iter() {
            let Some(inst) = instances.get(inst_id) else {
                continue;
            };
            if inst.stream != stream || &inst.defn.keyspace != keyspace {
                continue;
            }
            let n = wc.drain_with_error(&mk);
            if n > 0 {
                self.ctx
                    .stats
                    .for_instance(*inst_id)
                    .num_snapshot_waiters
                    .fetch_sub(n as i64, Ordering::Relaxed);
            }
        }
    }

    // ── Map updates ─────────────────────────────────────────────────────────

    fn handle_update_instance_map(&self, instances: InstanceMap) {
        let _guard = self.ctx.lock_maps();
        let cfg = self.ctx.config();
        self.ctx.set_instances(instances.clone());
        self.ctx.set_routing(StreamRouting::rebuild(
            &instances,
            cfg.snapshot.effective_workers(),
        ));

        // Waiter containers: create for new instances, drain for vanished.
        let mut waiter_map = (*self.ctx.waiters()).clone();
        for (inst_id, inst) in &instances {
            if inst.state != IndexState::Deleted && !waiter_map.contains_key(inst_id) {
                waiter_map.insert(*inst_id, Arc::new(WaiterContainer::new()));
            }
        }
        let gone: Vec<InstanceId> = waiter_map
            .keys()
            .filter(|id| {
                instances
                    .get(*id)
                    .map(|i| i.state == IndexState::Deleted)
                    .unwrap_or(true)
            })
            .copied()
            .collect();
        for inst_id in &gone {
            if let Some(wc) = waiter_map.remove(inst_id) {
                wc.drain_with_error(|| ScanError::IndexNotFound(*inst_id).into());
            }
        }
        self.ctx.set_waiters(waiter_map);

        // Snapshot containers of vanished instances are marked deleted (kept
        // alive by any outstanding clones, reclaimed when those drop).
        let mut snap_map = (*self.ctx.snapshots()).clone();
        let stale: Vec<InstanceId> = snap_map
            .keys()
            .filter(|id| {
                instances
                    .get(*id)
                    .map(|i| i.state == IndexState::Deleted)
                    .unwrap_or(true)
            })
            .copied()
            .collect();
        let num_vb = cfg.num_vbuckets;
        for inst_id in &stale {
            if let Some(container) = snap_map.remove(inst_id) {
                container.mark_deleted(IndexSnapshot::epoch(
                    *inst_id,
                    TsVector::new(KeyspaceId::new(""), num_vb),
                    0,
                ));
                self.notify
                    .publish(*inst_id, SnapshotEvent::Deleted(*inst_id));
                self.ctx.stats.remove_instance(*inst_id);
            }
        }

        // Epoch snapshots for instances that have no container yet, so a scan
        // arriving before the first flush has something to wait against.
        for (inst_id, inst) in &instances {
            if inst.state == IndexState::Deleted || snap_map.contains_key(inst_id) {
                continue;
            }
            let epoch = IndexSnapshot::epoch(
                *inst_id,
                TsVector::new(inst.defn.keyspace.clone(), num_vb),
                self.ctx.next_snap_id(),
            );
            let clone = epoch.clone_snapshot();
            snap_map.insert(*inst_id, Arc::new(SnapshotContainer::new(epoch)));
            self.notify.publish(*inst_id, SnapshotEvent::Created(clone));
        }
        self.ctx.set_snapshots(snap_map);

        if let Some(meta) = &self.meta {
            match encode_instance_map(&instances) {
                Ok(bytes) => {
                    meta.set_kv(INST_MAP_KEY, bytes);
                    if let Err(e) = meta.commit() {
                        tracing::error!(error = %e, "failed to persist instance map");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to encode instance map"),
            }
        }
    }

    // ── Merge / prune ───────────────────────────────────────────────────────

    fn handle_merge(
        &self,
        src: InstanceId,
        tgt: InstanceId,
        partitions: &[PartitionId],
    ) -> KestrelResult<()> {
        match merge::merge_snapshots(&self.ctx, src, tgt, partitions) {
            Ok(Some(snap)) => {
                publish_snapshot(&self.ctx, &self.notify, snap);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                tracing::error!(%src, %tgt, ?partitions, error = %e, "snapshot merge failed");
                Err(e)
            }
        }
    }

    fn handle_prune(&self, inst: InstanceId, keep: &[PartitionId]) -> KestrelResult<()> {
        if let Some(snap) = merge::prune_snapshot(&self.ctx, inst, keep) {
            publish_snapshot(&self.ctx, &self.notify, snap);
        }
        Ok(())
    }

    async fn handle_update_snap_map(
        &self,
        inst: InstanceId,
        stream: StreamId,
        keyspace: KeyspaceId,
    ) {
        let partitions = self.ctx.partitions();
        let Some(partn_map) = partitions.get(&inst) else {
            return;
        };
        let Some(index) = self.ctx.instance(inst) else {
            return;
        };
        if !index.matches_stream(stream, &keyspace) {
            return;
        }
        if let Err(e) = bootstrap::rebuild_instance(&self.ctx, inst, partn_map, &self.notify).await
        {
            if e.is_fatal() {
                e.log_if_fatal();
                std::process::exit(1);
            }
            tracing::error!(inst = %inst, error = %e, "snapshot rebuild failed");
        }
    }

    // ── Maintenance off the command loop ───────────────────────────────────

    fn handle_compact(
        &self,
        inst: InstanceId,
        partition: PartitionId,
        deadline: Instant,
        min_frag: f64,
        done: oneshot::Sender<KestrelResult<()>>,
    ) {
        let Some(index) = self.ctx.instance(inst) else {
            let _ = done.send(Err(ScanError::IndexNotFound(inst).into()));
            return;
        };
        if index.state == IndexState::Deleted {
            let _ = done.send(Err(ScanError::IndexNotFound(inst).into()));
            return;
        }
        let partitions = self.ctx.partitions();
        let slices: Vec<_> = partitions
            .get(&inst)
            .and_then(|pm| pm.get(&partition))
            .map(|p| p.slices.clone())
            .unwrap_or_default();

        self.ctx
            .stats
            .for_instance(inst)
            .num_compactions
            .fetch_add(1, Ordering::Relaxed);

        for slice in &slices {
            slice.incr_ref();
        }
        // Compaction proceeds without blocking the command loop.
        tokio::spawn(async move {
            let mut result = Ok(());
            for slice in &slices {
                let res = slice.compact(deadline, min_frag).await;
                slice.decr_ref();
                if let Err(e) = res {
                    result = Err(e);
                    break;
                }
            }
            let _ = done.send(result);
        });
    }

    fn handle_storage_stats(
        &self,
        only: Vec<InstanceId>,
        consumer_filter: u64,
        reply: oneshot::Sender<Vec<InstanceStorageStats>>,
    ) {
        let instances = self.ctx.instances();
        let partitions = self.ctx.partitions();
        tokio::spawn(async move {
            let mut out = Vec::new();
            for (inst_id, partn_map) in partitions.iter() {
                if !only.is_empty() && !only.contains(inst_id) {
                    continue;
                }
                let Some(inst) = instances.get(inst_id) else {
                    continue;
                };
                if inst.state == IndexState::Deleted {
                    continue;
                }
                for (partn_id, partn) in partn_map.iter() {
                    let mut agg = SliceStats::default();
                    let mut has_stats = false;
                    for slice in &partn.slices {
                        // Hold a reference so the slice cannot be torn down
                        // mid-visit.
                        if !slice.check_and_incr_ref() {
                            continue;
                        }
                        let res = slice.statistics(consumer_filter).await;
                        slice.decr_ref();
                        match res {
                            Ok(s) => {
                                agg.data_size += s.data_size;
                                agg.data_size_on_disk += s.data_size_on_disk;
                                agg.log_space += s.log_space;
                                agg.disk_size += s.disk_size;
                                agg.mem_used += s.mem_used;
                                agg.get_bytes += s.get_bytes;
                                agg.insert_bytes += s.insert_bytes;
                                agg.delete_bytes += s.delete_bytes;
                                agg.extra_snap_data_size += s.extra_snap_data_size;
                                has_stats = true;
                            }
                            Err(e) => {
                                tracing::warn!(inst = %inst_id, error = %e, "slice statistics failed");
                            }
                        }
                    }
                    if has_stats {
                        out.push(InstanceStorageStats {
                            inst_id: *inst_id,
                            partition_id: *partn_id,
                            name: inst.defn.name.clone(),
                            keyspace: inst.defn.keyspace.clone(),
                            stats: agg,
                        });
                    }
                }
            }
            let _ = reply.send(out);
        });
    }
}

// ── Snapshot creation per instance ──────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn create_snapshot_for_instance(
    ctx: &Arc<CoreContext>,
    notify: &Arc<NotifyFanout>,
    inst_id: InstanceId,
    stream: StreamId,
    keyspace: &KeyspaceId,
    ts: &TsVector,
    needs_commit: bool,
    force_commit: bool,
    aborted: bool,
    has_all_stream_begins: bool,
) {
    let instances = ctx.instances();
    let Some(inst) = instances.get(&inst_id) else {
        return;
    };
    if !inst.matches_stream(stream, keyspace) {
        return;
    }

    let partitions = ctx.partitions();
    let Some(partn_map) = partitions.get(&inst_id) else {
        return;
    };

    if aborted {
        // The slices stay dirty, so the next clean flush forces a snapshot.
        tracing::debug!(inst = %inst_id, "flush aborted, leaving slices dirty");
        return;
    }

    let last = ctx
        .snapshots()
        .get(&inst_id)
        .and_then(|c| c.clone_current());

    let idx_stats = ctx.stats.for_instance(inst_id);
    let commit = needs_commit || force_commit;

    let mut partn_snaps = HashMap::new();
    let mut has_new_snapshot = false;
    let mut snap_failed = false;

    for (partn_id, partn) in partn_map.iter() {
        let last_partn = last.as_ref().and_then(|l| l.partitions.get(partn_id));
        let mut ps = PartitionSnapshot::new(*partn_id);

        for slice in &partn.slices {
            if has_all_stream_begins {
                // A complete set of stream-begins means the restart after the
                // previous rollback stuck; every snapshot is eligible again.
                slice.set_last_rollback_ts(None);
            }

            let latest = last_partn.and_then(|p| p.slices.get(&slice.id()));
            let prior_ts = latest.map(|s| s.snap.timestamp());

            let create = match &prior_ts {
                None => true,
                Some(prior) => {
                    ((slice.is_dirty() || needs_commit) && ts.greater_than(prior)) || force_commit
                }
            };

            if create {
                tracing::trace!(inst = %inst_id, partition = %partn_id, slice = %slice.id(),
                    commit, force_commit, "creating new snapshot");
                slice.flush_done();
                let info = match slice.new_snapshot(ts, commit).await {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::error!(inst = %inst_id, slice = %slice.id(), error = %e,
                            "snapshot creation failed, skipping instance this cycle");
                        snap_failed = true;
                        continue;
                    }
                };
                let handle = match slice.open_snapshot(&info).await {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::error!(inst = %inst_id, slice = %slice.id(), error = %e,
                            "snapshot open failed, skipping instance this cycle");
                        snap_failed = true;
                        continue;
                    }
                };
                has_new_snapshot = true;
                if commit {
                    tracing::info!(inst = %inst_id, partition = %partn_id, slice = %slice.id(),
                        crc64 = ts.crc64, snap_type = ?ts.snap_type, "added new committed snapshot");
                }
                ps.slices
                    .insert(slice.id(), SliceSnapshot::new(slice.id(), handle));
            } else {
                let latest = latest.expect("reuse path requires a prior snapshot");
                tracing::debug!(inst = %inst_id, partition = %partn_id, slice = %slice.id(),
                    "no new mutations, reusing prior snapshot");
                ps.slices
                    .insert(slice.id(), SliceSnapshot::new(slice.id(), latest.snap.clone_ref()));
            }
        }
        partn_snaps.insert(*partn_id, ps);
    }

    if has_new_snapshot {
        idx_stats.num_snapshots.fetch_add(1, Ordering::Relaxed);
        if commit {
            idx_stats.num_commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    let is = IndexSnapshot::new(inst_id, ts.clone(), partn_snaps, ctx.next_snap_id());

    if snap_failed {
        // Dropping the partial tree releases whatever references it took; the
        // instance keeps serving its previous snapshot.
        drop(is);
        return;
    }

    publish_snapshot(ctx, notify, is);
}

/// Install a snapshot as its instance's current, notify downstream listeners,
/// and walk the instance's waiters.
pub fn publish_snapshot(ctx: &Arc<CoreContext>, notify: &Arc<NotifyFanout>, is: IndexSnapshot) {
    let inst_id = is.inst_id;
    let for_waiters = is.clone_snapshot();

    let installed = install_current(ctx, is);
    if !installed {
        // Instance vanished; both trees drop and release their references.
        return;
    }

    let idx_stats = ctx.stats.for_instance(inst_id);
    if let Some(wc) = ctx.waiters().get(&inst_id) {
        let outcome = wc.notify_publish(&for_waiters, Instant::now());
        let resolved = (outcome.delivered + outcome.expired) as i64;
        if resolved > 0 {
            idx_stats
                .num_snapshot_waiters
                .fetch_sub(resolved, Ordering::Relaxed);
        }
        idx_stats
            .num_last_snapshot_reply
            .store(outcome.delivered as i64, Ordering::Relaxed);
    }

    // Listener side owns the clone and destroys it when done.
    notify.publish(inst_id, SnapshotEvent::Created(for_waiters));
}

/// Swap `is` in as the instance's current snapshot, creating the container
/// lazily. Returns false when the instance is gone (the snapshot is dropped).
fn install_current(ctx: &Arc<CoreContext>, is: IndexSnapshot) -> bool {
    let inst_id = is.inst_id;
    if let Some(container) = ctx.snapshots().get(&inst_id) {
        return container.publish(is);
    }

    let _guard = ctx.lock_maps();
    match ctx.instance(inst_id) {
        None => return false,
        Some(inst) if inst.state == IndexState::Deleted => return false,
        Some(_) => {}
    }
    let mut snap_map = (*ctx.snapshots()).clone();
    if let Some(container) = snap_map.get(&inst_id) {
        return container.publish(is);
    }
    tracing::info!(inst = %inst_id, "creating snapshot container");
    snap_map.insert(inst_id, Arc::new(SnapshotContainer::new(is)));
    ctx.set_snapshots(snap_map);
    true
}

// ── Snapshot request service ────────────────────────────────────────────────

async fn serve_snapshot_requests(ctx: Arc<CoreContext>, mut rx: mpsc::Receiver<SnapshotRequest>) {
    while let Some(req) = rx.recv().await {
        handle_snapshot_request(&ctx, req);
    }
}

fn handle_snapshot_request(ctx: &Arc<CoreContext>, req: SnapshotRequest) {
    let inst_id = req.inst_id;
    match ctx.instance(inst_id) {
        None => {
            let _ = req.reply.send(Err(ScanError::IndexNotFound(inst_id).into()));
            return;
        }
        Some(inst) if inst.state == IndexState::Deleted => {
            let _ = req.reply.send(Err(ScanError::IndexNotFound(inst_id).into()));
            return;
        }
        Some(_) => {}
    }

    let container = match ctx.snapshots().get(&inst_id) {
        Some(c) => Arc::clone(c),
        None => match init_epoch_container(ctx, inst_id) {
            Some(c) => c,
            None => {
                let _ = req.reply.send(Err(ScanError::IndexNotFound(inst_id).into()));
                return;
            }
        },
    };

    if container.is_deleted() {
        let _ = req.reply.send(Err(ScanError::IndexNotFound(inst_id).into()));
        return;
    }

    if is_snapshot_consistent(&container.current_ts(), req.cons, req.ts.as_ref()) {
        match container.clone_current() {
            Some(snap) => {
                let _ = req.reply.send(Ok(snap));
            }
            None => {
                let _ = req.reply.send(Err(ScanError::IndexNotFound(inst_id).into()));
            }
        }
        return;
    }

    let wc = match ctx.waiters().get(&inst_id) {
        Some(wc) => Arc::clone(wc),
        None => match init_waiter_container(ctx, inst_id) {
            Some(wc) => wc,
            None => {
                let _ = req.reply.send(Err(ScanError::IndexNotFound(inst_id).into()));
                return;
            }
        },
    };

    ctx.stats
        .for_instance(inst_id)
        .num_snapshot_waiters
        .fetch_add(1, Ordering::Relaxed);
    wc.enqueue(SnapshotWaiter::new(
        inst_id,
        req.ts,
        req.cons,
        req.expires_at,
        req.reply,
    ));
}

fn init_epoch_container(ctx: &Arc<CoreContext>, inst_id: InstanceId) -> Option<Arc<SnapshotContainer>> {
    let _guard = ctx.lock_maps();
    let inst = ctx.instance(inst_id)?;
    if inst.state == IndexState::Deleted {
        return None;
    }
    let mut snap_map = (*ctx.snapshots()).clone();
    if let Some(c) = snap_map.get(&inst_id) {
        return Some(Arc::clone(c));
    }
    let num_vb = ctx.config().num_vbuckets;
    let epoch = IndexSnapshot::epoch(
        inst_id,
        TsVector::new(inst.defn.keyspace, num_vb),
        ctx.next_snap_id(),
    );
    let container = Arc::new(SnapshotContainer::new(epoch));
    snap_map.insert(inst_id, Arc::clone(&container));
    ctx.set_snapshots(snap_map);
    Some(container)
}

fn init_waiter_container(ctx: &Arc<CoreContext>, inst_id: InstanceId) -> Option<Arc<WaiterContainer>> {
    let _guard = ctx.lock_maps();
    let inst = ctx.instance(inst_id)?;
    if inst.state == IndexState::Deleted {
        return None;
    }
    let mut waiter_map = (*ctx.waiters()).clone();
    if let Some(wc) = waiter_map.get(&inst_id) {
        return Some(Arc::clone(wc));
    }
    let wc = Arc::new(WaiterContainer::new());
    waiter_map.insert(inst_id, Arc::clone(&wc));
    ctx.set_waiters(waiter_map);
    Some(wc)
}
