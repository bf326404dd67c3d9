//! Rollback to an earlier snapshot when the upstream diverges.
//!
//! For each slice of each matching instance the engine picks the newest
//! retained snapshot not beyond the upstream's reported position, reverts the
//! slice to it, and tracks the minimum restart timestamp across slices. When
//! no usable snapshot exists anywhere, every instance in the keyspace/stream
//! is reverted to empty uniformly. The computed restart timestamp is then
//! validated against the upstream failover log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kestrel_common::timestamp::TsVector;
use kestrel_common::types::{InstanceId, KeyspaceId, PartitionId, StreamId};
use kestrel_common::KestrelResult;

use crate::context::{CoreContext, PartitionMap};
use crate::slice::{Slice, SnapshotInfo};

/// Per-vb branch history of the upstream source, newest entry first.
#[derive(Debug, Clone, Default)]
pub struct FailoverLog {
    /// `vbs[vb]` is a list of `(vbuuid, start_seqno)` pairs, newest first.
    pub vbs: Vec<Vec<(u64, u64)>>,
}

impl FailoverLog {
    /// The vbuuid of the oldest recorded branch covering `seq` for `vb`, or
    /// `None` when the log has no entry at or below that position.
    pub fn lowest_vbuuid(&self, vb: usize, seq: u64) -> Option<u64> {
        let entries = self.vbs.get(vb)?;
        entries
            .iter()
            .rev()
            .find(|(_, start)| *start <= seq)
            .map(|(vbuuid, _)| *vbuuid)
    }
}

/// Upstream failover-log fetch, implemented by the cluster adapter.
#[async_trait]
pub trait FailoverLogProvider: Send + Sync {
    async fn failover_log(&self, bucket: &str, num_vbuckets: usize) -> KestrelResult<FailoverLog>;
}

/// Outcome of rolling back one instance.
pub enum InstanceRollback {
    /// All slices reverted; carries the minimum restart timestamp so far.
    RestartAt(TsVector),
    /// At least one slice had no usable snapshot; everything must restart
    /// from empty.
    Zero,
}

/// Roll back every slice of `partn_map`, folding the minimum restart
/// timestamp into `min_restart`.
pub async fn rollback_instance(
    inst_id: InstanceId,
    partn_map: &PartitionMap,
    rollback_ts: &TsVector,
    mut min_restart: Option<TsVector>,
) -> KestrelResult<InstanceRollback> {
    // A zero seqno means the upstream asked for a complete rewind of some vb,
    // usually a vbuuid mismatch; older snapshots are then worth retrying, so
    // successful picks are remembered per slice.
    let mark_as_used = rollback_ts.has_zero_seq_num();

    for (partn_id, partn) in partn_map.iter() {
        for slice in &partn.slices {
            let pick = find_rollback_snapshot(slice.as_ref(), rollback_ts).await?;
            match rollback_to_snapshot(inst_id, *partn_id, slice.as_ref(), pick, mark_as_used).await? {
                None => return Ok(InstanceRollback::Zero),
                Some(restart) => {
                    let lower = match &min_restart {
                        Some(min) => !restart.equal_or_greater(min, false),
                        None => true,
                    };
                    if lower {
                        min_restart = Some(restart);
                    }
                }
            }
        }
    }

    match min_restart {
        Some(ts) => Ok(InstanceRollback::RestartAt(ts)),
        // No partitions at all behaves like nothing to revert.
        None => Ok(InstanceRollback::Zero),
    }
}

/// Choose the snapshot a slice should revert to, or `None` for
/// rollback-to-zero.
pub async fn find_rollback_snapshot(
    slice: &dyn Slice,
    rollback_ts: &TsVector,
) -> KestrelResult<Option<SnapshotInfo>> {
    let infos = slice.get_snapshots().await?;

    // The upstream cannot restart a stream from an incomplete
    // out-of-sequence-order snapshot.
    if infos.iter().any(|i| i.is_oso()) {
        return Ok(None);
    }

    if rollback_ts.has_zero_seq_num() {
        let last_used = slice.last_rollback_ts();
        let latest = infos.first().cloned();
        match (latest, last_used) {
            (None, _) => Ok(None),
            (latest @ Some(_), None) => {
                tracing::info!(slice = %slice.id(), "no prior rollback position, using latest snapshot");
                Ok(latest)
            }
            (Some(_), Some(last)) => {
                // The previous pick did not stick; try the next older one.
                for (i, info) in infos.iter().enumerate() {
                    if last.equal(&info.ts) {
                        if let Some(next) = infos.get(i + 1) {
                            tracing::info!(slice = %slice.id(), next = %next,
                                "discarding already used snapshot, trying next older");
                            return Ok(Some(next.clone()));
                        }
                        tracing::info!(slice = %slice.id(),
                            "no snapshot older than last used, reverting to zero");
                        return Ok(None);
                    }
                }
                Ok(None)
            }
        }
    } else {
        // Newest snapshot not beyond the rollback point on any vb.
        Ok(infos
            .into_iter()
            .find(|info| rollback_ts.equal_or_greater(&info.ts, false)))
    }
}

/// Revert one slice. Returns the restart timestamp, or `None` after a
/// rollback to zero.
pub async fn rollback_to_snapshot(
    inst_id: InstanceId,
    partn_id: PartitionId,
    slice: &dyn Slice,
    pick: Option<SnapshotInfo>,
    mark_as_used: bool,
) -> KestrelResult<Option<TsVector>> {
    match pick {
        Some(info) => {
            slice.rollback(&info).await?;
            tracing::info!(inst = %inst_id, partition = %partn_id, slice = %slice.id(),
                snapshot = %info, "rolled back slice to snapshot");
            if mark_as_used {
                slice.set_last_rollback_ts(Some(info.ts.clone()));
            }
            Ok(Some(info.ts))
        }
        None => {
            slice.rollback_to_zero().await?;
            tracing::info!(inst = %inst_id, partition = %partn_id, slice = %slice.id(),
                "rolled back slice to zero");
            slice.set_last_rollback_ts(None);
            Ok(None)
        }
    }
}

/// Revert every matching instance to empty (uniform restart).
pub async fn rollback_all_to_zero(
    ctx: &CoreContext,
    stream: StreamId,
    keyspace: &KeyspaceId,
) -> KestrelResult<()> {
    tracing::info!(%stream, %keyspace, "rolling all instances back to zero");
    let instances = ctx.instances();
    let partitions = ctx.partitions();
    for (inst_id, partn_map) in partitions.iter() {
        let Some(inst) = instances.get(inst_id) else {
            continue;
        };
        if !inst.matches_stream(stream, keyspace) {
            continue;
        }
        for (partn_id, partn) in partn_map.iter() {
            for slice in &partn.slices {
                rollback_to_snapshot(*inst_id, *partn_id, slice.as_ref(), None, false).await?;
            }
        }
    }
    Ok(())
}

/// Validate the restart timestamp against the upstream failover log.
///
/// For each vb, when the log's lowest recorded vbuuid covering the chosen
/// seqno is non-zero and differs from ours, the log wins: the upstream may
/// have lost the branch we remember. Fetch failures retry with a 1-second
/// backoff up to `retries`; when all attempts fail the timestamp is returned
/// unvalidated.
pub async fn validate_restart_ts(
    provider: &dyn FailoverLogProvider,
    keyspace: &KeyspaceId,
    mut restart_ts: TsVector,
    retries: u32,
) -> TsVector {
    let bucket = keyspace.bucket().to_string();
    for attempt in 1..=retries.max(1) {
        match provider.failover_log(&bucket, restart_ts.num_vbuckets()).await {
            Ok(flog) => {
                for vb in 0..restart_ts.num_vbuckets() {
                    let seq = restart_ts.seqnos[vb];
                    if let Some(lowest) = flog.lowest_vbuuid(vb, seq) {
                        if lowest != 0 && lowest != restart_ts.vbuuids[vb] {
                            tracing::info!(
                                bucket, vb, seq,
                                from = restart_ts.vbuuids[vb],
                                to = lowest,
                                "replacing restart vbuuid from failover log"
                            );
                            restart_ts.vbuuids[vb] = lowest;
                        }
                    }
                }
                return restart_ts;
            }
            Err(e) => {
                tracing::warn!(bucket, attempt, error = %e, "failover log fetch failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    tracing::error!(bucket, "upstream unavailable, restart timestamp left unvalidated");
    restart_ts
}

/// Provider used where no upstream is wired in; always returns an empty log.
pub struct NoopFailoverLog;

#[async_trait]
impl FailoverLogProvider for NoopFailoverLog {
    async fn failover_log(&self, _bucket: &str, num_vbuckets: usize) -> KestrelResult<FailoverLog> {
        Ok(FailoverLog {
            vbs: vec![Vec::new(); num_vbuckets],
        })
    }
}

/// Convenience wrapper: shared provider handle.
pub type SharedFailoverLog = Arc<dyn FailoverLogProvider>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSlice;
    use kestrel_common::timestamp::SnapshotType;
    use kestrel_common::types::SliceId;

    fn ts(seqnos: &[u64], snap_type: SnapshotType) -> TsVector {
        let mut t = TsVector::new(KeyspaceId::new("b"), seqnos.len());
        t.seqnos = seqnos.to_vec();
        t.snap_type = snap_type;
        t
    }

    fn seeded_slice(seqs: &[u64]) -> std::sync::Arc<MemSlice> {
        let slice = MemSlice::new(SliceId(0));
        // Seed oldest-to-newest; the slice keeps newest first.
        for s in seqs {
            slice.seed_snapshot(SnapshotInfo {
                ts: ts(&[*s], SnapshotType::Disk),
                committed: true,
            });
        }
        slice
    }

    #[test]
    fn test_failover_log_lowest_vbuuid() {
        let flog = FailoverLog {
            vbs: vec![vec![(30, 100), (20, 50), (10, 0)]],
        };
        // Oldest branch covering the seqno wins.
        assert_eq!(flog.lowest_vbuuid(0, 10), Some(10));
        assert_eq!(flog.lowest_vbuuid(0, 60), Some(10));
        assert_eq!(flog.lowest_vbuuid(0, 200), Some(10));
        assert_eq!(flog.lowest_vbuuid(1, 10), None);
    }

    #[tokio::test]
    async fn test_pick_newest_not_beyond_rollback_point() {
        let slice = seeded_slice(&[10, 20, 30]);
        let pick = find_rollback_snapshot(slice.as_ref(), &ts(&[22], SnapshotType::Disk))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pick.ts.seqnos, vec![20]);
    }

    #[tokio::test]
    async fn test_oso_snapshot_forces_zero() {
        let slice = MemSlice::new(SliceId(0));
        slice.seed_snapshot(SnapshotInfo {
            ts: ts(&[10], SnapshotType::DiskOso),
            committed: true,
        });
        slice.seed_snapshot(SnapshotInfo {
            ts: ts(&[20], SnapshotType::Disk),
            committed: true,
        });
        let pick = find_rollback_snapshot(slice.as_ref(), &ts(&[25], SnapshotType::Disk))
            .await
            .unwrap();
        assert!(pick.is_none());
    }

    #[tokio::test]
    async fn test_zero_seqno_uses_latest_when_unmarked() {
        let slice = seeded_slice(&[10, 20]);
        let pick = find_rollback_snapshot(slice.as_ref(), &ts(&[0], SnapshotType::Disk))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pick.ts.seqnos, vec![20]);
    }

    #[tokio::test]
    async fn test_zero_seqno_steps_past_last_used() {
        let slice = seeded_slice(&[10, 20]);
        slice.set_last_rollback_ts(Some(ts(&[20], SnapshotType::Disk)));
        let pick = find_rollback_snapshot(slice.as_ref(), &ts(&[0], SnapshotType::Disk))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pick.ts.seqnos, vec![10]);

        // Nothing older than the oldest used snapshot: revert to zero.
        slice.set_last_rollback_ts(Some(ts(&[10], SnapshotType::Disk)));
        let pick = find_rollback_snapshot(slice.as_ref(), &ts(&[0], SnapshotType::Disk))
            .await
            .unwrap();
        assert!(pick.is_none());
    }

    #[tokio::test]
    async fn test_rollback_to_snapshot_marks_last_used() {
        let slice = seeded_slice(&[10, 20]);
        let info = SnapshotInfo {
            ts: ts(&[10], SnapshotType::Disk),
            committed: true,
        };
        let restart = rollback_to_snapshot(
            InstanceId(1),
            PartitionId(0),
            slice.as_ref(),
            Some(info),
            true,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(restart.seqnos, vec![10]);
        assert_eq!(slice.last_rollback_ts().unwrap().seqnos, vec![10]);
    }

    #[tokio::test]
    async fn test_rollback_to_zero_clears_last_used() {
        let slice = seeded_slice(&[10]);
        slice.set_last_rollback_ts(Some(ts(&[10], SnapshotType::Disk)));
        let restart =
            rollback_to_snapshot(InstanceId(1), PartitionId(0), slice.as_ref(), None, false)
                .await
                .unwrap();
        assert!(restart.is_none());
        assert!(slice.last_rollback_ts().is_none());
        assert_eq!(slice.rollback_to_zero_count(), 1);
    }

    struct FixedFlog(FailoverLog);

    #[async_trait]
    impl FailoverLogProvider for FixedFlog {
        async fn failover_log(&self, _bucket: &str, _n: usize) -> KestrelResult<FailoverLog> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_validate_restart_ts_substitutes_vbuuid() {
        let provider = FixedFlog(FailoverLog {
            vbs: vec![vec![(77, 0)], vec![(88, 0)]],
        });
        let mut restart = ts(&[5, 5], SnapshotType::Disk);
        restart.vbuuids = vec![77, 12];
        let validated = validate_restart_ts(&provider, &KeyspaceId::new("b"), restart, 3).await;
        // vb0 matches the log; vb1 is replaced by the log's branch.
        assert_eq!(validated.vbuuids, vec![77, 88]);
    }
}
