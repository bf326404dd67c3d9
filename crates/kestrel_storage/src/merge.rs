//! Snapshot merge and prune.
//!
//! When partitioned index instances are re-homed, the snapshots of the moved
//! partitions are spliced from a source instance into a target, or a subset
//! of partitions is dropped, without disturbing in-flight scans: every kept
//! slice snapshot takes an extra reference before the composite is published,
//! and the source snapshot is left untouched (its references fall when the
//! source instance is deleted).

use std::sync::Arc;

use kestrel_common::error::StorageError;
use kestrel_common::types::{InstanceId, PartitionId};
use kestrel_common::KestrelResult;

use crate::container::SnapshotContainer;
use crate::context::CoreContext;
use crate::snapshot::IndexSnapshot;

/// Build the composite snapshot for `Merge(src → tgt, partitions)`.
///
/// Returns the snapshot to publish as the target's new current. Precondition
/// violations are fatal to the operation and reported as `MergeFailed`.
pub fn merge_snapshots(
    ctx: &CoreContext,
    src_id: InstanceId,
    tgt_id: InstanceId,
    partitions: &[PartitionId],
) -> KestrelResult<Option<IndexSnapshot>> {
    let snap_map = ctx.snapshots();
    let Some(src_c) = snap_map.get(&src_id) else {
        // Nothing to merge from; treated as a no-op like a vanished proxy.
        tracing::info!(src = %src_id, tgt = %tgt_id, "merge source has no snapshot container, skipping");
        return Ok(None);
    };

    let Some(tgt_c) = snap_map.get(&tgt_id) else {
        // Target has no container yet: the source clone becomes the target's
        // first snapshot wholesale.
        let clone = src_c.with_current(|src, _| src.clone_snapshot());
        return Ok(Some(retarget(clone, tgt_id, ctx.next_snap_id())));
    };

    build_merged(src_c, tgt_c, src_id, tgt_id, partitions, ctx.next_snap_id()).map(Some)
}

fn build_merged(
    src_c: &Arc<SnapshotContainer>,
    tgt_c: &Arc<SnapshotContainer>,
    src_id: InstanceId,
    tgt_id: InstanceId,
    partitions: &[PartitionId],
    snap_id: u64,
) -> KestrelResult<IndexSnapshot> {
    src_c.with_current(|src, _| {
        tgt_c.with_current(|tgt, _| {
            // The source must be at least as fresh as the target, or splicing
            // its partitions in could lose acknowledged mutations.
            if !src.ts.equal_or_greater(&tgt.ts, false) {
                return Err(StorageError::MergeFailed(format!(
                    "timestamp mismatch between snapshots: source {src_id} behind target {tgt_id}"
                ))
                .into());
            }

            // An empty source tree means the keyspace saw no mutations; the
            // partition checks are meaningless in that case.
            if !src.partitions.is_empty() {
                let covered = partitions
                    .iter()
                    .filter(|p| src.partitions.contains_key(*p))
                    .count();
                if covered != partitions.len() || covered != src.partitions.len() {
                    return Err(StorageError::MergeFailed(format!(
                        "source {src_id} does not carry exactly the requested partitions {partitions:?}"
                    ))
                    .into());
                }

                for pid in src.partitions.keys() {
                    if tgt.partitions.contains_key(pid) {
                        return Err(StorageError::MergeFailed(format!(
                            "duplicate partition {pid} between source {src_id} and target {tgt_id}"
                        ))
                        .into());
                    }
                }
            }

            let mut merged = tgt.clone_snapshot();
            if !partitions.is_empty() {
                let moved = src.deep_clone(Some(partitions));
                for (pid, ps) in moved.partitions {
                    merged.partitions.insert(pid, ps);
                }
            }
            merged.snap_id = snap_id;
            Ok(merged)
        })
    })
}

/// Build the pruned snapshot for `Prune(inst, keep)`. An empty keep set is
/// legal and yields a snapshot with no partitions.
pub fn prune_snapshot(
    ctx: &CoreContext,
    inst_id: InstanceId,
    keep: &[PartitionId],
) -> Option<IndexSnapshot> {
    let snap_map = ctx.snapshots();
    let container = snap_map.get(&inst_id)?;
    let mut pruned = container.with_current(|cur, _| cur.deep_clone(Some(keep)));
    pruned.snap_id = ctx.next_snap_id();
    Some(pruned)
}

fn retarget(mut snap: IndexSnapshot, inst_id: InstanceId, snap_id: u64) -> IndexSnapshot {
    snap.inst_id = inst_id;
    snap.snap_id = snap_id;
    snap
}
