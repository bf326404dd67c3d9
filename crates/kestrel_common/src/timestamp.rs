//! Vector timestamps over the upstream virtual-bucket space.
//!
//! A [`TsVector`] carries one `(seqno, vbuuid)` pair per virtual bucket of
//! the upstream source, plus the snapshot type the flush that produced it was
//! tagged with. Comparison is componentwise on sequence numbers; vbuuids are
//! matched only where both sides pin one.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::types::KeyspaceId;

/// How the upstream tagged the snapshot boundary of a flushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotType {
    /// In-memory only; no storage snapshot owed.
    None,
    /// In-memory, out-of-sequence-order bulk load.
    NoneOso,
    /// Disk snapshot; storage commit required.
    Disk,
    /// Disk snapshot from an out-of-sequence-order bulk load.
    DiskOso,
    /// Commit forced regardless of flush contents.
    ForceCommit,
    /// Commit forced as part of a partition merge.
    ForceCommitMerge,
}

impl SnapshotType {
    /// True when the storage engine must commit before the snapshot is usable.
    pub fn needs_commit(&self) -> bool {
        matches!(self, SnapshotType::Disk | SnapshotType::DiskOso)
    }

    pub fn is_force_commit(&self) -> bool {
        matches!(self, SnapshotType::ForceCommit | SnapshotType::ForceCommitMerge)
    }

    /// True for snapshot types that skip snapshot creation entirely.
    pub fn is_no_snap(&self) -> bool {
        matches!(self, SnapshotType::None | SnapshotType::NoneOso)
    }

    /// Out-of-sequence-order snapshots are never valid rollback targets.
    pub fn is_oso(&self) -> bool {
        matches!(self, SnapshotType::NoneOso | SnapshotType::DiskOso)
    }
}

/// Fixed-width vector of `(seqno, vbuuid)` pairs over the virtual buckets of
/// one keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsVector {
    pub keyspace: KeyspaceId,
    pub seqnos: Vec<u64>,
    pub vbuuids: Vec<u64>,
    pub snap_type: SnapshotType,
    /// Hash of the vbuuid vector; recorded before a snapshot is published so
    /// readers can detect branch divergence cheaply.
    pub crc64: u64,
    /// Set when the timestamp predates collection manifests and the manifest
    /// position must be treated as epoch.
    pub epoch_manifest: bool,
}

impl TsVector {
    /// A zero timestamp over `num_vbuckets` slots. The zero vector hashes to
    /// crc64 == 0 by convention (an epoch nil snapshot is recognizable).
    pub fn new(keyspace: KeyspaceId, num_vbuckets: usize) -> Self {
        TsVector {
            keyspace,
            seqnos: vec![0; num_vbuckets],
            vbuuids: vec![0; num_vbuckets],
            snap_type: SnapshotType::None,
            crc64: 0,
            epoch_manifest: false,
        }
    }

    pub fn num_vbuckets(&self) -> usize {
        self.seqnos.len()
    }

    /// Hash of the vbuuid vector. Zero for an all-zero vector.
    pub fn hash_vbuuids(&self) -> u64 {
        if self.vbuuids.iter().all(|v| *v == 0) {
            return 0;
        }
        let mut buf = Vec::with_capacity(self.vbuuids.len() * 8);
        for v in &self.vbuuids {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        xxh3_64(&buf)
    }

    /// Recompute and store `crc64` from the current vbuuid vector.
    pub fn compute_crc64(&mut self) {
        self.crc64 = self.hash_vbuuids();
    }

    /// Componentwise `self >= other` on sequence numbers. When
    /// `match_vbuuids` is set, slots where both sides carry a non-zero vbuuid
    /// must agree.
    pub fn equal_or_greater(&self, other: &TsVector, match_vbuuids: bool) -> bool {
        if self.seqnos.len() != other.seqnos.len() {
            return false;
        }
        for i in 0..self.seqnos.len() {
            if self.seqnos[i] < other.seqnos[i] {
                return false;
            }
            if match_vbuuids
                && other.vbuuids[i] != 0
                && self.vbuuids[i] != 0
                && self.vbuuids[i] != other.vbuuids[i]
            {
                return false;
            }
        }
        true
    }

    /// Pointwise `self >= other` with at least one strictly greater slot.
    pub fn greater_than(&self, other: &TsVector) -> bool {
        if self.seqnos.len() != other.seqnos.len() {
            return false;
        }
        let mut strict = false;
        for i in 0..self.seqnos.len() {
            if self.seqnos[i] < other.seqnos[i] {
                return false;
            }
            if self.seqnos[i] > other.seqnos[i] {
                strict = true;
            }
        }
        strict
    }

    /// Seqno and vbuuid vectors both equal.
    pub fn equal(&self, other: &TsVector) -> bool {
        self.seqnos == other.seqnos && self.vbuuids == other.vbuuids
    }

    /// True when any slot carries a zero sequence number, i.e. the upstream
    /// asked for a complete rewind of at least one virtual bucket.
    pub fn has_zero_seq_num(&self) -> bool {
        self.seqnos.iter().any(|s| *s == 0)
    }

    /// Flag the manifest position as epoch when nothing set it.
    pub fn set_epoch_manifest_if_empty(&mut self) {
        if !self.epoch_manifest {
            self.epoch_manifest = true;
        }
    }
}
