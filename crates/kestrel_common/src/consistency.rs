//! Scan consistency modes and the snapshot freshness predicate.

use serde::{Deserialize, Serialize};

use crate::timestamp::TsVector;

/// Freshness a scan demands from the snapshot it runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Any snapshot will do.
    Any,
    /// Request carries an explicit target timestamp the snapshot must reach.
    Query,
    /// Like `Query`, but the target timestamp is the upstream's current
    /// position fetched at request arrival.
    Session,
    /// Reserved for synchronized-commit deployments; treated as satisfied.
    Absolute,
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consistency::Any => write!(f, "any"),
            Consistency::Query => write!(f, "query"),
            Consistency::Session => write!(f, "session"),
            Consistency::Absolute => write!(f, "absolute"),
        }
    }
}

/// Does a snapshot at `snap_ts` satisfy `(cons, req_ts)`?
///
/// `Query` and `Session` both demand `snap_ts >= req_ts` seqno-wise, with
/// vbuuids matched where the request pins one. A request without a timestamp
/// is satisfied by anything.
pub fn is_snapshot_consistent(
    snap_ts: &TsVector,
    cons: Consistency,
    req_ts: Option<&TsVector>,
) -> bool {
    match cons {
        Consistency::Any | Consistency::Absolute => true,
        Consistency::Query | Consistency::Session => match req_ts {
            None => true,
            Some(req) => snap_ts.equal_or_greater(req, true),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyspaceId;

    fn ts(seqnos: &[u64]) -> TsVector {
        let mut t = TsVector::new(KeyspaceId::new("b"), seqnos.len());
        t.seqnos = seqnos.to_vec();
        t
    }

    #[test]
    fn test_any_and_absolute_always_pass() {
        let snap = ts(&[0, 0]);
        let req = ts(&[9, 9]);
        assert!(is_snapshot_consistent(&snap, Consistency::Any, Some(&req)));
        assert!(is_snapshot_consistent(&snap, Consistency::Absolute, Some(&req)));
    }

    #[test]
    fn test_query_requires_reaching_target() {
        let snap = ts(&[5, 5]);
        assert!(is_snapshot_consistent(&snap, Consistency::Query, Some(&ts(&[5, 4]))));
        assert!(!is_snapshot_consistent(&snap, Consistency::Query, Some(&ts(&[5, 6]))));
        assert!(is_snapshot_consistent(&snap, Consistency::Query, None));
    }

    #[test]
    fn test_query_pins_vbuuids() {
        let mut snap = ts(&[5, 5]);
        snap.vbuuids = vec![1, 2];
        let mut req = ts(&[5, 5]);
        req.vbuuids = vec![1, 3];
        assert!(!is_snapshot_consistent(&snap, Consistency::Query, Some(&req)));
        req.vbuuids = vec![1, 0];
        assert!(is_snapshot_consistent(&snap, Consistency::Query, Some(&req)));
    }

    #[test]
    fn test_session_same_predicate_as_query() {
        let snap = ts(&[7]);
        assert!(is_snapshot_consistent(&snap, Consistency::Session, Some(&ts(&[7]))));
        assert!(!is_snapshot_consistent(&snap, Consistency::Session, Some(&ts(&[8]))));
    }
}
