//! Core identifiers and index metadata shared across the workspace.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for an index instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst:{}", self.0)
    }
}

/// Unique identifier for an index definition. Several instances (replicas,
/// proxies during rebalance) can share one definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefnId(pub u64);

impl fmt::Display for DefnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "defn:{}", self.0)
    }
}

/// Unique identifier for a partition within an index instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition:{}", self.0)
    }
}

/// Identifier of a storage slice within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceId(pub u64);

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slice:{}", self.0)
    }
}

/// Upstream mutation stream an instance is fed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamId {
    /// Steady-state maintenance stream.
    Maint,
    /// Initial-build stream for indexes still backfilling.
    Init,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Maint => write!(f, "MAINT"),
            StreamId::Init => write!(f, "INIT"),
        }
    }
}

/// Keyspace an index is built over, encoded `bucket[:scope[:collection]]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyspaceId(pub String);

impl KeyspaceId {
    pub fn new(s: impl Into<String>) -> Self {
        KeyspaceId(s.into())
    }

    /// The bucket component (first `:`-separated segment).
    pub fn bucket(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an index instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Initial,
    Pending,
    Loading,
    Active,
    Deleted,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexState::Initial => write!(f, "INITIAL"),
            IndexState::Pending => write!(f, "PENDING"),
            IndexState::Loading => write!(f, "LOADING"),
            IndexState::Active => write!(f, "ACTIVE"),
            IndexState::Deleted => write!(f, "DELETED"),
        }
    }
}

/// WHERE clause attached to a partial index.
///
/// `covers` maps each secondary key expression pinned by the clause to the
/// encoded value it is pinned to. The planner uses it to prove that a scan's
/// equality filters imply the clause (fast-count rewrite).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhereClause {
    pub text: String,
    pub covers: BTreeMap<String, Vec<u8>>,
}

/// Immutable definition of an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefn {
    pub defn_id: DefnId,
    pub name: String,
    pub keyspace: KeyspaceId,
    pub is_primary: bool,
    pub is_array: bool,
    /// Secondary key expression names, in key order. Empty for primary.
    pub sec_exprs: Vec<String>,
    /// Per-key descending collation bitmap; empty means all ascending.
    pub desc: Vec<bool>,
    pub where_clause: Option<WhereClause>,
}

impl IndexDefn {
    pub fn has_descending(&self) -> bool {
        self.desc.iter().any(|d| *d)
    }

    pub fn is_desc(&self, pos: usize) -> bool {
        self.desc.get(pos).copied().unwrap_or(false)
    }
}

/// A live index instance: a definition bound to a stream and a state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInstance {
    pub inst_id: InstanceId,
    pub defn: IndexDefn,
    pub state: IndexState,
    pub stream: StreamId,
}

impl IndexInstance {
    /// True when this instance is fed by `(stream, keyspace)` and not deleted.
    pub fn matches_stream(&self, stream: StreamId, keyspace: &KeyspaceId) -> bool {
        self.stream == stream && &self.defn.keyspace == keyspace && self.state != IndexState::Deleted
    }
}
