//! Wire-level scan requests and their translation into a canonical plan.
//!
//! Five request shapes arrive from the wire as one tagged enum; planning
//! produces a [`ScanRequest`] carrying an ordered list of non-overlapping
//! storage scans plus projection, group-aggregate and explode/decode
//! planning, consumed uniformly by execution.

use kestrel_common::config::CoreConfig;
use kestrel_common::consistency::Consistency;
use kestrel_common::error::ScanError;
use kestrel_common::timestamp::TsVector;
use kestrel_common::types::{IndexDefn, IndexInstance, IndexState, InstanceId, KeyspaceId, PartitionId};
use kestrel_common::KestrelResult;

use crate::groupaggr::GroupAggr;
use crate::key::{IndexKey, Inclusion};
use crate::plan::Scan;

/// Request types accepted on the scan surface. `FastCount` is generated
/// internally by the planner rewrite, never by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanReqType {
    Helo,
    Stats,
    Count,
    Scan,
    ScanAll,
    MultiScanCount,
    FastCount,
}

/// Single range over one key position, as sent on the wire.
#[derive(Debug, Clone, Default)]
pub struct WireFilter {
    pub low: Option<Vec<u8>>,
    pub high: Option<Vec<u8>>,
    pub inclusion: Inclusion,
}

/// One scan of a composite index: either an equality prefix or a list of
/// per-position filters.
#[derive(Debug, Clone, Default)]
pub struct WireScan {
    pub equals: Vec<Vec<u8>>,
    pub filters: Vec<WireFilter>,
}

/// Legacy single-range span.
#[derive(Debug, Clone, Default)]
pub struct WireSpan {
    pub low: Option<Vec<u8>>,
    pub high: Option<Vec<u8>>,
    pub equals: Vec<Vec<u8>>,
    pub inclusion: Inclusion,
}

/// Which entry-key positions the scan should emit.
#[derive(Debug, Clone, Default)]
pub struct WireProjection {
    pub entry_keys: Vec<i64>,
    pub primary_key: bool,
}

/// Explicit consistency vector accompanying query-consistency scans.
#[derive(Debug, Clone, Default)]
pub struct WireTsVector {
    pub vbnos: Vec<u16>,
    pub seqnos: Vec<u64>,
    pub vbuuids: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct WireGroupKey {
    pub entry_key_id: i32,
    /// `>= 0` means use the key at this position; otherwise `expr` applies.
    pub key_pos: i32,
    pub expr: String,
}

#[derive(Debug, Clone, Default)]
pub struct WireAggregate {
    /// Aggregate function code; see [`crate::groupaggr::AggrFunc`].
    pub aggr_func: u32,
    pub entry_key_id: i32,
    pub key_pos: i32,
    pub expr: String,
    pub distinct: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WireGroupAggr {
    pub name: String,
    pub group_keys: Vec<WireGroupKey>,
    pub aggrs: Vec<WireAggregate>,
    pub depends_on_index_keys: Vec<i32>,
    pub index_key_names: Vec<String>,
    pub allow_partial_aggr: bool,
    pub one_per_primary_key: bool,
}

/// The five wire request shapes.
#[derive(Debug, Clone)]
pub enum WireRequest {
    Helo,
    Statistics {
        defn_id: u64,
        span: WireSpan,
    },
    Count {
        defn_id: u64,
        partition_ids: Vec<PartitionId>,
        cons: Consistency,
        vector: Option<WireTsVector>,
        span: WireSpan,
        scans: Vec<WireScan>,
        distinct: bool,
    },
    Scan {
        defn_id: u64,
        partition_ids: Vec<PartitionId>,
        cons: Consistency,
        vector: Option<WireTsVector>,
        span: WireSpan,
        scans: Vec<WireScan>,
        projection: Option<WireProjection>,
        group_aggr: Option<WireGroupAggr>,
        limit: i64,
        offset: i64,
        reverse: bool,
        sorted: bool,
        distinct: bool,
    },
    ScanAll {
        defn_id: u64,
        partition_ids: Vec<PartitionId>,
        cons: Consistency,
        vector: Option<WireTsVector>,
        limit: i64,
    },
}

/// Resolved projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub project_sec_keys: bool,
    pub projection_keys: Vec<bool>,
    pub entry_keys_empty: bool,
    pub project_group_keys: Vec<ProjGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjGroup {
    pub pos: usize,
    pub grp_key: bool,
}

/// Canonical, planned scan request.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub scan_type: ScanReqType,
    pub defn_id: u64,
    pub inst_id: InstanceId,
    pub index_name: String,
    pub keyspace: KeyspaceId,
    pub partition_ids: Vec<PartitionId>,
    pub cons: Consistency,
    pub ts: Option<TsVector>,

    pub is_primary: bool,
    pub(crate) defn: IndexDefn,

    // Legacy single-range fields.
    pub low: IndexKey,
    pub high: IndexKey,
    pub keys: Vec<IndexKey>,
    pub incl: Inclusion,

    /// Ordered, non-overlapping storage scans.
    pub scans: Vec<Scan>,
    pub projection: Option<Projection>,
    pub group_aggr: Option<GroupAggr>,

    pub limit: i64,
    pub offset: i64,
    pub reverse: bool,
    pub sorted: bool,
    pub distinct: bool,
    pub project_primary_key: bool,

    pub explode_positions: Vec<bool>,
    pub decode_positions: Vec<bool>,
    pub explode_upto: i32,
}

impl ScanRequest {
    /// Plan a wire request against an index instance.
    ///
    /// `session_ts` carries the upstream's current sequence numbers, fetched
    /// by the dispatcher at request arrival; it is required for session
    /// consistency.
    pub fn new(
        wire: WireRequest,
        inst: &IndexInstance,
        config: &CoreConfig,
        session_ts: Option<TsVector>,
    ) -> KestrelResult<ScanRequest> {
        let mut r = ScanRequest::empty(inst);

        match wire {
            WireRequest::Helo => {
                r.scan_type = ScanReqType::Helo;
            }
            WireRequest::Statistics { defn_id, span } => {
                r.scan_type = ScanReqType::Stats;
                r.defn_id = defn_id;
                r.sorted = true;
                r.incl = span.inclusion;
                r.check_ready(inst)?;
                r.fill_ranges(&span)?;
                r.fill_scans(&[])?;
            }
            WireRequest::Count {
                defn_id,
                partition_ids,
                cons,
                vector,
                span,
                scans,
                distinct,
            } => {
                r.scan_type = ScanReqType::Count;
                r.defn_id = defn_id;
                r.partition_ids = partition_ids;
                r.sorted = true;
                r.incl = span.inclusion;
                r.check_ready(inst)?;
                r.set_consistency(cons, vector, config, session_ts)?;
                r.fill_ranges(&span)?;
                if scans.is_empty() {
                    r.fill_scans(&[])?;
                } else {
                    r.fill_scans(&scans)?;
                    r.scan_type = ScanReqType::MultiScanCount;
                    r.distinct = distinct;
                }
            }
            WireRequest::Scan {
                defn_id,
                partition_ids,
                cons,
                vector,
                span,
                scans,
                projection,
                group_aggr,
                limit,
                offset,
                reverse,
                sorted,
                distinct,
            } => {
                r.scan_type = ScanReqType::Scan;
                r.defn_id = defn_id;
                r.partition_ids = partition_ids;
                r.incl = span.inclusion;
                r.limit = limit;
                r.offset = offset;
                r.reverse = reverse;
                r.sorted = sorted;
                r.check_ready(inst)?;
                r.set_consistency(cons, vector, config, session_ts)?;

                match &projection {
                    Some(proj) if group_aggr.is_none() => {
                        r.projection =
                            Some(validate_index_projection(proj, r.defn.sec_exprs.len())?);
                        r.project_primary_key = proj.primary_key;
                    }
                    Some(proj) => {
                        r.projection = Some(validate_index_projection_group_aggr(
                            proj,
                            group_aggr.as_ref().unwrap(),
                        )?);
                        r.project_primary_key = false;
                    }
                    None => {
                        r.distinct = distinct;
                    }
                }

                r.fill_ranges(&span)?;
                r.fill_scans(&scans)?;
                r.fill_group_aggr(group_aggr.as_ref(), &scans, config)?;
                r.set_explode_positions();
            }
            WireRequest::ScanAll {
                defn_id,
                partition_ids,
                cons,
                vector,
                limit,
            } => {
                r.scan_type = ScanReqType::ScanAll;
                r.defn_id = defn_id;
                r.partition_ids = partition_ids;
                r.limit = limit;
                r.sorted = true;
                r.scans = vec![Scan::scan_all()];
                r.check_ready(inst)?;
                r.set_consistency(cons, vector, config, session_ts)?;
            }
        }

        Ok(r)
    }

    fn empty(inst: &IndexInstance) -> ScanRequest {
        let nkeys = inst.defn.sec_exprs.len();
        ScanRequest {
            scan_type: ScanReqType::Helo,
            defn_id: inst.defn.defn_id.0,
            inst_id: inst.inst_id,
            index_name: inst.defn.name.clone(),
            keyspace: inst.defn.keyspace.clone(),
            partition_ids: Vec::new(),
            cons: Consistency::Any,
            ts: None,
            is_primary: inst.defn.is_primary,
            defn: inst.defn.clone(),
            low: IndexKey::Min,
            high: IndexKey::Max,
            keys: Vec::new(),
            incl: Inclusion::Neither,
            scans: Vec::new(),
            projection: None,
            group_aggr: None,
            limit: 0,
            offset: 0,
            reverse: false,
            sorted: false,
            distinct: false,
            project_primary_key: true,
            explode_positions: vec![false; nkeys],
            decode_positions: vec![false; nkeys],
            explode_upto: -1,
        }
    }

    fn check_ready(&self, inst: &IndexInstance) -> KestrelResult<()> {
        match inst.state {
            IndexState::Active => Ok(()),
            IndexState::Deleted => Err(ScanError::IndexNotFound(inst.inst_id).into()),
            _ => Err(ScanError::IndexNotReady(inst.inst_id).into()),
        }
    }

    fn set_consistency(
        &mut self,
        cons: Consistency,
        vector: Option<WireTsVector>,
        config: &CoreConfig,
        session_ts: Option<TsVector>,
    ) -> KestrelResult<()> {
        self.cons = cons;
        match cons {
            Consistency::Query => {
                if let Some(vector) = vector {
                    let mut ts = TsVector::new(self.keyspace.clone(), config.num_vbuckets);
                    for (i, vbno) in vector.vbnos.iter().enumerate() {
                        let vb = *vbno as usize;
                        if vb >= ts.seqnos.len() {
                            return Err(ScanError::InvalidRequest(format!(
                                "consistency vector vb {vb} out of range"
                            ))
                            .into());
                        }
                        ts.seqnos[vb] = vector.seqnos.get(i).copied().unwrap_or(0);
                        ts.vbuuids[vb] = vector.vbuuids.get(i).copied().unwrap_or(0);
                    }
                    self.ts = Some(ts);
                }
                // A missing vector degrades to any-consistency semantics.
                Ok(())
            }
            Consistency::Session => match session_ts {
                Some(ts) => {
                    self.ts = Some(ts);
                    Ok(())
                }
                None => Err(ScanError::InvalidRequest(
                    "session consistency requires current upstream seqnos".into(),
                )
                .into()),
            },
            Consistency::Any | Consistency::Absolute => Ok(()),
        }
    }

    pub(crate) fn is_nil_key(&self, k: &Option<Vec<u8>>) -> bool {
        match k {
            None => true,
            Some(b) => b.is_empty() || (!self.is_primary && b.as_slice() == b"[]"),
        }
    }

    pub(crate) fn new_key(&self, k: &[u8]) -> KestrelResult<IndexKey> {
        if self.is_primary {
            Ok(IndexKey::Key(k.to_vec()))
        } else {
            // Secondary keys arrive as a single encoded element.
            Ok(IndexKey::Key(k.to_vec()))
        }
    }

    pub(crate) fn new_low_key(&self, k: &Option<Vec<u8>>) -> KestrelResult<IndexKey> {
        if self.is_nil_key(k) {
            return Ok(IndexKey::Min);
        }
        self.new_key(k.as_deref().unwrap_or_default())
    }

    pub(crate) fn new_high_key(&self, k: &Option<Vec<u8>>) -> KestrelResult<IndexKey> {
        if self.is_nil_key(k) {
            return Ok(IndexKey::Max);
        }
        self.new_key(k.as_deref().unwrap_or_default())
    }

    fn fill_ranges(&mut self, span: &WireSpan) -> KestrelResult<()> {
        self.low = self.new_low_key(&span.low)?;
        self.high = self.new_high_key(&span.high)?;
        for k in &span.equals {
            let key = self.new_key(k)?;
            self.keys.push(key);
        }
        Ok(())
    }
}

pub(crate) fn validate_index_projection(
    projection: &WireProjection,
    cklen: usize,
) -> KestrelResult<Projection> {
    if projection.entry_keys.len() > cklen {
        return Err(ScanError::InvalidRequest(format!(
            "invalid number of entry keys {} in projection",
            projection.entry_keys.len()
        ))
        .into());
    }

    let mut projection_keys = vec![false; cklen];
    for &position in &projection.entry_keys {
        if position < 0 || position as usize >= cklen {
            return Err(ScanError::InvalidRequest(format!(
                "invalid entry key {position} in projection"
            ))
            .into());
        }
        projection_keys[position as usize] = true;
    }

    let project_all = projection_keys.iter().all(|p| *p);
    Ok(Projection {
        project_sec_keys: !project_all,
        projection_keys,
        entry_keys_empty: projection.entry_keys.is_empty(),
        project_group_keys: Vec::new(),
    })
}

pub(crate) fn validate_index_projection_group_aggr(
    projection: &WireProjection,
    ga: &WireGroupAggr,
) -> KestrelResult<Projection> {
    if projection.entry_keys.is_empty() {
        return Err(
            ScanError::InvalidRequest("grouping without projection is not supported".into()).into(),
        );
    }

    let mut proj_grp = Vec::with_capacity(projection.entry_keys.len());
    for &entry_id in &projection.entry_keys {
        let group_pos = ga
            .group_keys
            .iter()
            .position(|g| entry_id == g.entry_key_id as i64);
        if let Some(pos) = group_pos {
            proj_grp.push(ProjGroup { pos, grp_key: true });
            continue;
        }
        let aggr_pos = ga
            .aggrs
            .iter()
            .position(|a| entry_id == a.entry_key_id as i64);
        match aggr_pos {
            Some(pos) => proj_grp.push(ProjGroup {
                pos,
                grp_key: false,
            }),
            None => {
                return Err(ScanError::InvalidRequest(format!(
                    "projection entry {entry_id} not found in any group or aggregate"
                ))
                .into())
            }
        }
    }

    Ok(Projection {
        project_sec_keys: true,
        projection_keys: Vec::new(),
        entry_keys_empty: false,
        project_group_keys: proj_grp,
    })
}
