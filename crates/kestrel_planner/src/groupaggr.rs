//! Group-by / aggregate pushdown planning.
//!
//! Validates the requested grouping against the index key order, decides
//! which positions execution must explode or decode, and applies the two
//! pre-execution rewrites: stop-at-first-valid-aggregate and the fast-count
//! rewrite that answers an eligible COUNT from index metadata or a single
//! range.

use kestrel_common::config::CoreConfig;
use kestrel_common::error::ScanError;
use kestrel_common::KestrelResult;

use crate::codec;
use crate::key::{Inclusion, IndexKey};
use crate::request::{ScanReqType, ScanRequest, WireGroupAggr, WireScan};

/// Aggregate functions the scan path can push down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrFunc {
    Min,
    Max,
    Sum,
    Count,
    CountDistinct,
}

impl AggrFunc {
    /// Map a wire function code; anything unknown is rejected.
    pub fn from_wire(code: u32) -> KestrelResult<AggrFunc> {
        match code {
            0 => Ok(AggrFunc::Min),
            1 => Ok(AggrFunc::Max),
            2 => Ok(AggrFunc::Sum),
            3 => Ok(AggrFunc::Count),
            4 => Ok(AggrFunc::CountDistinct),
            other => {
                Err(ScanError::InvalidRequest(format!("invalid aggregate function {other}")).into())
            }
        }
    }
}

/// A compiled grouping/aggregate expression. Only the shapes the planner
/// reasons about are modeled: constants (foldable) and field references.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    Const(serde_json::Value),
    Field(String),
}

impl ScalarExpr {
    /// Compile expression text: a JSON literal folds to a constant, anything
    /// else is a field reference evaluated per entry.
    pub fn compile(text: &str) -> KestrelResult<ScalarExpr> {
        if text.is_empty() {
            return Err(ScanError::InvalidRequest("expression is empty".into()).into());
        }
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(v) => Ok(ScalarExpr::Const(v)),
            Err(_) => Ok(ScalarExpr::Field(text.to_string())),
        }
    }

    pub fn constant_value(&self) -> Option<&serde_json::Value> {
        match self {
            ScalarExpr::Const(v) => Some(v),
            ScalarExpr::Field(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupKey {
    pub entry_key_id: i32,
    /// `>= 0` uses the index key at this position; otherwise `expr`.
    pub key_pos: i32,
    pub expr: Option<ScalarExpr>,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub aggr_func: AggrFunc,
    pub entry_key_id: i32,
    pub key_pos: i32,
    pub expr: Option<ScalarExpr>,
    pub distinct: bool,
}

/// Planned grouping and aggregation.
#[derive(Debug, Clone, Default)]
pub struct GroupAggr {
    pub name: String,
    pub group: Vec<GroupKey>,
    pub aggrs: Vec<Aggregate>,
    pub depends_on_index_keys: Vec<i32>,
    pub index_key_names: Vec<String>,
    pub depends_on_primary_key: bool,
    pub allow_partial_aggr: bool,
    pub one_per_primary_key: bool,

    pub is_leading_group: bool,
    pub is_primary: bool,
    pub need_decode: bool,
    pub need_explode: bool,
    pub has_expr: bool,
    pub first_valid_aggr_only: bool,
}

impl ScanRequest {
    pub(crate) fn fill_group_aggr(
        &mut self,
        wire: Option<&WireGroupAggr>,
        wire_scans: &[WireScan],
        config: &CoreConfig,
    ) -> KestrelResult<()> {
        let Some(wire) = wire else {
            return Ok(());
        };

        let mut ga = GroupAggr {
            name: wire.name.clone(),
            allow_partial_aggr: wire.allow_partial_aggr,
            one_per_primary_key: wire.one_per_primary_key,
            is_primary: self.is_primary,
            ..Default::default()
        };

        self.unmarshal_group_keys(&mut ga, wire)?;
        self.unmarshal_aggrs(&mut ga, wire)?;

        let nkeys = self.defn.sec_exprs.len();
        for &d in &wire.depends_on_index_keys {
            ga.depends_on_index_keys.push(d);
            if !self.is_primary && d as usize == nkeys {
                ga.depends_on_primary_key = true;
            }
        }
        ga.index_key_names = wire.index_key_names.clone();

        self.validate_group_aggr(&mut ga)?;

        // Expression dependencies force both explode and decode on every
        // position they touch.
        if !self.is_primary && ga.has_expr {
            for &depends in &ga.depends_on_index_keys {
                let pos = depends as usize;
                if pos == nkeys {
                    continue; // depends on the primary key
                }
                self.explode_positions[pos] = true;
                self.decode_positions[pos] = true;
            }
        }

        self.group_aggr = Some(ga);

        if config.scan.enable_fast_count && self.can_use_fast_count(wire_scans) {
            self.scan_type = ScanReqType::FastCount;
        }
        Ok(())
    }

    fn unmarshal_group_keys(
        &mut self,
        ga: &mut GroupAggr,
        wire: &WireGroupAggr,
    ) -> KestrelResult<()> {
        for g in &wire.group_keys {
            let mut group_key = GroupKey {
                entry_key_id: g.entry_key_id,
                key_pos: g.key_pos,
                expr: None,
            };
            if g.key_pos < 0 {
                let expr = ScalarExpr::compile(&g.expr).map_err(|_| {
                    ScanError::InvalidRequest("group expression is empty".into())
                })?;
                if expr.constant_value().is_none() {
                    ga.has_expr = true;
                    ga.need_decode = true;
                    ga.need_explode = true;
                }
                group_key.expr = Some(expr);
            } else {
                ga.need_explode = true;
                if !self.is_primary {
                    if let Some(p) = self.explode_positions.get_mut(g.key_pos as usize) {
                        *p = true;
                    }
                }
            }
            ga.group.push(group_key);
        }
        Ok(())
    }

    fn unmarshal_aggrs(&mut self, ga: &mut GroupAggr, wire: &WireGroupAggr) -> KestrelResult<()> {
        for a in &wire.aggrs {
            let mut aggr = Aggregate {
                aggr_func: AggrFunc::from_wire(a.aggr_func)?,
                entry_key_id: a.entry_key_id,
                key_pos: a.key_pos,
                expr: None,
                distinct: a.distinct,
            };
            if a.key_pos < 0 {
                let expr = ScalarExpr::compile(&a.expr).map_err(|_| {
                    ScanError::InvalidRequest("aggregate expression is empty".into())
                })?;
                if expr.constant_value().is_none() {
                    ga.has_expr = true;
                    ga.need_decode = true;
                    ga.need_explode = true;
                }
                aggr.expr = Some(expr);
            } else {
                if aggr.aggr_func == AggrFunc::Sum {
                    ga.need_decode = true;
                    if !self.is_primary {
                        if let Some(p) = self.decode_positions.get_mut(a.key_pos as usize) {
                            *p = true;
                        }
                    }
                }
                ga.need_explode = true;
                if !self.is_primary {
                    if let Some(p) = self.explode_positions.get_mut(a.key_pos as usize) {
                        *p = true;
                    }
                }
            }
            ga.aggrs.push(aggr);
        }
        Ok(())
    }

    fn validate_group_aggr(&self, ga: &mut GroupAggr) -> KestrelResult<()> {
        if self.is_primary {
            ga.is_leading_group = true;
            ga.first_valid_aggr_only = self.first_valid_aggr_only(ga);
            return Ok(());
        }

        let nkeys = self.defn.sec_exprs.len() as i32;

        // Group keys must form a prefix of the index keys; gaps are allowed
        // only where every emitted filter pins that position to one value.
        let mut prev_pos: i32 = -1;
        ga.is_leading_group = true;
        'outer: for g in &ga.group {
            if g.key_pos < 0 {
                ga.is_leading_group = false;
                break;
            } else if g.key_pos == 0 {
                prev_pos = 0;
            } else if g.key_pos != prev_pos + 1 {
                while prev_pos < g.key_pos - 1 {
                    prev_pos += 1;
                    if !self.has_all_equal_filters(prev_pos as usize) {
                        prev_pos -= 1;
                        break;
                    }
                }
                if g.key_pos != prev_pos + 1 {
                    ga.is_leading_group = false;
                    break 'outer;
                }
            }
            prev_pos = g.key_pos;
        }

        if !ga.allow_partial_aggr && !ga.is_leading_group {
            let err = ScanError::InvalidRequest(
                "partial aggregates not supported for the given scan".into(),
            );
            tracing::error!(index = %self.index_name, "group-aggregate validation failed: {err}");
            return Err(err.into());
        }

        for a in &ga.aggrs {
            if a.key_pos >= nkeys {
                return Err(ScanError::InvalidRequest(format!(
                    "invalid key position {} in aggregate",
                    a.key_pos
                ))
                .into());
            }
        }
        for g in &ga.group {
            if g.key_pos >= nkeys {
                return Err(ScanError::InvalidRequest(format!(
                    "invalid key position {} in group key",
                    g.key_pos
                ))
                .into());
            }
        }
        for &k in &ga.depends_on_index_keys {
            if k > nkeys {
                return Err(ScanError::InvalidRequest(format!(
                    "invalid key position {k} in aggregate dependencies"
                ))
                .into());
            }
        }

        ga.first_valid_aggr_only = self.first_valid_aggr_only(ga);
        Ok(())
    }

    /// Stop-at-first-valid-value optimization: with no grouping and a single
    /// MIN/MAX/COUNT aggregate, a scan ordered the right way can stop at the
    /// first valid entry.
    fn first_valid_aggr_only(&self, ga: &GroupAggr) -> bool {
        if !ga.group.is_empty() || ga.aggrs.len() != 1 {
            return false;
        }
        let aggr = &ga.aggrs[0];

        let equality_upto = |key_pos: i32| -> bool {
            if key_pos < 0 {
                return false;
            }
            if key_pos == 0 {
                return true;
            }
            // Multiple spans make the prefix ambiguous.
            if self.scans.len() > 1 {
                return false;
            }
            self.has_all_equal_filters_upto(key_pos as usize - 1)
        };
        let is_asc = |key_pos: i32| -> bool { !self.defn.is_desc(key_pos as usize) };

        match aggr.aggr_func {
            AggrFunc::Min => equality_upto(aggr.key_pos) && is_asc(aggr.key_pos),
            AggrFunc::Max => equality_upto(aggr.key_pos) && !is_asc(aggr.key_pos),
            AggrFunc::Count => {
                // COUNT(DISTINCT constant) is one by definition.
                aggr.distinct
                    && aggr
                        .expr
                        .as_ref()
                        .and_then(|e| e.constant_value())
                        .is_some()
            }
            _ => false,
        }
    }

    // ── Fast count rewrite ─────────────────────────────────────────────────

    fn can_use_fast_count(&self, wire_scans: &[WireScan]) -> bool {
        let Some(ga) = &self.group_aggr else {
            return false;
        };
        if ga.aggrs.len() != 1 || !ga.group.is_empty() {
            return false;
        }
        if self.defn.is_array || self.defn.is_primary {
            return false;
        }
        let aggr = &ga.aggrs[0];
        if aggr.aggr_func != AggrFunc::Count || aggr.distinct {
            return false;
        }
        self.can_use_fast_count_no_where(aggr) || self.can_use_fast_count_where(aggr, wire_scans)
    }

    /// Count of non-null leading values: one full-range scan whose only
    /// composite filter is `[null, unbounded)`.
    fn can_use_fast_count_no_where(&self, aggr: &Aggregate) -> bool {
        let on_leading_or_const = aggr.key_pos == 0
            || aggr
                .expr
                .as_ref()
                .and_then(|e| e.constant_value())
                .is_some();
        if !on_leading_or_const {
            return false;
        }
        if self.scans.len() != 1 {
            return false;
        }
        let scan = &self.scans[0];
        if scan.filters.len() != 1 {
            return false;
        }
        let filter = &scan.filters[0];
        if filter.composite_filters.len() != 1 {
            return false;
        }
        let cef = &filter.composite_filters[0];
        let low_is_null = cef
            .low
            .bytes()
            .map(codec::is_encoded_null)
            .unwrap_or(false);
        low_is_null
            && cef.high == IndexKey::Max
            && matches!(cef.inclusion, Inclusion::Low | Inclusion::Neither)
    }

    /// A WHERE clause whose equality covers are matched exactly by the scan's
    /// equality filters makes the count equal to the index item count.
    fn can_use_fast_count_where(&self, aggr: &Aggregate, wire_scans: &[WireScan]) -> bool {
        let on_leading_or_const = aggr.key_pos == 0
            || aggr
                .expr
                .as_ref()
                .and_then(|e| e.constant_value())
                .is_some();
        if !on_leading_or_const {
            return false;
        }
        let Some(where_clause) = &self.defn.where_clause else {
            return false;
        };
        let Some(scan) = wire_scans.first() else {
            return false;
        };
        for (i, fl) in scan.filters.iter().enumerate() {
            let (Some(low), Some(high)) = (&fl.low, &fl.high) else {
                return false;
            };
            if low != high || fl.inclusion != Inclusion::Both {
                return false;
            }
            let Some(field) = self.defn.sec_exprs.get(i) else {
                return false;
            };
            match where_clause.covers.get(field) {
                Some(cover) if cover == low => {}
                _ => return false,
            }
        }
        !scan.filters.is_empty()
    }

    // ── Equality-filter probes over the planned scans ──────────────────────

    pub(crate) fn has_all_equal_filters_upto(&self, key_pos: usize) -> bool {
        (0..=key_pos).all(|i| self.has_all_equal_filters(i))
    }

    /// True when every emitted filter pins `key_pos` to a single value with
    /// inclusive bounds, and at least one such filter exists.
    pub(crate) fn has_all_equal_filters(&self, key_pos: usize) -> bool {
        let mut found = false;
        for scan in &self.scans {
            for filter in &scan.filters {
                let Some(cef) = filter.composite_filters.get(key_pos) else {
                    return false;
                };
                let (Some(low), Some(high)) = (cef.low.bytes(), cef.high.bytes()) else {
                    return false;
                };
                if low != high || cef.inclusion != Inclusion::Both {
                    return false;
                }
                found = true;
            }
        }
        found
    }
}
