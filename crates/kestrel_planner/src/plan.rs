//! Composite-filter composition into ordered, non-overlapping scans.
//!
//! Each wire scan becomes a `Filter` whose overall `(low, high)` endpoints
//! are the collation-aware join of its per-position ranges (descending
//! positions swap and complement before joining). Both endpoints of every
//! filter are then projected onto a sorted list of index points; a sweep over
//! the points tracking the set of active filters emits one output scan per
//! maximal contiguous active span, merging adjacent spans that touch on a
//! shared endpoint.

use std::cmp::Ordering;

use kestrel_common::error::ScanError;
use kestrel_common::KestrelResult;

use crate::codec;
use crate::key::{flip_inclusion, IndexKey, Inclusion};
use crate::request::{ScanRequest, WireFilter, WireScan};

/// Storage-level scan shapes, ordered from least to most filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanFilterType {
    /// Whole-index scan.
    All,
    /// Exact composite key lookup.
    Lookup,
    /// Range with no per-position filtering.
    #[default]
    Range,
    /// Range that still needs composite-element filtering.
    FilterRange,
}

/// Range over a single position of the composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeElementFilter {
    pub low: IndexKey,
    pub high: IndexKey,
    pub inclusion: Inclusion,
}

/// A wire scan lowered onto the whole-key byte order.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub composite_filters: Vec<CompositeElementFilter>,
    pub low: IndexKey,
    pub high: IndexKey,
    pub inclusion: Inclusion,
    pub scan_type: ScanFilterType,
}

/// One emitted storage scan.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    pub low: IndexKey,
    pub high: IndexKey,
    pub incl: Inclusion,
    pub scan_type: ScanFilterType,
    pub filters: Vec<Filter>,
    pub equals: Option<IndexKey>,
}

impl Scan {
    pub fn scan_all() -> Scan {
        Scan {
            scan_type: ScanFilterType::All,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointKind {
    Low,
    High,
}

/// A filter endpoint projected onto the whole-key order.
#[derive(Debug, Clone)]
struct IndexPoint {
    value: IndexKey,
    filter_id: usize,
    kind: PointKind,
}

fn key_len(k: &IndexKey) -> usize {
    k.bytes().map(|b| b.len()).unwrap_or(0)
}

/// Point order: whole-key prefix order; ties between a shorter and a longer
/// key resolve so that an enclosing span opens before and closes after the
/// keys it contains; equal-length ties open lows before highs.
fn index_point_less_than(x: &IndexPoint, y: &IndexPoint) -> bool {
    match (&x.value, &y.value) {
        (IndexKey::Min, _) => return true,
        (IndexKey::Max, _) => return false,
        (_, IndexKey::Min) => return false,
        (_, IndexKey::Max) => return true,
        _ => {}
    }
    match x.value.cmp_prefix(&y.value) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => {
            if key_len(&x.value) == key_len(&y.value) {
                return x.kind == PointKind::Low && y.kind == PointKind::High;
            }
            let x_shorter = key_len(&x.value) < key_len(&y.value);
            let shorter_kind = if x_shorter { x.kind } else { y.kind };
            match shorter_kind {
                PointKind::Low => x_shorter,
                PointKind::High => !x_shorter,
            }
        }
    }
}

/// Filter order for the primary path: by low endpoint.
fn filter_less_than(x: &Filter, y: &Filter) -> bool {
    match (&x.low, &y.low) {
        (IndexKey::Min, _) => true,
        (IndexKey::Max, _) => false,
        (_, IndexKey::Min) => false,
        (_, IndexKey::Max) => true,
        _ => x.low.cmp_prefix(&y.low) == Ordering::Less,
    }
}

impl ScanRequest {
    /// Translate the wire scans into the canonical `scans` list.
    pub(crate) fn fill_scans(&mut self, wire_scans: &[WireScan]) -> KestrelResult<()> {
        // Requests predating composite scans carry a single span.
        if wire_scans.is_empty() {
            let mut scan = Scan::default();
            if let Some(first) = self.keys.first() {
                scan.equals = Some(first.clone());
                scan.scan_type = ScanFilterType::Lookup;
            } else {
                scan.low = self.low.clone();
                scan.high = self.high.clone();
                scan.incl = self.incl;
                scan.scan_type = ScanFilterType::Range;
            }
            self.scans = vec![scan];
            return Ok(());
        }

        if self.is_primary {
            self.fill_scans_primary(wire_scans)
        } else {
            self.fill_scans_secondary(wire_scans)
        }
    }

    fn fill_scans_primary(&mut self, wire_scans: &[WireScan]) -> KestrelResult<()> {
        let mut scans: Vec<Scan> = Vec::new();
        let mut filters: Vec<Filter> = Vec::new();

        for ws in wire_scans {
            if let Some(eq) = ws.equals.first() {
                let key = self.new_key(eq)?;
                filters.push(Filter {
                    composite_filters: Vec::new(),
                    low: key.clone(),
                    high: key,
                    inclusion: Inclusion::Both,
                    scan_type: ScanFilterType::Range,
                });
                continue;
            }

            if ws.filters.is_empty() || are_filters_nil(self, ws) {
                self.scans = vec![Scan::scan_all()];
                return Ok(());
            }

            let fl = &ws.filters[0];
            let l = self.new_low_key(&fl.low)?;
            let h = self.new_high_key(&fl.high)?;

            if h.less_than(&l) {
                scans.push(empty_scan());
                continue;
            }
            // With equal endpoints, only a fully inclusive range selects
            // anything.
            if l.cmp_full(&h) == Ordering::Equal && fl.inclusion != Inclusion::Both {
                scans.push(empty_scan());
                continue;
            }

            filters.push(Filter {
                composite_filters: vec![CompositeElementFilter {
                    low: l.clone(),
                    high: h.clone(),
                    inclusion: fl.inclusion,
                }],
                low: l,
                high: h,
                inclusion: fl.inclusion,
                scan_type: ScanFilterType::Range,
            });
        }

        filters.sort_by(|a, b| {
            if filter_less_than(a, b) {
                Ordering::Less
            } else if filter_less_than(b, a) {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        });
        for filter in filters {
            scans = merge_filters_for_primary(scans, filter);
        }
        self.scans = scans;
        Ok(())
    }

    fn fill_scans_secondary(&mut self, wire_scans: &[WireScan]) -> KestrelResult<()> {
        let mut filters: Vec<Filter> = Vec::new();
        let mut points: Vec<IndexPoint> = Vec::new();

        for ws in wire_scans {
            if !ws.equals.is_empty() {
                let filter = self.fill_filter_equals(ws)?;
                push_filter_points(&mut points, &mut filters, filter);
                continue;
            }

            if ws.filters.is_empty() || are_filters_nil(self, ws) {
                self.scans = vec![Scan::scan_all()];
                return Ok(());
            }

            let mut comp_filters = Vec::with_capacity(ws.filters.len());
            let mut skip_scan = false;
            for fl in &ws.filters {
                let l = self.new_low_key(&fl.low)?;
                let h = self.new_high_key(&fl.high)?;
                if h.less_than(&l) {
                    skip_scan = true;
                    break;
                }
                comp_filters.push(CompositeElementFilter {
                    low: l,
                    high: h,
                    inclusion: fl.inclusion,
                });
            }
            if skip_scan {
                continue;
            }

            let mut filter = Filter {
                composite_filters: comp_filters,
                low: IndexKey::Min,
                high: IndexKey::Max,
                inclusion: Inclusion::Both,
                scan_type: ScanFilterType::FilterRange,
            };
            self.fill_filter_low_high(&mut filter)?;
            push_filter_points(&mut points, &mut filters, filter);
        }

        points.sort_by(|a, b| {
            if index_point_less_than(a, b) {
                Ordering::Less
            } else if index_point_less_than(b, a) {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        });
        self.scans = self.compose_scans(&points, &filters);
        Ok(())
    }

    /// Overall `(low, high)` of a filter from its per-position ranges.
    fn fill_filter_low_high(&self, filter: &mut Filter) -> KestrelResult<()> {
        let comp = &filter.composite_filters;
        if !self.defn.has_descending() {
            let mut join_low = true;
            let mut join_high = true;
            if comp[0].low == IndexKey::Min {
                filter.low = IndexKey::Min;
                join_low = false;
            }
            if comp[0].high == IndexKey::Max {
                filter.high = IndexKey::Max;
                join_high = false;
            }

            if join_low {
                let mut lows: Vec<&[u8]> = Vec::new();
                for f in comp {
                    match f.low.bytes() {
                        Some(b) => lows.push(b),
                        None => break,
                    }
                }
                filter.low = IndexKey::Key(codec::join_array(&lows));
            }
            if join_high {
                let mut highs: Vec<&[u8]> = Vec::new();
                for f in comp {
                    match f.high.bytes() {
                        Some(b) => highs.push(b),
                        None => break,
                    }
                }
                filter.high = IndexKey::Key(codec::join_array(&highs));
            }
            return Ok(());
        }

        // Descending positions exchange their endpoints before joining.
        let mut lows2: Vec<IndexKey> = Vec::new();
        let mut highs2: Vec<IndexKey> = Vec::new();
        for (i, f) in comp.iter().enumerate() {
            if self.defn.is_desc(i) {
                lows2.push(f.high.clone());
                highs2.push(f.low.clone());
            } else {
                lows2.push(f.low.clone());
                highs2.push(f.high.clone());
            }
        }

        // Joining stops at the first unbounded position.
        if let Some(i) = lows2.iter().position(|k| !k.is_bounded()) {
            lows2.truncate(i);
        }
        if let Some(i) = highs2.iter().position(|k| !k.is_bounded()) {
            highs2.truncate(i);
        }

        filter.low = if lows2.is_empty() {
            IndexKey::Min
        } else {
            let parts: Vec<&[u8]> = lows2.iter().filter_map(|k| k.bytes()).collect();
            let joined = codec::join_array(&parts);
            IndexKey::Key(codec::reverse_collate(&joined, &self.defn.desc[..lows2.len().min(self.defn.desc.len())])?)
        };
        filter.high = if highs2.is_empty() {
            IndexKey::Max
        } else {
            let parts: Vec<&[u8]> = highs2.iter().filter_map(|k| k.bytes()).collect();
            let joined = codec::join_array(&parts);
            IndexKey::Key(codec::reverse_collate(&joined, &self.defn.desc[..highs2.len().min(self.defn.desc.len())])?)
        };
        Ok(())
    }

    /// Lower an equality prefix into a lookup filter.
    fn fill_filter_equals(&self, ws: &WireScan) -> KestrelResult<Filter> {
        let mut elements: Vec<&[u8]> = Vec::with_capacity(ws.equals.len());
        for k in &ws.equals {
            if k.is_empty() {
                return Err(ScanError::InvalidRequest("empty equals key".into()).into());
            }
            elements.push(k);
        }
        let joined = codec::join_array(&elements);
        let eq_key = if self.defn.has_descending() {
            codec::reverse_collate(&joined, &self.defn.desc[..elements.len().min(self.defn.desc.len())])?
        } else {
            joined
        };

        let comp_filters = ws
            .equals
            .iter()
            .map(|k| CompositeElementFilter {
                low: IndexKey::Key(k.clone()),
                high: IndexKey::Key(k.clone()),
                inclusion: Inclusion::Both,
            })
            .collect();

        Ok(Filter {
            composite_filters: comp_filters,
            low: IndexKey::Key(eq_key.clone()),
            high: IndexKey::Key(eq_key),
            inclusion: Inclusion::Both,
            scan_type: ScanFilterType::Lookup,
        })
    }

    /// Sweep sorted points and emit one scan per maximal active span.
    fn compose_scans(&self, points: &[IndexPoint], filters: &[Filter]) -> Vec<Scan> {
        let mut scans: Vec<Scan> = Vec::new();
        let mut active: Vec<usize> = Vec::new();
        let mut span_filters: Vec<usize> = Vec::new();
        let mut low = IndexKey::Min;

        for p in points {
            if active.is_empty() {
                low = p.value.clone();
            }
            if let Some(pos) = active.iter().position(|id| *id == p.filter_id) {
                active.remove(pos);
                if active.is_empty() {
                    // End of an overlapping region. Touching spans merge
                    // instead of emitting a new scan.
                    let merged = match scans.last_mut() {
                        Some(last) if last.high.cmp_prefix(&low) == Ordering::Equal => {
                            for id in &span_filters {
                                last.filters.push(filters[*id].clone());
                            }
                            last.high = p.value.clone();
                            true
                        }
                        _ => false,
                    };
                    if !merged {
                        let mut scan = Scan {
                            low: low.clone(),
                            high: p.value.clone(),
                            incl: Inclusion::Both,
                            scan_type: ScanFilterType::FilterRange,
                            filters: Vec::new(),
                            equals: None,
                        };
                        for id in &span_filters {
                            scan.filters.push(filters[*id].clone());
                        }
                        scans.push(scan);
                    }
                    span_filters.clear();
                }
            } else {
                active.push(p.filter_id);
                span_filters.push(p.filter_id);
            }
        }

        for scan in &mut scans {
            if scan.filters.len() == 1 && scan.filters[0].scan_type == ScanFilterType::Lookup {
                scan.equals = Some(scan.low.clone());
                scan.scan_type = ScanFilterType::Lookup;
            }
            if scan.scan_type == ScanFilterType::FilterRange
                && scan.filters.len() == 1
                && scan.filters[0].composite_filters.len() == 1
            {
                // A single-position filter needs no composite filtering.
                scan.incl =
                    flip_inclusion(scan.filters[0].composite_filters[0].inclusion, &self.defn.desc);
                scan.scan_type = ScanFilterType::Range;
            }
        }
        scans
    }

    /// Mark the key positions that must be exploded or decoded by execution.
    pub(crate) fn set_explode_positions(&mut self) {
        if self.is_primary {
            return;
        }

        let mut max_composite_filters = 0;
        for sc in &self.scans {
            if sc.scan_type != ScanFilterType::FilterRange {
                continue;
            }
            for fl in &sc.filters {
                max_composite_filters = max_composite_filters.max(fl.composite_filters.len());
            }
        }

        for i in 0..max_composite_filters.min(self.explode_positions.len()) {
            self.explode_positions[i] = true;
        }

        if let Some(proj) = &self.projection {
            if proj.project_sec_keys {
                for (i, project) in proj.projection_keys.iter().enumerate() {
                    if *project {
                        self.explode_positions[i] = true;
                    }
                }
            }
        }

        for i in 0..self.explode_positions.len() {
            if self.explode_positions[i] || self.decode_positions[i] {
                self.explode_upto = i as i32;
            }
        }
    }
}

fn are_filters_nil(r: &ScanRequest, ws: &WireScan) -> bool {
    ws.filters
        .iter()
        .all(|f: &WireFilter| r.is_nil_key(&f.low) && r.is_nil_key(&f.high))
}

fn empty_scan() -> Scan {
    let key = IndexKey::Key(Vec::new());
    Scan {
        low: key.clone(),
        high: key,
        incl: Inclusion::Neither,
        scan_type: ScanFilterType::Range,
        filters: Vec::new(),
        equals: None,
    }
}

fn push_filter_points(points: &mut Vec<IndexPoint>, filters: &mut Vec<Filter>, filter: Filter) {
    filters.push(filter);
    let id = filters.len() - 1;
    let f = &filters[id];
    points.push(IndexPoint {
        value: f.low.clone(),
        filter_id: id,
        kind: PointKind::Low,
    });
    points.push(IndexPoint {
        value: f.high.clone(),
        filter_id: id,
        kind: PointKind::High,
    });
}

/// Merge a primary-key filter into the ordered scan list, unioning the
/// inclusion at shared endpoints.
pub(crate) fn merge_filters_for_primary(mut scans: Vec<Scan>, f2: Filter) -> Vec<Scan> {
    let push_new = |scans: &mut Vec<Scan>, f: &Filter| {
        scans.push(Scan {
            low: f.low.clone(),
            high: f.high.clone(),
            incl: f.inclusion,
            scan_type: ScanFilterType::Range,
            filters: Vec::new(),
            equals: None,
        });
    };

    let Some(f1) = scans.last() else {
        push_new(&mut scans, &f2);
        return scans;
    };
    let (l1, h1, i1) = (f1.low.clone(), f1.high.clone(), f1.incl);
    let (l2, h2, i2) = (f2.low.clone(), f2.high.clone(), f2.inclusion);

    // Disjoint: start a new scan.
    if l2.cmp_prefix(&h1) == Ordering::Greater {
        push_new(&mut scans, &f2);
        return scans;
    }
    // Touching at a single excluded point: still disjoint.
    if h1.cmp_prefix(&l2) == Ordering::Equal && !(i1.includes_high() || i2.includes_low()) {
        push_new(&mut scans, &f2);
        return scans;
    }

    let mut low = None;
    let mut high = None;
    let mut incl_low = false;
    let mut incl_high = false;
    if l1.cmp_prefix(&l2) == Ordering::Equal {
        low = Some(l1.clone());
        incl_low = i1.includes_low() || i2.includes_low();
    }
    if h1.cmp_prefix(&h2) == Ordering::Equal {
        high = Some(h1.clone());
        incl_high = i1.includes_high() || i2.includes_high();
    }
    let low = low.unwrap_or_else(|| {
        if l1.cmp_prefix(&l2) == Ordering::Less {
            incl_low = i1.includes_low();
            l1.clone()
        } else {
            incl_low = i2.includes_low();
            l2.clone()
        }
    });
    let high = high.unwrap_or_else(|| {
        if h1.cmp_prefix(&h2) == Ordering::Greater {
            incl_high = i1.includes_high();
            h1.clone()
        } else {
            incl_high = i2.includes_high();
            h2.clone()
        }
    });

    let last = scans.last_mut().expect("merge target exists");
    last.low = low;
    last.high = high;
    last.incl = Inclusion::from_bounds(incl_low, incl_high);
    scans
}
