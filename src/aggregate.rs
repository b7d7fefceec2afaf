//! Reduction of partial task results
//!
//! ## Table of Contents
//! - **Accumulator**: Curves per `(trt_model_id, gsim)`, telemetry and rupture envelopes
//! - **CurveReducer**: Folds one [`PartialResult`] into the accumulator
//!
//! The fold composes curves with the probability-of-no-exceedance rule, which
//! is associative and commutative, so task completion order has no effect on
//! the final curves.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::bbox::BoundingBox;
use crate::compute::PartialResult;
use crate::curves::HazardCurves;
use crate::error::Result;
use crate::types::{CurveKey, Imtls, SiteId, SourceIdx, SourceModelId, TrtModelId};

/// The reduction target, exclusively owned by the controller
#[derive(Debug, Clone)]
pub struct Accumulator {
    /// Full-site curves per `(trt_model_id, gsim)`
    pub curves: HashMap<CurveKey, HazardCurves>,
    /// Elapsed time per source, in fold order
    pub calc_times: Vec<(SourceIdx, Duration)>,
    /// Rupture envelopes per `(source model, site)`
    pub bounding_boxes: HashMap<(SourceModelId, SiteId), BoundingBox>,
}

impl Accumulator {
    /// All-zero curves for every key, with no telemetry and empty boxes for
    /// the given `(source model, site)` pairs
    pub fn zeros(
        keys: impl IntoIterator<Item = CurveKey>,
        n_sites: usize,
        imtls: Arc<Imtls>,
        bb_pairs: &[(SourceModelId, SiteId)],
    ) -> Self {
        let curves = keys
            .into_iter()
            .map(|key| (key, HazardCurves::zeros(n_sites, Arc::clone(&imtls))))
            .collect();
        let bounding_boxes = bb_pairs
            .iter()
            .map(|&(sm_id, site_id)| ((sm_id, site_id), BoundingBox::new(sm_id, site_id)))
            .collect();
        Self {
            curves,
            calc_times: Vec::new(),
            bounding_boxes,
        }
    }

    /// An accumulator with no keys
    pub fn empty() -> Self {
        Self {
            curves: HashMap::new(),
            calc_times: Vec::new(),
            bounding_boxes: HashMap::new(),
        }
    }

    /// Merge another full-site accumulator into this one.
    ///
    /// Any merge tree over the same partials gives the same curves as a
    /// sequential fold.
    pub fn merge(&mut self, other: Accumulator) -> Result<()> {
        self.calc_times.extend(other.calc_times);
        for (key, bb) in other.bounding_boxes {
            match self.bounding_boxes.get_mut(&key) {
                Some(existing) => existing.update_bb(&bb)?,
                None => {
                    self.bounding_boxes.insert(key, bb);
                }
            }
        }
        for (key, curves) in other.curves {
            match self.curves.get_mut(&key) {
                Some(existing) => existing.combine(&curves)?,
                None => {
                    self.curves.insert(key, curves);
                }
            }
        }
        Ok(())
    }

    /// Whether any curve of the TRT model has a nonzero value
    pub fn is_effective_trt_model(&self, trt_model_id: TrtModelId) -> bool {
        self.curves
            .iter()
            .filter(|(key, _)| key.trt_model_id == trt_model_id)
            .any(|(_, curves)| curves.total() > 0.0)
    }

    /// Curve for a key, if registered
    pub fn get(&self, key: &CurveKey) -> Option<&HazardCurves> {
        self.curves.get(key)
    }

    /// Keys in sorted order
    pub fn sorted_keys(&self) -> Vec<&CurveKey> {
        let mut keys: Vec<_> = self.curves.keys().collect();
        keys.sort();
        keys
    }

    /// Total elapsed time per source index
    pub fn calc_times_by_source(&self) -> BTreeMap<SourceIdx, Duration> {
        let mut totals = BTreeMap::new();
        for &(idx, elapsed) in &self.calc_times {
            *totals.entry(idx).or_insert(Duration::ZERO) += elapsed;
        }
        totals
    }

    /// Number of sources each original source was computed as
    pub fn fragments_by_source(&self) -> BTreeMap<SourceIdx, usize> {
        let mut counts = BTreeMap::new();
        for &(idx, _) in &self.calc_times {
            *counts.entry(idx).or_insert(0) += 1;
        }
        counts
    }
}

/// Folds partial results into an [`Accumulator`]
#[derive(Debug, Clone, Copy)]
pub struct CurveReducer {
    n_sites: usize,
    sites_per_tile: usize,
}

impl CurveReducer {
    /// Create a reducer for a complete collection of `n_sites` sites
    pub fn new(n_sites: usize, sites_per_tile: usize) -> Self {
        Self {
            n_sites,
            sites_per_tile,
        }
    }

    /// True when partial results cover only a tile of the sites
    pub fn is_tiling(&self) -> bool {
        self.n_sites > self.sites_per_tile
    }

    /// Fold one partial result into the accumulator.
    ///
    /// Partial curves are expanded to the complete site collection when
    /// tiling is active; a partial larger than the collection, or a slice not
    /// matching its size, is a shape error.
    pub fn reduce(&self, acc: &mut Accumulator, partial: PartialResult) -> Result<()> {
        acc.calc_times.extend(partial.calc_times);

        for bb in partial.bounding_boxes {
            acc.bounding_boxes
                .entry((bb.sm_id, bb.site_id))
                .or_insert_with(|| BoundingBox::new(bb.sm_id, bb.site_id))
                .update_bb(&bb)?;
        }

        for (key, curves) in partial.curves {
            let full = if self.is_tiling() {
                curves.expand(self.n_sites, partial.site_slice.clone())?
            } else {
                curves
            };
            match acc.curves.get_mut(&key) {
                Some(existing) => existing.combine(&full)?,
                None => {
                    acc.curves.insert(key, full);
                }
            }
        }

        debug!(task_no = partial.task_no, "Folded partial result");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HazardError;
    use crate::types::GsimId;

    fn imtls() -> Arc<Imtls> {
        Arc::new(Imtls::new().with("PGA", vec![0.1, 0.2]))
    }

    fn key(gsim: &str) -> CurveKey {
        CurveKey::new(TrtModelId::new(0), GsimId::new(gsim))
    }

    fn partial(task_no: usize, slice: std::ops::Range<usize>, data: Vec<f64>) -> PartialResult {
        let n = slice.end - slice.start;
        partial_of(task_no, n, slice, data)
    }

    /// A partial result of `n` sites tagged with an arbitrary slice
    fn partial_of(
        task_no: usize,
        n: usize,
        slice: std::ops::Range<usize>,
        data: Vec<f64>,
    ) -> PartialResult {
        let mut curves = HashMap::new();
        curves.insert(key("A"), HazardCurves::from_data(n, imtls(), data).unwrap());
        PartialResult {
            task_no,
            curves,
            site_slice: slice,
            calc_times: vec![(SourceIdx::new(task_no), Duration::from_millis(5))],
            bounding_boxes: Vec::new(),
        }
    }

    #[test]
    fn test_fold_order_does_not_matter() {
        let reducer = CurveReducer::new(2, 10);
        let partials = vec![
            partial(0, 0..2, vec![0.1, 0.05, 0.2, 0.0]),
            partial(1, 0..2, vec![0.3, 0.01, 0.0, 0.4]),
            partial(2, 0..2, vec![0.02, 0.5, 0.7, 0.1]),
        ];

        let mut forward = Accumulator::zeros([key("A")], 2, imtls(), &[]);
        for p in partials.iter().cloned() {
            reducer.reduce(&mut forward, p).unwrap();
        }
        let mut backward = Accumulator::zeros([key("A")], 2, imtls(), &[]);
        for p in partials.iter().rev().cloned() {
            reducer.reduce(&mut backward, p).unwrap();
        }
        assert!(forward.curves[&key("A")].max_abs_diff(&backward.curves[&key("A")]) < 1e-15);
        assert_eq!(forward.calc_times.len(), 3);
    }

    #[test]
    fn test_merge_tree_matches_sequential_fold() {
        let reducer = CurveReducer::new(2, 10);
        let p = [
            partial(0, 0..2, vec![0.1, 0.05, 0.2, 0.0]),
            partial(1, 0..2, vec![0.3, 0.01, 0.0, 0.4]),
        ];
        let mut seq = Accumulator::zeros([key("A")], 2, imtls(), &[]);
        reducer.reduce(&mut seq, p[0].clone()).unwrap();
        reducer.reduce(&mut seq, p[1].clone()).unwrap();

        let mut left = Accumulator::zeros([key("A")], 2, imtls(), &[]);
        reducer.reduce(&mut left, p[0].clone()).unwrap();
        let mut right = Accumulator::empty();
        reducer.reduce(&mut right, p[1].clone()).unwrap();
        left.merge(right).unwrap();

        assert!(seq.curves[&key("A")].max_abs_diff(&left.curves[&key("A")]) < 1e-15);
    }

    #[test]
    fn test_tiles_expand_into_place() {
        let reducer = CurveReducer::new(3, 2);
        assert!(reducer.is_tiling());
        let mut acc = Accumulator::zeros([key("A")], 3, imtls(), &[]);
        reducer.reduce(&mut acc, partial(0, 0..2, vec![0.1, 0.2, 0.3, 0.4])).unwrap();
        reducer.reduce(&mut acc, partial(1, 2..3, vec![0.5, 0.6])).unwrap();
        assert_eq!(acc.curves[&key("A")].as_slice(), &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn test_bad_tile_slice_is_shape_error() {
        let reducer = CurveReducer::new(3, 2);
        let mut acc = Accumulator::zeros([key("A")], 3, imtls(), &[]);
        // one site of curves tagged with a two-site slice
        let err = reducer
            .reduce(&mut acc, partial_of(0, 1, 1..3, vec![0.5, 0.6]))
            .unwrap_err();
        assert!(matches!(err, HazardError::Shape(_)));
        assert!(err.to_string().contains("slice"));
        assert_eq!(acc.curves[&key("A")].as_slice(), &[0.0; 6]);
    }

    #[test]
    fn test_oversized_partial_is_shape_error() {
        let reducer = CurveReducer::new(3, 2);
        let mut acc = Accumulator::zeros([key("A")], 3, imtls(), &[]);
        let err = reducer
            .reduce(&mut acc, partial_of(0, 4, 0..4, vec![0.1; 8]))
            .unwrap_err();
        assert!(matches!(err, HazardError::Shape(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_bounding_boxes_are_merged() {
        let reducer = CurveReducer::new(1, 10);
        let sm = SourceModelId::new(0);
        let site = SiteId::new(0);
        let mut acc = Accumulator::zeros([key("A")], 1, imtls(), &[(sm, site)]);
        for (dist, lon) in [(30.0, 1.0), (10.0, 2.0)] {
            let mut bb = BoundingBox::new(sm, site);
            bb.update(&[dist], &[lon], &[0.0]).unwrap();
            let mut p = partial(0, 0..1, vec![0.0, 0.0]);
            p.bounding_boxes.push(bb);
            reducer.reduce(&mut acc, p).unwrap();
        }
        let bb = &acc.bounding_boxes[&(sm, site)];
        assert_eq!((bb.min_dist(), bb.max_dist()), (Some(10.0), Some(30.0)));
    }

    #[test]
    fn test_effective_trt_model() {
        let reducer = CurveReducer::new(2, 10);
        let other = CurveKey::new(TrtModelId::new(1), GsimId::new("A"));
        let mut acc = Accumulator::zeros([key("A"), other], 2, imtls(), &[]);
        reducer.reduce(&mut acc, partial(0, 0..2, vec![0.0, 0.0, 0.1, 0.0])).unwrap();
        assert!(acc.is_effective_trt_model(TrtModelId::new(0)));
        assert!(!acc.is_effective_trt_model(TrtModelId::new(1)));
        assert_eq!(acc.fragments_by_source()[&SourceIdx::new(0)], 1);
    }
}
