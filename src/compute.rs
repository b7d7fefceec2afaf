//! Curve computation for one source block and one site tile
//!
//! [`compute_curves`] is the unit of work shipped to workers. It is pure: it
//! reads its task and parameters and returns a [`PartialResult`], so a failed
//! attempt can be re-executed verbatim.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bbox::BoundingBox;
use crate::curves::HazardCurves;
use crate::error::{HazardError, Result};
use crate::gsim::GsimRef;
use crate::site::{FilteredSites, Tile};
use crate::source::{IndexedSource, RuptureSiteFilter, SourceSiteFilter};
use crate::types::{CurveKey, Imtls, SourceIdx, SourceModelId, TrtModelId};

/// Calculation-wide parameters shared by every task
#[derive(Debug, Clone)]
pub struct TaskParams {
    /// Integration distance (km)
    pub max_distance: f64,
    /// GSIM truncation level in standard deviations
    pub truncation_level: Option<f64>,
    /// IMTs and levels
    pub imtls: Arc<Imtls>,
    /// Whether to collect rupture envelopes (disaggregation mode)
    pub collect_bounding_boxes: bool,
}

/// One unit of work: a block of sources of one TRT model against one tile
#[derive(Debug, Clone)]
pub struct CurveTask {
    /// Ordinal in submission order
    pub task_no: usize,
    /// TRT model shared by every source of the block
    pub trt_model_id: TrtModelId,
    /// Source model owning the TRT model
    pub sm_id: SourceModelId,
    /// Sources of the block
    pub sources: Vec<IndexedSource>,
    /// Sites of the task
    pub tile: Tile,
    /// GSIMs associated to the TRT model
    pub gsims: Vec<GsimRef>,
}

impl CurveTask {
    /// Total weight of the sources
    pub fn weight(&self) -> f64 {
        self.sources.iter().map(|s| s.source.weight()).sum()
    }

    /// Check that every source shares the task's TRT model
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(HazardError::config(format!(
                "task #{} has no sources",
                self.task_no
            )));
        }
        for src in &self.sources {
            let trt = src.source.trt_model_id();
            if trt != self.trt_model_id {
                return Err(HazardError::config(format!(
                    "source {} has trt_model_id={}, expected {} in task #{}",
                    src.source.source_id(),
                    trt,
                    self.trt_model_id,
                    self.task_no
                )));
            }
        }
        Ok(())
    }
}

/// Output of one task
#[derive(Debug, Clone)]
pub struct PartialResult {
    /// Task ordinal
    pub task_no: usize,
    /// One curve set per GSIM of the TRT model, sized to the task's tile
    pub curves: HashMap<CurveKey, HazardCurves>,
    /// Ordinals of the tile in the complete site collection
    pub site_slice: Range<usize>,
    /// Elapsed time per source (fragments report their parent's index)
    pub calc_times: Vec<(SourceIdx, Duration)>,
    /// Rupture envelopes, one per site reached (empty unless requested)
    pub bounding_boxes: Vec<BoundingBox>,
}

/// Compute the hazard curves of a task.
///
/// Curves are the complement of the product, over every rupture reaching a
/// site, of the rupture's probability of no exceedance. The result is
/// independent of the order in which sources and ruptures are visited.
pub fn compute_curves(task: &CurveTask, params: &TaskParams) -> Result<PartialResult> {
    task.validate()?;

    let sites = task.tile.sites.as_ref();
    let n_sites = sites.len();
    let width = params.imtls.num_levels();
    let source_filter = SourceSiteFilter::new(params.max_distance);
    let rupture_filter = RuptureSiteFilter::new(params.max_distance);

    let mut pnes: Vec<Vec<f64>> = task
        .gsims
        .iter()
        .map(|_| vec![1.0; n_sites * width])
        .collect();
    let mut calc_times = Vec::with_capacity(task.sources.len());
    let mut boxes: BTreeMap<usize, BoundingBox> = BTreeMap::new();

    for src in &task.sources {
        let started = Instant::now();
        let Some(candidates) = source_filter.filter(src.source.as_ref(), sites) else {
            calc_times.push((src.idx, started.elapsed()));
            continue;
        };

        for rupture in src.source.ruptures() {
            let reached = rupture_filter.filter(&rupture, &candidates);
            if reached.is_empty() {
                continue;
            }

            if params.collect_bounding_boxes {
                for &(sidx, dist) in &reached {
                    if let Some(site) = sites.get(sidx) {
                        let closest = rupture.surface.closest_point(&site.location);
                        boxes
                            .entry(sidx)
                            .or_insert_with(|| BoundingBox::new(task.sm_id, site.id))
                            .update(&[dist], &[closest.lon], &[closest.lat])?;
                    }
                }
            }

            let reached_sites = FilteredSites::new(sites, reached.iter().map(|&(i, _)| i).collect());
            for (gsim, gsim_pnes) in task.gsims.iter().zip(pnes.iter_mut()) {
                for (sidx, site) in reached_sites.iter() {
                    let row = &mut gsim_pnes[sidx * width..(sidx + 1) * width];
                    for (imt, levels, range) in params.imtls.iter() {
                        let poes = gsim.poes(&rupture, site, imt, levels, params.truncation_level);
                        if poes.len() != levels.len() {
                            return Err(HazardError::shape(format!(
                                "{} returned {} poes for {} levels of {} (source {})",
                                gsim.id(),
                                poes.len(),
                                levels.len(),
                                imt,
                                src.source.source_id()
                            )));
                        }
                        let pne = rupture.probability_no_exceedance(&poes);
                        for (cell, p) in row[range].iter_mut().zip(pne) {
                            *cell *= p;
                        }
                    }
                }
            }
        }
        calc_times.push((src.idx, started.elapsed()));
    }

    let curves = task
        .gsims
        .iter()
        .zip(pnes)
        .map(|(gsim, gsim_pnes)| {
            (
                CurveKey::new(task.trt_model_id, gsim.id().clone()),
                HazardCurves::from_pnes(n_sites, Arc::clone(&params.imtls), gsim_pnes),
            )
        })
        .collect();

    Ok(PartialResult {
        task_no: task.task_no,
        curves,
        site_slice: task.tile.site_slice(),
        calc_times,
        bounding_boxes: boxes.into_values().collect(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic ground-motion model for tests and benchmarks

    use super::*;
    use crate::gsim::GroundMotionModel;
    use crate::site::Site;
    use crate::source::Rupture;
    use crate::types::{GsimId, Imt};

    /// POE decaying with distance and level, scaled by `scale`
    #[derive(Debug)]
    pub struct DecayGsim {
        pub id: GsimId,
        pub scale: f64,
    }

    impl DecayGsim {
        pub fn new(name: &str, scale: f64) -> GsimRef {
            Arc::new(Self {
                id: GsimId::new(name),
                scale,
            })
        }
    }

    impl GroundMotionModel for DecayGsim {
        fn id(&self) -> &GsimId {
            &self.id
        }

        fn poes(
            &self,
            rupture: &Rupture,
            site: &Site,
            _imt: &Imt,
            levels: &[f64],
            _truncation_level: Option<f64>,
        ) -> Vec<f64> {
            let dist = rupture.surface.distance_to(&site.location);
            levels
                .iter()
                .map(|l| (self.scale * rupture.mag / 10.0 * (-dist / 100.0).exp() * (-l * 5.0).exp()).min(1.0))
                .collect()
        }
    }
}
