//! # Logic tree and realization association
//!
//! Table of Contents:
//! 1. GsimBranch / TrtModel / SourceModel: the branches of the tree
//! 2. LogicTree: enumeration and sampling of realizations
//! 3. Realization: one path through the tree
//! 4. RlzsAssoc: realization to `(trt_model_id, gsim)` association and curve composition

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::curves::HazardCurves;
use crate::error::{HazardError, Result};
use crate::gsim::GsimRef;
use crate::source::SourceRef;
use crate::types::{CurveKey, GsimId, Imtls, SourceModelId, TrtModelId};

// ─────────────────────────────────────────────
// 1. Branches
// ─────────────────────────────────────────────

/// A ground-motion model alternative for one tectonic region
#[derive(Debug, Clone)]
pub struct GsimBranch {
    /// Branch id used in realization paths
    pub branch_id: String,
    /// The model
    pub gsim: GsimRef,
    /// Branch weight
    pub weight: f64,
}

impl GsimBranch {
    /// Create a branch; the branch id defaults to the model id
    pub fn new(gsim: GsimRef, weight: f64) -> Self {
        Self {
            branch_id: gsim.id().to_string(),
            gsim,
            weight,
        }
    }

    /// Override the branch id
    pub fn with_branch_id(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = branch_id.into();
        self
    }
}

/// The sources of one tectonic region type inside one source model
#[derive(Debug, Clone)]
pub struct TrtModel {
    /// Id, unique across the whole composite model
    pub id: TrtModelId,
    /// Tectonic region type name
    pub trt: String,
    /// Sources
    pub sources: Vec<SourceRef>,
    /// Alternative GSIMs
    pub gsims: Vec<GsimBranch>,
}

impl TrtModel {
    /// Create an empty TRT model
    pub fn new(id: TrtModelId, trt: impl Into<String>) -> Self {
        Self {
            id,
            trt: trt.into(),
            sources: Vec::new(),
            gsims: Vec::new(),
        }
    }

    /// Add a source
    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a GSIM alternative
    pub fn with_gsim(mut self, gsim: GsimRef, weight: f64) -> Self {
        self.gsims.push(GsimBranch::new(gsim, weight));
        self
    }

    /// Total source weight
    pub fn weight(&self) -> f64 {
        self.sources.iter().map(|s| s.weight()).sum()
    }
}

/// A source-model branch of the logic tree
#[derive(Debug, Clone)]
pub struct SourceModel {
    /// Ordinal
    pub id: SourceModelId,
    /// Branch path, e.g. `["b1"]`
    pub path: Vec<String>,
    /// Branch weight
    pub weight: f64,
    /// TRT models of this branch
    pub trt_models: Vec<TrtModel>,
}

impl SourceModel {
    /// Create a source model without TRT models
    pub fn new(id: SourceModelId, path: impl Into<String>, weight: f64) -> Self {
        Self {
            id,
            path: vec![path.into()],
            weight,
            trt_models: Vec::new(),
        }
    }

    /// Add a TRT model
    pub fn with_trt_model(mut self, trt_model: TrtModel) -> Self {
        self.trt_models.push(trt_model);
        self
    }

    /// Path joined as used in output keys
    pub fn path_str(&self) -> String {
        self.path.join("_")
    }
}

// ─────────────────────────────────────────────
// 2. LogicTree
// ─────────────────────────────────────────────

/// The composite source model with its GSIM alternatives
#[derive(Debug, Clone, Default)]
pub struct LogicTree {
    source_models: Vec<SourceModel>,
}

impl LogicTree {
    /// Create a tree from its source models
    pub fn new(source_models: Vec<SourceModel>) -> Self {
        Self { source_models }
    }

    /// Source models in ordinal order
    pub fn source_models(&self) -> &[SourceModel] {
        &self.source_models
    }

    /// Every TRT model of every source model
    pub fn trt_models(&self) -> impl Iterator<Item = (&SourceModel, &TrtModel)> {
        self.source_models
            .iter()
            .flat_map(|sm| sm.trt_models.iter().map(move |tm| (sm, tm)))
    }

    /// Check weights and ids
    pub fn validate(&self) -> Result<()> {
        if self.source_models.is_empty() {
            return Err(HazardError::config("the logic tree has no source models"));
        }
        let mut seen = BTreeMap::new();
        for (sm, tm) in self.trt_models() {
            if let Some(other) = seen.insert(tm.id, sm.id) {
                return Err(HazardError::config(format!(
                    "trt_model_id={} appears in both {} and {}",
                    tm.id, other, sm.id
                )));
            }
            if tm.gsims.is_empty() {
                return Err(HazardError::config(format!(
                    "no GSIM for trt_model_id={} ({}) in {}",
                    tm.id, tm.trt, sm.id
                )));
            }
            let mut ids: Vec<&GsimId> = tm.gsims.iter().map(|b| b.gsim.id()).collect();
            ids.sort();
            if ids.windows(2).any(|w| w[0] == w[1]) {
                return Err(HazardError::config(format!(
                    "duplicated GSIM id for trt_model_id={} ({})",
                    tm.id, tm.trt
                )));
            }
            check_weights(
                tm.gsims.iter().map(|b| b.weight),
                &format!("GSIM branches of trt_model_id={}", tm.id),
            )?;
        }
        check_weights(self.source_models.iter().map(|sm| sm.weight), "source model branches")
    }

    /// Enumerate (`num_samples == 0`) or sample the realizations
    pub fn rlzs_assoc(&self, num_samples: usize, seed: u64) -> Result<RlzsAssoc> {
        self.rlzs_assoc_with(num_samples, seed, |_| true)
    }

    /// Like [`rlzs_assoc`](Self::rlzs_assoc), keeping only the TRT models
    /// for which `is_effective` holds.
    ///
    /// A source model left without TRT models keeps one realization with an
    /// all-zero curve, so the realization weights still add up.
    pub fn rlzs_assoc_with(
        &self,
        num_samples: usize,
        seed: u64,
        is_effective: impl Fn(TrtModelId) -> bool,
    ) -> Result<RlzsAssoc> {
        self.validate()?;
        let mut assoc = RlzsAssoc::default();
        for (sm, tm) in self.trt_models() {
            assoc.sm_by_trt.insert(tm.id, sm.id);
        }
        let realizations = if num_samples == 0 {
            self.enumerate(&is_effective)
        } else {
            assoc.sampled = true;
            self.sample(num_samples, seed, &is_effective)?
        };
        for rlz in &realizations {
            for (trt, branch) in &rlz.branches {
                let gsims = assoc.gsims_by_trt.entry(*trt).or_insert_with(Vec::new);
                if !gsims.iter().any(|g| g.id() == branch.gsim.id()) {
                    gsims.push(Arc::clone(&branch.gsim));
                }
            }
        }
        for gsims in assoc.gsims_by_trt.values_mut() {
            gsims.sort_by(|a, b| a.id().cmp(b.id()));
        }
        assoc.realizations = realizations
            .into_iter()
            .enumerate()
            .map(|(ordinal, rlz)| rlz.build(ordinal))
            .collect();
        info!(
            realizations = assoc.realizations.len(),
            sampled = assoc.sampled,
            "Built realization association"
        );
        Ok(assoc)
    }

    fn enumerate(&self, is_effective: &impl Fn(TrtModelId) -> bool) -> Vec<RlzBuilder> {
        let mut out = Vec::new();
        for sm in &self.source_models {
            let mut paths = vec![RlzBuilder::new(sm, sm.weight)];
            for tm in sm.trt_models.iter().filter(|tm| is_effective(tm.id)) {
                let mut next = Vec::with_capacity(paths.len() * tm.gsims.len());
                for path in &paths {
                    for branch in &tm.gsims {
                        let mut extended = path.clone();
                        extended.weight *= branch.weight;
                        extended.branches.insert(tm.id, branch.clone());
                        next.push(extended);
                    }
                }
                paths = next;
            }
            out.extend(paths);
        }
        out
    }

    fn sample(
        &self,
        num_samples: usize,
        seed: u64,
        is_effective: &impl Fn(TrtModelId) -> bool,
    ) -> Result<Vec<RlzBuilder>> {
        let sm_dist = weighted_index(self.source_models.iter().map(|sm| sm.weight))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = 1.0 / num_samples as f64;
        let mut out = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            let sm = &self.source_models[sm_dist.sample(&mut rng)];
            let mut rlz = RlzBuilder::new(sm, weight);
            // draw for every TRT model so the random stream does not depend on pruning
            for tm in &sm.trt_models {
                let dist = weighted_index(tm.gsims.iter().map(|b| b.weight))?;
                let branch = &tm.gsims[dist.sample(&mut rng)];
                if is_effective(tm.id) {
                    rlz.branches.insert(tm.id, branch.clone());
                }
            }
            out.push(rlz);
        }
        debug!(num_samples, seed, "Sampled logic tree paths");
        Ok(out)
    }
}

fn weighted_index(weights: impl Iterator<Item = f64>) -> Result<WeightedIndex<f64>> {
    let weights: Vec<f64> = weights.collect();
    WeightedIndex::new(&weights)
        .map_err(|e| HazardError::config(format!("invalid branch weights {:?}: {}", weights, e)))
}

fn check_weights(weights: impl Iterator<Item = f64>, what: &str) -> Result<()> {
    let weights: Vec<f64> = weights.collect();
    if weights.iter().any(|&w| !(w > 0.0 && w <= 1.0)) {
        return Err(HazardError::config(format!(
            "{} have invalid weights {:?}",
            what, weights
        )));
    }
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > 1e-9 {
        return Err(HazardError::config(format!(
            "{} have weights summing to {}, not 1",
            what, total
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct RlzBuilder {
    sm_id: SourceModelId,
    sm_path: String,
    weight: f64,
    branches: BTreeMap<TrtModelId, GsimBranch>,
}

impl RlzBuilder {
    fn new(sm: &SourceModel, weight: f64) -> Self {
        Self {
            sm_id: sm.id,
            sm_path: sm.path_str(),
            weight,
            branches: BTreeMap::new(),
        }
    }

    fn build(self, ordinal: usize) -> Realization {
        let gsim_path: Vec<&str> = self.branches.values().map(|b| b.branch_id.as_str()).collect();
        Realization {
            ordinal,
            uid: format!("{}~{}", self.sm_path, gsim_path.join("_")),
            sm_id: self.sm_id,
            weight: self.weight,
            gsim_by_trt: self
                .branches
                .into_iter()
                .map(|(trt, branch)| (trt, branch.gsim.id().clone()))
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────
// 3. Realization
// ─────────────────────────────────────────────

/// One path through the logic tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Realization {
    /// Position in the realization list
    pub ordinal: usize,
    /// Branch path, `<source model path>~<gsim branch ids>`
    pub uid: String,
    /// Source model of the path
    pub sm_id: SourceModelId,
    /// Product of the branch weights, or `1/n` when sampled
    pub weight: f64,
    /// GSIM selected for each TRT model the realization depends on
    pub gsim_by_trt: BTreeMap<TrtModelId, GsimId>,
}

impl Realization {
    /// The `(trt_model_id, gsim)` keys the realization is composed of
    pub fn curve_keys(&self) -> impl Iterator<Item = CurveKey> + '_ {
        self.gsim_by_trt
            .iter()
            .map(|(trt, gsim)| CurveKey::new(*trt, gsim.clone()))
    }
}

// ─────────────────────────────────────────────
// 4. RlzsAssoc
// ─────────────────────────────────────────────

/// Association between realizations and independent curve sets
#[derive(Debug, Clone, Default)]
pub struct RlzsAssoc {
    realizations: Vec<Realization>,
    gsims_by_trt: BTreeMap<TrtModelId, Vec<GsimRef>>,
    sm_by_trt: BTreeMap<TrtModelId, SourceModelId>,
    sampled: bool,
}

impl RlzsAssoc {
    /// Realizations in ordinal order
    pub fn realizations(&self) -> &[Realization] {
        &self.realizations
    }

    /// Number of realizations
    pub fn len(&self) -> usize {
        self.realizations.len()
    }

    /// True if there are no realizations
    pub fn is_empty(&self) -> bool {
        self.realizations.is_empty()
    }

    /// Whether the realizations were sampled
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// GSIMs used by at least one realization, per TRT model
    pub fn gsims_by_trt_id(&self) -> &BTreeMap<TrtModelId, Vec<GsimRef>> {
        &self.gsims_by_trt
    }

    /// GSIMs of one TRT model
    pub fn gsims(&self, trt_model_id: TrtModelId) -> &[GsimRef] {
        self.gsims_by_trt
            .get(&trt_model_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every `(trt_model_id, gsim)` key used by a realization
    pub fn curve_keys(&self) -> Vec<CurveKey> {
        self.gsims_by_trt
            .iter()
            .flat_map(|(trt, gsims)| gsims.iter().map(move |g| CurveKey::new(*trt, g.id().clone())))
            .collect()
    }

    /// Source model owning a TRT model
    pub fn get_sm_id(&self, trt_model_id: TrtModelId) -> Option<SourceModelId> {
        self.sm_by_trt.get(&trt_model_id).copied()
    }

    /// Realization weights, or `None` when sampled (uniform weights)
    pub fn weights(&self) -> Option<Vec<f64>> {
        if self.sampled {
            None
        } else {
            Some(self.realizations.iter().map(|r| r.weight).collect())
        }
    }

    /// Realizations grouped by source model
    pub fn realizations_by_sm(&self) -> BTreeMap<SourceModelId, Vec<&Realization>> {
        let mut groups: BTreeMap<SourceModelId, Vec<&Realization>> = BTreeMap::new();
        for rlz in &self.realizations {
            groups.entry(rlz.sm_id).or_default().push(rlz);
        }
        groups
    }

    /// Compose the curve of every realization from the independent curves.
    ///
    /// A key with no registered curve contributes nothing.
    pub fn combine_curves(
        &self,
        curves: &HashMap<CurveKey, HazardCurves>,
        n_sites: usize,
        imtls: &Arc<Imtls>,
    ) -> Result<Vec<HazardCurves>> {
        self.realizations
            .par_iter()
            .map(|rlz| -> Result<HazardCurves> {
                let mut composed = HazardCurves::zeros(n_sites, Arc::clone(imtls));
                for key in rlz.curve_keys() {
                    if let Some(c) = curves.get(&key) {
                        composed.combine(c)?;
                    }
                }
                Ok(composed)
            })
            .collect()
    }
}
