//! Classical hazard calculator
//!
//! ## Table of Contents
//! - **ClassicalCalculator**: Controller running the three phases of a calculation
//! - **PreparedCalculation**: Tasks and realizations built by `pre_execute`
//! - **HazardOutputs**: Everything handed off by `post_execute`
//! - **SourceInfo**: Per-source calculation report
//!
//! `pre_execute` splits heavy sources and cuts the work into tasks,
//! `execute` dispatches them and folds their results as they complete, and
//! `post_execute` composes realizations, statistics and maps.

pub mod builder;
pub mod executor;
pub mod retry;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::aggregate::{Accumulator, CurveReducer};
use crate::bbox::BinEdges;
use crate::compute::{CurveTask, PartialResult, TaskParams};
use crate::config::HazardConfig;
use crate::curves::HazardCurves;
use crate::error::{HazardError, Result};
use crate::logic_tree::{LogicTree, Realization, RlzsAssoc};
use crate::metrics::{HazardMetrics, Timer};
use crate::site::SiteCollection;
use crate::source::{block_splitter, split_sources, IndexedSource, SplitCache};
use crate::stats::{compute_hazard_maps, compute_statistics, HazardMaps};
use crate::storage::{keys, store_set_json, SharedStore, StoredArray};
use crate::types::{CalculationId, CurveKey, Imtls, SiteId, SourceIdx, SourceModelId, TrtModelId};

pub use builder::CalculatorBuilder;
pub use executor::{LocalExecutor, TaskExecutor};
pub use retry::{Backoff, RetryConfig};

/// Reporting row of one original source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Index in the composite source model
    pub idx: SourceIdx,
    /// TRT model of the source
    pub trt_model_id: TrtModelId,
    /// Source id
    pub source_id: String,
    /// Source typology
    pub kind: String,
    /// Weight before splitting
    pub weight: f64,
    /// Number of fragments the source was computed as, summed over tiles
    pub num_split: usize,
    /// Total computation time (seconds)
    pub calc_time: f64,
}

/// Output of [`ClassicalCalculator::pre_execute`]
#[derive(Debug, Clone)]
pub struct PreparedCalculation {
    /// Realizations of the full logic tree
    pub rlzs_assoc: RlzsAssoc,
    /// Tasks in submission order
    pub tasks: Vec<Arc<CurveTask>>,
    /// Sources before splitting, in index order
    pub sources: Vec<IndexedSource>,
    /// Split and block threshold
    pub max_weight: f64,
}

/// Results of a calculation
#[derive(Debug, Clone)]
pub struct HazardOutputs {
    /// Calculation id, recorded in every stored array
    pub calculation_id: CalculationId,
    /// Realizations over the effective TRT models
    pub realizations: Vec<Realization>,
    /// Full-site curves per `(trt_model_id, gsim)`
    pub curves: HashMap<CurveKey, HazardCurves>,
    /// One curve per realization, in ordinal order
    pub rlz_curves: Vec<HazardCurves>,
    /// Mean curve
    pub mean: Option<HazardCurves>,
    /// Quantile curves
    pub quantiles: Vec<(f64, HazardCurves)>,
    /// Hazard maps by kind (`mean`, `quantile-0.5`, `rlz-000`)
    pub hazard_maps: BTreeMap<String, HazardMaps>,
    /// Disaggregation bin edges per `(source model, site)`
    pub bin_edges: BTreeMap<(SourceModelId, SiteId), BinEdges>,
    /// Source report, slowest first
    pub source_info: Vec<SourceInfo>,
}

struct TaskOutcome {
    task: Arc<CurveTask>,
    result: Result<PartialResult>,
    elapsed_secs: f64,
}

/// Controller of a classical calculation
pub struct ClassicalCalculator {
    id: CalculationId,
    config: HazardConfig,
    imtls: Arc<Imtls>,
    logic_tree: LogicTree,
    sites: Arc<SiteCollection>,
    executor: Arc<dyn TaskExecutor>,
    store: SharedStore,
    metrics: Option<Arc<HazardMetrics>>,
    split_cache: SplitCache,
}

impl ClassicalCalculator {
    pub(crate) fn new(
        config: HazardConfig,
        logic_tree: LogicTree,
        sites: SiteCollection,
        executor: Arc<dyn TaskExecutor>,
        store: SharedStore,
        metrics: Option<Arc<HazardMetrics>>,
    ) -> Self {
        let imtls = Arc::new(config.imtls.clone());
        Self {
            id: CalculationId::new(),
            config,
            imtls,
            logic_tree,
            sites: Arc::new(sites),
            executor,
            store,
            metrics,
            split_cache: SplitCache::new(),
        }
    }

    /// Create a builder
    pub fn builder() -> CalculatorBuilder {
        CalculatorBuilder::new()
    }

    /// Calculation id
    pub fn id(&self) -> CalculationId {
        self.id
    }

    /// Configuration
    pub fn config(&self) -> &HazardConfig {
        &self.config
    }

    /// Complete site collection
    pub fn sites(&self) -> &SiteCollection {
        &self.sites
    }

    /// Output store
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Metrics, if enabled
    pub fn metrics(&self) -> Option<&Arc<HazardMetrics>> {
        self.metrics.as_ref()
    }

    /// Run the three phases and flush the store
    pub async fn run(&mut self) -> Result<HazardOutputs> {
        let timer = Timer::start();
        info!(
            calculation_id = %self.id,
            sites = self.sites.len(),
            executor = self.executor.name(),
            store = self.store.name(),
            "Starting classical calculation"
        );

        let prepared = self.pre_execute()?;
        let acc = self.execute(&prepared).await?;
        let outputs = self.post_execute(&prepared, acc).await?;
        self.store.flush().await?;

        info!(
            calculation_id = %self.id,
            realizations = outputs.realizations.len(),
            elapsed_secs = timer.stop(),
            "Classical calculation complete"
        );
        Ok(outputs)
    }

    // ------------------------------------------------------------------
    // pre_execute
    // ------------------------------------------------------------------

    /// Build the realizations and the task list.
    ///
    /// Heavy sources are split through the calculator's cache, so calling
    /// this twice splits every source once.
    pub fn pre_execute(&mut self) -> Result<PreparedCalculation> {
        let rlzs_assoc = self
            .logic_tree
            .rlzs_assoc(self.config.number_of_logic_tree_samples, self.config.random_seed)?;

        let mut all_sources = Vec::new();
        for (_, tm) in self.logic_tree.trt_models() {
            for source in &tm.sources {
                if source.trt_model_id() != tm.id {
                    return Err(HazardError::config(format!(
                        "source {} declares trt_model_id={} but belongs to trt_model_id={}",
                        source.source_id(),
                        source.trt_model_id(),
                        tm.id
                    )));
                }
                all_sources.push(Arc::clone(source));
            }
        }
        let sources = IndexedSource::index_all(all_sources);

        let total_weight: f64 = sources.iter().map(|s| s.source.weight()).sum();
        let max_weight = match self.config.max_source_weight {
            Some(w) => w,
            None => (total_weight / self.config.concurrent_tasks as f64).ceil().max(1.0),
        };

        let cached = self.split_cache.len();
        let split = split_sources(&sources, max_weight, &mut self.split_cache)?;
        let split_misses = self.split_cache.len() - cached;
        if let Some(metrics) = &self.metrics {
            metrics.record_sources_split(split_misses);
        }
        let blocks = block_splitter(split, max_weight);

        let tiles = self.sites.tiles(self.config.sites_per_tile);
        let mut tasks = Vec::with_capacity(tiles.len() * blocks.len());
        for tile in &tiles {
            for block in &blocks {
                let gsims = rlzs_assoc.gsims(block.trt_model_id);
                if gsims.is_empty() {
                    debug!(trt_model_id = %block.trt_model_id, "No realization uses this TRT model, skipping block");
                    continue;
                }
                let sm_id = rlzs_assoc.get_sm_id(block.trt_model_id).ok_or_else(|| {
                    HazardError::internal(format!("no source model for trt_model_id={}", block.trt_model_id))
                })?;
                tasks.push(Arc::new(CurveTask {
                    task_no: tasks.len(),
                    trt_model_id: block.trt_model_id,
                    sm_id,
                    sources: block.sources.clone(),
                    tile: tile.clone(),
                    gsims: gsims.to_vec(),
                }));
            }
        }

        info!(
            sources = sources.len(),
            split = split_misses,
            total_weight,
            max_weight,
            blocks = blocks.len(),
            tiles = tiles.len(),
            tasks = tasks.len(),
            realizations = rlzs_assoc.len(),
            "Prepared curve tasks"
        );

        Ok(PreparedCalculation {
            rlzs_assoc,
            tasks,
            sources,
            max_weight,
        })
    }

    // ------------------------------------------------------------------
    // execute
    // ------------------------------------------------------------------

    fn task_params(&self) -> TaskParams {
        TaskParams {
            max_distance: self.config.maximum_distance,
            truncation_level: self.config.truncation_level,
            imtls: Arc::clone(&self.imtls),
            collect_bounding_boxes: self.config.is_disaggregation(),
        }
    }

    fn spawn_task(
        &self,
        join_set: &mut JoinSet<TaskOutcome>,
        semaphore: &Arc<Semaphore>,
        task: Arc<CurveTask>,
        params: Arc<TaskParams>,
        delay: Duration,
    ) {
        let executor = Arc::clone(&self.executor);
        let semaphore = Arc::clone(semaphore);
        let metrics = self.metrics.clone();
        join_set.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return TaskOutcome {
                        task,
                        result: Err(HazardError::internal("task semaphore closed")),
                        elapsed_secs: 0.0,
                    }
                }
            };
            let _running = metrics.as_ref().map(|m| m.record_task_submitted());
            let timer = Timer::start();
            let result = executor.execute(Arc::clone(&task), params).await;
            TaskOutcome {
                task,
                result,
                elapsed_secs: timer.stop(),
            }
        });
    }

    fn record_completed(&self, status: &str, elapsed_secs: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_task_completed(status, elapsed_secs);
        }
    }

    /// Dispatch every task and fold the results in completion order.
    ///
    /// At most `concurrent_tasks` tasks run at once. Transient failures are
    /// resubmitted after a backoff delay; any other failure aborts the tasks
    /// still in flight and is returned.
    pub async fn execute(&self, prepared: &PreparedCalculation) -> Result<Accumulator> {
        let n_sites = self.sites.len();
        let bb_pairs: Vec<(SourceModelId, SiteId)> = if self.config.is_disaggregation() {
            self.logic_tree
                .source_models()
                .iter()
                .flat_map(|sm| self.sites.iter().map(move |site| (sm.id, site.id)))
                .collect()
        } else {
            Vec::new()
        };
        let mut acc = Accumulator::zeros(
            prepared.rlzs_assoc.curve_keys(),
            n_sites,
            Arc::clone(&self.imtls),
            &bb_pairs,
        );
        let reducer = CurveReducer::new(n_sites, self.config.sites_per_tile);
        let params = Arc::new(self.task_params());
        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_tasks));

        info!(
            tasks = prepared.tasks.len(),
            concurrent_tasks = self.config.concurrent_tasks,
            tiling = reducer.is_tiling(),
            "Dispatching curve tasks"
        );

        let mut join_set = JoinSet::new();
        for task in &prepared.tasks {
            self.spawn_task(&mut join_set, &semaphore, Arc::clone(task), Arc::clone(&params), Duration::ZERO);
        }

        let mut backoffs: HashMap<usize, Backoff> = HashMap::new();
        let mut done = 0usize;
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Curve task could not be joined, aborting");
                    join_set.shutdown().await;
                    return Err(HazardError::internal(format!("task join failed: {}", e)));
                }
            };
            let task_no = outcome.task.task_no;
            let trt_model_id = outcome.task.trt_model_id;

            match outcome.result {
                Ok(partial) => {
                    self.record_completed("success", outcome.elapsed_secs);
                    let timer = Timer::start();
                    if let Err(e) = reducer.reduce(&mut acc, partial) {
                        error!(task_no, %trt_model_id, error = %e, "Aggregation failed, aborting");
                        join_set.shutdown().await;
                        return Err(HazardError::task(task_no, trt_model_id, e));
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.record_aggregation(timer.stop());
                    }
                    done += 1;
                    debug!(task_no, done, total = prepared.tasks.len(), "Task folded");
                }
                Err(e) if e.is_retryable() => {
                    self.record_completed("retry", outcome.elapsed_secs);
                    let backoff = backoffs
                        .entry(task_no)
                        .or_insert_with(|| Backoff::new(self.config.retry.clone()));
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(
                                task_no,
                                %trt_model_id,
                                attempt = backoff.attempt(),
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Transient task failure, resubmitting"
                            );
                            if let Some(metrics) = &self.metrics {
                                metrics.record_retry();
                            }
                            self.spawn_task(&mut join_set, &semaphore, outcome.task, Arc::clone(&params), delay);
                        }
                        None => {
                            let attempts = backoff.attempt() + 1;
                            error!(task_no, %trt_model_id, attempts, error = %e, "Retries exhausted, aborting");
                            join_set.shutdown().await;
                            return Err(HazardError::RetriesExhausted {
                                task_no,
                                attempts,
                                source: Box::new(e),
                            });
                        }
                    }
                }
                Err(e) => {
                    self.record_completed("failed", outcome.elapsed_secs);
                    error!(task_no, %trt_model_id, error = %e, "Task failed, aborting");
                    join_set.shutdown().await;
                    return Err(HazardError::task(task_no, trt_model_id, e));
                }
            }
        }

        info!(tasks = done, keys = acc.curves.len(), "All curve tasks folded");
        Ok(acc)
    }

    // ------------------------------------------------------------------
    // post_execute
    // ------------------------------------------------------------------

    async fn save(&self, array: StoredArray) -> Result<()> {
        array
            .with_attr("calculation_id", self.id.as_uuid().to_string())
            .save(self.store.as_ref())
            .await
    }

    fn curve_array(&self, name: String, curves: &HazardCurves) -> StoredArray {
        let columns = self
            .imtls
            .iter()
            .flat_map(|(imt, levels, _)| levels.iter().map(move |l| format!("{}~{}", imt, l)))
            .collect();
        StoredArray::new(
            name,
            vec![curves.n_sites(), curves.num_levels()],
            columns,
            curves.as_slice().to_vec(),
        )
    }

    fn source_info(&self, prepared: &PreparedCalculation, acc: &Accumulator) -> Vec<SourceInfo> {
        let calc_times = acc.calc_times_by_source();
        let fragments = acc.fragments_by_source();
        let mut rows: Vec<SourceInfo> = prepared
            .sources
            .iter()
            .map(|src| SourceInfo {
                idx: src.idx,
                trt_model_id: src.source.trt_model_id(),
                source_id: src.source.source_id().to_string(),
                kind: src.source.kind().to_string(),
                weight: src.source.weight(),
                num_split: fragments.get(&src.idx).copied().unwrap_or(0),
                calc_time: calc_times
                    .get(&src.idx)
                    .map(Duration::as_secs_f64)
                    .unwrap_or(0.0),
            })
            .collect();
        rows.sort_by(|a, b| b.calc_time.total_cmp(&a.calc_time).then(a.idx.cmp(&b.idx)));
        rows
    }

    /// Compose realizations, compute statistics and maps, and hand
    /// everything off to the store
    pub async fn post_execute(&self, prepared: &PreparedCalculation, acc: Accumulator) -> Result<HazardOutputs> {
        let n_sites = self.sites.len();

        let source_info = self.source_info(prepared, &acc);
        store_set_json(self.store.as_ref(), keys::SOURCE_INFO, &source_info).await?;

        for (sm, tm) in self.logic_tree.trt_models() {
            for (i, branch) in tm.gsims.iter().enumerate() {
                let gsim = &branch.gsim;
                let key = CurveKey::new(tm.id, gsim.id().clone());
                let Some(curves) = acc.get(&key) else { continue };
                if curves.is_zero() {
                    continue;
                }
                let name = keys::curves_by_sm(&sm.path_str(), tm.id.as_u32(), i);
                let array = self
                    .curve_array(name, curves)
                    .with_attr("trt", tm.trt.clone())
                    .with_attr("gsim", gsim.id().as_str());
                self.save(array).await?;
            }
        }

        let assoc = self.logic_tree.rlzs_assoc_with(
            self.config.number_of_logic_tree_samples,
            self.config.random_seed,
            |trt| acc.is_effective_trt_model(trt),
        )?;
        if let Some(metrics) = &self.metrics {
            metrics.set_realizations(assoc.len());
        }
        store_set_json(self.store.as_ref(), keys::REALIZATIONS, &assoc.realizations()).await?;

        let rlz_curves = assoc.combine_curves(&acc.curves, n_sites, &self.imtls)?;
        if self.config.individual_curves {
            for (rlz, curves) in assoc.realizations().iter().zip(&rlz_curves) {
                let array = self
                    .curve_array(keys::hcurves(&keys::rlz_kind(rlz.ordinal)), curves)
                    .with_attr("uid", rlz.uid.clone())
                    .with_attr("weight", rlz.weight);
                self.save(array).await?;
            }
        }

        let (mean, quantiles) = if rlz_curves.len() == 1 {
            info!("Single realization, its curves are the mean");
            let mean = self.config.mean_hazard_curves.then(|| rlz_curves[0].clone());
            (mean, Vec::new())
        } else {
            let weights = assoc.weights();
            let stats = compute_statistics(
                &rlz_curves,
                weights.as_deref(),
                self.config.mean_hazard_curves,
                &self.config.quantile_hazard_curves,
            )?;
            info!(
                realizations = rlz_curves.len(),
                sampled = assoc.is_sampled(),
                quantiles = stats.quantiles.len(),
                "Computed hazard statistics"
            );
            (stats.mean, stats.quantiles)
        };

        let mut kinds: Vec<(String, &HazardCurves)> = Vec::new();
        if let Some(mean) = &mean {
            kinds.push(("mean".to_string(), mean));
        }
        for (q, curves) in &quantiles {
            kinds.push((keys::quantile_kind(*q), curves));
        }
        for (kind, curves) in &kinds {
            self.save(self.curve_array(keys::hcurves(kind), curves)).await?;
        }

        let mut hazard_maps = BTreeMap::new();
        if self.config.hazard_maps {
            if self.config.individual_curves {
                for (rlz, curves) in assoc.realizations().iter().zip(&rlz_curves) {
                    kinds.push((keys::rlz_kind(rlz.ordinal), curves));
                }
            }
            for (kind, curves) in kinds {
                let maps = compute_hazard_maps(curves, &self.config.poes)?;
                let array = StoredArray::new(
                    keys::hmaps(&kind),
                    vec![maps.n_sites, maps.columns.len()],
                    maps.columns.clone(),
                    maps.data.clone(),
                )
                .with_attr("poes", self.config.poes.clone());
                self.save(array).await?;
                hazard_maps.insert(kind, maps);
            }
            info!(maps = hazard_maps.len(), poes = ?self.config.poes, "Computed hazard maps");
        }

        let mut bin_edges = BTreeMap::new();
        if self.config.is_disaggregation() {
            let mut pairs: Vec<_> = acc.bounding_boxes.iter().collect();
            pairs.sort_by_key(|(key, _)| **key);
            for (&(sm_id, site_id), bb) in pairs {
                if bb.is_empty() {
                    continue;
                }
                let edges = bb.bins_edges(self.config.dist_bin_width, self.config.coord_bin_width)?;
                store_set_json(
                    self.store.as_ref(),
                    &keys::bin_edges(sm_id.as_u32(), site_id.as_u32()),
                    &edges,
                )
                .await?;
                bin_edges.insert((sm_id, site_id), edges);
            }
            debug!(boxes = bin_edges.len(), "Stored disaggregation bin edges");
        }

        Ok(HazardOutputs {
            calculation_id: self.id,
            realizations: assoc.realizations().to_vec(),
            curves: acc.curves,
            rlz_curves,
            mean,
            quantiles,
            hazard_maps,
            bin_edges,
            source_info,
        })
    }
}

impl std::fmt::Debug for ClassicalCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassicalCalculator")
            .field("id", &self.id)
            .field("sites", &self.sites.len())
            .field("executor", &self.executor.name())
            .field("store", &self.store.name())
            .finish()
    }
}
