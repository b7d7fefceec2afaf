//! End-to-end checks of the classical calculator

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hazard_forge::calculator::RetryConfig;
use hazard_forge::prelude::*;
use hazard_forge::source::{Occurrence, PointSource};
use hazard_forge::{
    compute_curves, Accumulator, CurveKey, CurveReducer, CurveTask, GsimId, HazardError, Imt,
    LocalExecutor, PartialResult, Rupture, StoredArray, TaskExecutor, TaskParams,
};

/// Fixed POEs per level, whatever the rupture and the site
#[derive(Debug)]
struct TableGsim {
    id: GsimId,
    poes: Vec<f64>,
}

impl TableGsim {
    fn new(name: &str, poes: Vec<f64>) -> GsimRef {
        Arc::new(Self {
            id: GsimId::new(name),
            poes,
        })
    }
}

impl GroundMotionModel for TableGsim {
    fn id(&self) -> &GsimId {
        &self.id
    }

    fn poes(&self, _: &Rupture, _: &Site, _: &Imt, levels: &[f64], _: Option<f64>) -> Vec<f64> {
        self.poes[..levels.len()].to_vec()
    }
}

/// POEs decaying with distance and level
#[derive(Debug)]
struct AttenuatingGsim {
    id: GsimId,
    scale: f64,
}

impl AttenuatingGsim {
    fn new(name: &str, scale: f64) -> GsimRef {
        Arc::new(Self {
            id: GsimId::new(name),
            scale,
        })
    }
}

impl GroundMotionModel for AttenuatingGsim {
    fn id(&self) -> &GsimId {
        &self.id
    }

    fn poes(&self, rupture: &Rupture, site: &Site, _: &Imt, levels: &[f64], _: Option<f64>) -> Vec<f64> {
        let dist = rupture.surface.distance_to(&site.location);
        levels
            .iter()
            .map(|l| (self.scale * rupture.mag / 8.0 * (-dist / 50.0).exp() * (-l * 4.0).exp()).min(1.0))
            .collect()
    }
}

fn point(id: &str, trt: u32, lon: f64, lat: f64, rate: f64) -> Arc<PointSource> {
    Arc::new(
        PointSource::new(id, TrtModelId::new(trt), Location::new(lon, lat))
            .with_rupture(6.0, Occurrence::Poisson { rate, time_span: 1.0 }),
    )
}

fn regional_tree() -> LogicTree {
    let mut crust = TrtModel::new(TrtModelId::new(0), "Active Shallow Crust")
        .with_gsim(AttenuatingGsim::new("Fast", 1.0), 0.7)
        .with_gsim(AttenuatingGsim::new("Slow", 0.6), 0.3);
    for i in 0..6 {
        crust = crust.with_source(point(&format!("c{}", i), 0, 0.1 * i as f64, 0.05, 0.01 * (i + 1) as f64));
    }
    let subduction = TrtModel::new(TrtModelId::new(1), "Subduction Interface")
        .with_source(point("s0", 1, 0.4, -0.3, 0.004))
        .with_source(point("s1", 1, 0.2, 0.6, 0.002))
        .with_gsim(AttenuatingGsim::new("Interface", 0.8), 1.0);
    LogicTree::new(vec![SourceModel::new(SourceModelId::new(0), "b1", 1.0)
        .with_trt_model(crust)
        .with_trt_model(subduction)])
}

fn site_grid(n: u32) -> SiteCollection {
    SiteCollection::new(
        (0..n)
            .map(|i| Site::new(i, 0.1 * (i % 4) as f64, 0.1 * (i / 4) as f64, 760.0))
            .collect(),
    )
}

fn regional_config() -> HazardConfig {
    HazardConfig::new(
        Imtls::new()
            .with("PGA", vec![0.05, 0.1, 0.2, 0.4])
            .with("SA(1.0)", vec![0.02, 0.1]),
    )
    .concurrent_tasks(4)
    .quantiles(vec![0.15, 0.85])
}

fn calculator(config: HazardConfig, n_sites: u32, executor: Arc<dyn TaskExecutor>) -> ClassicalCalculator {
    CalculatorBuilder::new()
        .with_config(config)
        .with_logic_tree(regional_tree())
        .with_sites(site_grid(n_sites))
        .with_executor(executor)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_mean_is_weighted_average_of_gsims() {
    let poes_a = vec![0.5, 0.2, 0.05];
    let poes_b = vec![0.4, 0.1, 0.01];
    let (rate1, rate2) = (0.02, 0.03);

    let logic_tree = LogicTree::new(vec![SourceModel::new(SourceModelId::new(0), "b1", 1.0)
        .with_trt_model(
            TrtModel::new(TrtModelId::new(0), "Active Shallow Crust")
                .with_source(point("src1", 0, 0.0, 0.1, rate1))
                .with_source(point("src2", 0, 0.2, 0.0, rate2))
                .with_gsim(TableGsim::new("A", poes_a.clone()), 0.6)
                .with_gsim(TableGsim::new("B", poes_b.clone()), 0.4),
        )]);
    let config = HazardConfig::new(Imtls::new().with("PGA", vec![0.1, 0.2, 0.4]));

    let mut calc = CalculatorBuilder::new()
        .with_config(config)
        .with_logic_tree(logic_tree)
        .with_sites(SiteCollection::new(vec![Site::new(0, 0.0, 0.0, 760.0)]))
        .build()
        .unwrap();
    let outputs = calc.run().await.unwrap();

    // 1 - exp(-rate1 poe) exp(-rate2 poe), per GSIM
    let curve = |poes: &[f64]| -> Vec<f64> {
        poes.iter().map(|p| 1.0 - (-(rate1 + rate2) * p).exp()).collect()
    };
    let (expected_a, expected_b) = (curve(&poes_a), curve(&poes_b));

    let rlz_a = outputs.rlz_curves[0].curve(0, &Imt::new("PGA")).unwrap();
    let rlz_b = outputs.rlz_curves[1].curve(0, &Imt::new("PGA")).unwrap();
    let mean = outputs.mean.as_ref().unwrap().curve(0, &Imt::new("PGA")).unwrap();
    for i in 0..3 {
        assert!((rlz_a[i] - expected_a[i]).abs() < 1e-9);
        assert!((rlz_b[i] - expected_b[i]).abs() < 1e-9);
        let expected = 0.6 * expected_a[i] + 0.4 * expected_b[i];
        assert!((mean[i] - expected).abs() < 1e-9, "level {}: {} != {}", i, mean[i], expected);
    }

    let stored = StoredArray::load(calc.store().as_ref(), "hcurves/mean")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.data, mean.to_vec());
    assert_eq!(stored.attrs["calculation_id"], calc.id().as_uuid().to_string());
}

#[tokio::test]
async fn test_tiling_gives_the_same_curves() {
    let mut single = calculator(regional_config().sites_per_tile(100), 10, Arc::new(LocalExecutor::new()));
    let mut tiled = calculator(regional_config().sites_per_tile(3), 10, Arc::new(LocalExecutor::new()));

    let a = single.run().await.unwrap();
    let b = tiled.run().await.unwrap();

    assert_eq!(a.curves.len(), b.curves.len());
    for (key, curves) in &a.curves {
        let other = &b.curves[key];
        assert!(curves.max_abs_diff(other) < 1e-12, "{} differs", key);
    }
    for (x, y) in a.rlz_curves.iter().zip(&b.rlz_curves) {
        assert!(x.max_abs_diff(y) < 1e-12);
    }
    assert!(!a.mean.as_ref().unwrap().is_zero());
}

#[tokio::test]
async fn test_fold_order_does_not_matter() {
    let mut calc = calculator(regional_config().sites_per_tile(4).max_source_weight(1.0), 10, Arc::new(LocalExecutor::new()));
    let prepared = calc.pre_execute().unwrap();
    let executed = calc.execute(&prepared).await.unwrap();

    let config = calc.config().clone();
    let imtls = Arc::new(config.imtls.clone());
    let params = TaskParams {
        max_distance: config.maximum_distance,
        truncation_level: config.truncation_level,
        imtls: Arc::clone(&imtls),
        collect_bounding_boxes: false,
    };
    let partials: Vec<PartialResult> = prepared
        .tasks
        .iter()
        .map(|t| compute_curves(t, &params).unwrap())
        .collect();
    assert!(partials.len() > 4);

    let n_sites = calc.sites().len();
    let reducer = CurveReducer::new(n_sites, config.sites_per_tile);
    let fresh = || Accumulator::zeros(prepared.rlzs_assoc.curve_keys(), n_sites, Arc::clone(&imtls), &[]);

    let mut reversed = fresh();
    for partial in partials.iter().rev().cloned() {
        reducer.reduce(&mut reversed, partial).unwrap();
    }

    // two halves folded separately, then merged
    let (left, right) = partials.split_at(partials.len() / 2);
    let mut tree = fresh();
    let mut other = Accumulator::empty();
    for partial in left.iter().cloned() {
        reducer.reduce(&mut tree, partial).unwrap();
    }
    for partial in right.iter().cloned() {
        reducer.reduce(&mut other, partial).unwrap();
    }
    tree.merge(other).unwrap();

    for key in executed.sorted_keys() {
        let expected = executed.get(key).unwrap();
        assert!(expected.max_abs_diff(reversed.get(key).unwrap()) < 1e-12);
        assert!(expected.max_abs_diff(tree.get(key).unwrap()) < 1e-12);
    }
    assert_eq!(executed.calc_times.len(), reversed.calc_times.len());
}

#[tokio::test]
async fn test_realization_composes_its_trt_models() {
    let mut calc = calculator(regional_config(), 4, Arc::new(LocalExecutor::new()));
    let outputs = calc.run().await.unwrap();

    let subduction = CurveKey::new(TrtModelId::new(1), GsimId::new("Interface"));
    let crust = CurveKey::new(TrtModelId::new(0), GsimId::new("Fast"));
    let mut expected = outputs.curves[&crust].clone();
    expected.combine(&outputs.curves[&subduction]).unwrap();
    assert!(expected.max_abs_diff(&outputs.rlz_curves[0]) < 1e-12);
    assert_eq!(outputs.realizations[0].uid, "b1~Fast_Interface");
}

/// Fails the first attempts of task 0 with a transient error
#[derive(Debug)]
struct FlakyExecutor {
    failures_left: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for FlakyExecutor {
    async fn execute(&self, task: Arc<CurveTask>, params: Arc<TaskParams>) -> hazard_forge::Result<PartialResult> {
        if task.task_no == 0 {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(HazardError::transient("worker lost"));
            }
        }
        LocalExecutor::new().execute(task, params).await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let retry = RetryConfig::default()
        .max_retries(3)
        .initial_delay(Duration::from_millis(5))
        .jitter(false);
    let flaky = Arc::new(FlakyExecutor {
        failures_left: AtomicUsize::new(2),
    });
    let mut retried = calculator(regional_config().retry(retry), 6, flaky.clone());
    let mut direct = calculator(regional_config(), 6, Arc::new(LocalExecutor::new()));

    let a = retried.run().await.unwrap();
    let b = direct.run().await.unwrap();

    assert_eq!(flaky.failures_left.load(Ordering::SeqCst), 0);
    let (ma, mb) = (a.mean.unwrap(), b.mean.unwrap());
    assert!(ma.max_abs_diff(&mb) < 1e-12);
}

/// Fails task 1 with a configuration error; every other task hangs
#[derive(Debug)]
struct BrokenExecutor;

#[async_trait]
impl TaskExecutor for BrokenExecutor {
    async fn execute(&self, task: Arc<CurveTask>, _: Arc<TaskParams>) -> hazard_forge::Result<PartialResult> {
        if task.task_no == 1 {
            return Err(HazardError::config("source c1 cannot be computed"));
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(HazardError::internal("should have been aborted"))
    }

    fn name(&self) -> &str {
        "broken"
    }
}

#[tokio::test]
async fn test_fatal_failure_aborts_the_run() {
    let config = regional_config().concurrent_tasks(16).max_source_weight(1.0);
    let mut calc = calculator(config, 4, Arc::new(BrokenExecutor));

    let result = tokio::time::timeout(Duration::from_secs(10), calc.run())
        .await
        .expect("in-flight tasks were not aborted");
    let err = result.unwrap_err();
    assert!(!err.is_retryable());
    match err {
        HazardError::Task { task_no, trt_model_id, .. } => {
            assert_eq!(task_no, 1);
            assert_eq!(trt_model_id, TrtModelId::new(0));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(calc.store().list_prefix("hcurves/").await.unwrap().is_empty());
    // the hanging tasks were cancelled, so none is still counted as running
    assert_eq!(calc.metrics().unwrap().tasks_running.get(), 0.0);
}

#[tokio::test]
async fn test_sampled_realizations_use_uniform_weights() {
    let config = regional_config().samples(5, 7);
    let mut calc = calculator(config, 4, Arc::new(LocalExecutor::new()));
    let outputs = calc.run().await.unwrap();

    assert_eq!(outputs.realizations.len(), 5);
    assert!(outputs.realizations.iter().all(|r| (r.weight - 0.2).abs() < 1e-12));

    let mut mean = vec![0.0; outputs.rlz_curves[0].as_slice().len()];
    for curves in &outputs.rlz_curves {
        for (m, v) in mean.iter_mut().zip(curves.as_slice()) {
            *m += v / 5.0;
        }
    }
    let computed = outputs.mean.unwrap();
    for (m, v) in mean.iter().zip(computed.as_slice()) {
        assert!((m - v).abs() < 1e-12);
    }
}
