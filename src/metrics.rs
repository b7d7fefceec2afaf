//! Metrics for hazard calculations
//!
//! ## Table of Contents
//! - **HazardMetrics**: Prometheus counters, gauges and histograms of one engine
//! - **RunningTask**: Guard holding one task attempt in the in-flight gauge
//! - **Timer**: Elapsed-time helper for phase and task timings
//!
//! Metrics are a side channel: nothing in the curve computation reads them.

use crate::error::{HazardError, Result};
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};

/// Core metrics of the engine
pub struct HazardMetrics {
    registry: Registry,

    // Task metrics
    /// Task attempts started
    pub tasks_submitted: Counter,
    /// Task attempts in flight
    pub tasks_running: Gauge,
    /// Task attempts finished, by status
    pub tasks_completed: CounterVec,
    /// Resubmissions
    pub task_retries: Counter,
    /// Task attempt duration
    pub task_duration: Histogram,

    // Source metrics
    /// Sources split
    pub sources_split: Counter,

    // Aggregation metrics
    /// Fold duration
    pub aggregation_duration: Histogram,
    /// Effective realizations
    pub realizations: Gauge,
}

impl HazardMetrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tasks_submitted =
            Counter::new("hazard_tasks_submitted_total", "Total curve tasks submitted")?;
        let tasks_running = Gauge::new("hazard_tasks_running", "Curve tasks in flight")?;
        let tasks_completed = CounterVec::new(
            Opts::new("hazard_tasks_completed_total", "Total curve tasks completed"),
            &["status"],
        )?;
        let task_retries = Counter::new(
            "hazard_task_retries_total",
            "Curve tasks resubmitted after a transient failure",
        )?;
        let task_duration = Histogram::with_opts(
            HistogramOpts::new("hazard_task_duration_seconds", "Curve task duration")
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        )?;
        let sources_split = Counter::new(
            "hazard_sources_split_total",
            "Sources split because their weight exceeded the threshold",
        )?;
        let aggregation_duration = Histogram::with_opts(
            HistogramOpts::new("hazard_aggregation_seconds", "Time spent folding partial results")
                .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]),
        )?;
        let realizations = Gauge::new("hazard_realizations", "Logic tree realizations")?;

        registry.register(Box::new(tasks_submitted.clone()))?;
        registry.register(Box::new(tasks_running.clone()))?;
        registry.register(Box::new(tasks_completed.clone()))?;
        registry.register(Box::new(task_retries.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(sources_split.clone()))?;
        registry.register(Box::new(aggregation_duration.clone()))?;
        registry.register(Box::new(realizations.clone()))?;

        Ok(Self {
            registry,
            tasks_submitted,
            tasks_running,
            tasks_completed,
            task_retries,
            task_duration,
            sources_split,
            aggregation_duration,
            realizations,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a task submission (including resubmissions).
    ///
    /// The attempt counts as running until the returned guard is dropped,
    /// which also happens when the task is cancelled.
    pub fn record_task_submitted(&self) -> RunningTask {
        self.tasks_submitted.inc();
        self.tasks_running.inc();
        RunningTask {
            gauge: self.tasks_running.clone(),
        }
    }

    /// Record the end of a task attempt
    pub fn record_task_completed(&self, status: &str, duration_secs: f64) {
        self.tasks_completed.with_label_values(&[status]).inc();
        self.task_duration.observe(duration_secs);
    }

    /// Record a resubmission
    pub fn record_retry(&self) {
        self.task_retries.inc();
    }

    /// Record split sources
    pub fn record_sources_split(&self, count: usize) {
        self.sources_split.inc_by(count as f64);
    }

    /// Record the time spent in one fold
    pub fn record_aggregation(&self, duration_secs: f64) {
        self.aggregation_duration.observe(duration_secs);
    }

    /// Set the realization count
    pub fn set_realizations(&self, count: usize) {
        self.realizations.set(count as f64);
    }

    /// Gather all metrics as text
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| HazardError::metrics(format!("Encode error: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| HazardError::metrics(format!("UTF8 error: {}", e)))
    }
}

impl std::fmt::Debug for HazardMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazardMetrics")
            .field("tasks_submitted", &self.tasks_submitted.get())
            .field("task_retries", &self.task_retries.get())
            .finish()
    }
}

/// One task attempt in flight
#[must_use = "the task stops counting as running when the guard is dropped"]
#[derive(Debug)]
pub struct RunningTask {
    gauge: Gauge,
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Get elapsed time in seconds
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Stop and return elapsed seconds
    pub fn stop(self) -> f64 {
        self.elapsed_secs()
    }
}
