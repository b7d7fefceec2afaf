//! CalculatorBuilder for configuring and constructing calculators
//!
//! ## Table of Contents
//! - **CalculatorBuilder**: Builder pattern for `ClassicalCalculator`

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::HazardConfig;
use crate::error::{HazardError, Result};
use crate::logic_tree::LogicTree;
use crate::metrics::HazardMetrics;
use crate::site::SiteCollection;
use crate::storage::{FileStore, MemoryStore, SharedStore};

use super::executor::{LocalExecutor, TaskExecutor};
use super::ClassicalCalculator;

/// Builder for constructing calculators
#[derive(Default)]
pub struct CalculatorBuilder {
    config: Option<HazardConfig>,
    logic_tree: Option<LogicTree>,
    sites: Option<SiteCollection>,
    executor: Option<Arc<dyn TaskExecutor>>,
    store: Option<SharedStore>,
    store_path: Option<PathBuf>,
    metrics: Option<Arc<HazardMetrics>>,
}

impl CalculatorBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the calculation parameters
    pub fn with_config(mut self, config: HazardConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the logic tree
    pub fn with_logic_tree(mut self, logic_tree: LogicTree) -> Self {
        self.logic_tree = Some(logic_tree);
        self
    }

    /// Set the complete site collection
    pub fn with_sites(mut self, sites: SiteCollection) -> Self {
        self.sites = Some(sites);
        self
    }

    /// Set a custom task executor
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set a custom output store
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set file store path for persistent outputs
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Share an existing metrics registry
    pub fn with_metrics(mut self, metrics: Arc<HazardMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the inputs and build the calculator
    pub fn build(self) -> Result<ClassicalCalculator> {
        let config = self
            .config
            .ok_or_else(|| HazardError::config("config: required"))?;
        config.validate()?;

        let logic_tree = self
            .logic_tree
            .ok_or_else(|| HazardError::config("logic_tree: required"))?;
        logic_tree.validate()?;

        let sites = self
            .sites
            .ok_or_else(|| HazardError::config("sites: required"))?;
        if sites.is_empty() {
            return Err(HazardError::config("sites: empty site collection"));
        }

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(LocalExecutor::new()) as Arc<dyn TaskExecutor>);

        let store = match self.store {
            Some(s) => s,
            None => match &self.store_path {
                Some(path) => {
                    info!(path = %path.display(), "Using file store");
                    Arc::new(FileStore::open(path)?) as SharedStore
                }
                None => {
                    info!("Using in-memory store");
                    Arc::new(MemoryStore::new()) as SharedStore
                }
            },
        };

        let metrics = match self.metrics {
            Some(m) => Some(m),
            None if config.metrics_enabled => Some(Arc::new(HazardMetrics::new()?)),
            None => None,
        };

        info!(
            sites = sites.len(),
            source_models = logic_tree.source_models().len(),
            executor = executor.name(),
            metrics = metrics.is_some(),
            "Calculator built"
        );

        Ok(ClassicalCalculator::new(
            config, logic_tree, sites, executor, store, metrics,
        ))
    }
}
