//! # Calculation configuration
//!
//! `HazardConfig` is read from a TOML (or JSON) document or built in code.
//!
//! ## Table of Contents
//! 1. HazardConfig: calculation parameters
//! 2. Defaults
//! 3. Parsing and validation
//!
//! ```toml
//! maximum_distance = 200.0
//! truncation_level = 3.0
//! quantile_hazard_curves = [0.15, 0.5, 0.85]
//! hazard_maps = true
//! poes = [0.1, 0.02]
//!
//! [imtls]
//! PGA = [0.005, 0.01, 0.05, 0.1, 0.2, 0.4]
//! "SA(1.0)" = [0.005, 0.01, 0.05, 0.1]
//!
//! [retry]
//! max_retries = 5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calculator::retry::RetryConfig;
use crate::error::{HazardError, Result};
use crate::types::Imtls;

// ============================================================================
// 1. HazardConfig
// ============================================================================

/// Parameters of a classical calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardConfig {
    /// Intensity measure types and their strictly increasing levels
    pub imtls: Imtls,
    /// Integration distance (km)
    #[serde(default = "default_maximum_distance")]
    pub maximum_distance: f64,
    /// GSIM truncation level in standard deviations
    #[serde(default = "default_truncation_level")]
    pub truncation_level: Option<f64>,
    /// POEs for disaggregation; non-empty enables rupture envelope collection
    #[serde(default)]
    pub poes_disagg: Vec<f64>,
    /// Distance bin width for disaggregation (km)
    #[serde(default = "default_dist_bin_width")]
    pub dist_bin_width: f64,
    /// Coordinate bin width for disaggregation (degrees)
    #[serde(default = "default_coord_bin_width")]
    pub coord_bin_width: f64,
    /// Tiling threshold: more sites than this are computed tile by tile
    #[serde(default = "default_sites_per_tile")]
    pub sites_per_tile: usize,
    /// Target number of source blocks and bound on in-flight tasks
    #[serde(default = "default_concurrent_tasks")]
    pub concurrent_tasks: usize,
    /// Split and block threshold; derived from the total weight when absent
    #[serde(default)]
    pub max_source_weight: Option<f64>,
    /// Compute mean curves
    #[serde(default = "default_true")]
    pub mean_hazard_curves: bool,
    /// Quantile levels in [0, 1]
    #[serde(default)]
    pub quantile_hazard_curves: Vec<f64>,
    /// Hand off the curve of every realization
    #[serde(default = "default_true")]
    pub individual_curves: bool,
    /// Compute hazard maps
    #[serde(default)]
    pub hazard_maps: bool,
    /// Target POEs of the hazard maps
    #[serde(default)]
    pub poes: Vec<f64>,
    /// Number of sampled realizations; 0 enumerates the full logic tree
    #[serde(default)]
    pub number_of_logic_tree_samples: usize,
    /// Seed of the logic tree sampling
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    /// Retry policy of transient task failures
    #[serde(default)]
    pub retry: RetryConfig,
    /// Record prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

// ============================================================================
// 2. Defaults
// ============================================================================

fn default_maximum_distance() -> f64 { 200.0 }
fn default_truncation_level() -> Option<f64> { Some(3.0) }
fn default_dist_bin_width() -> f64 { 10.0 }
fn default_coord_bin_width() -> f64 { 1.0 }
fn default_sites_per_tile() -> usize { 1000 }
fn default_random_seed() -> u64 { 42 }
fn default_true() -> bool { true }

fn default_concurrent_tasks() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

impl HazardConfig {
    /// Configuration with default values for the given levels
    pub fn new(imtls: Imtls) -> Self {
        Self {
            imtls,
            maximum_distance: default_maximum_distance(),
            truncation_level: default_truncation_level(),
            poes_disagg: Vec::new(),
            dist_bin_width: default_dist_bin_width(),
            coord_bin_width: default_coord_bin_width(),
            sites_per_tile: default_sites_per_tile(),
            concurrent_tasks: default_concurrent_tasks(),
            max_source_weight: None,
            mean_hazard_curves: true,
            quantile_hazard_curves: Vec::new(),
            individual_curves: true,
            hazard_maps: false,
            poes: Vec::new(),
            number_of_logic_tree_samples: 0,
            random_seed: default_random_seed(),
            retry: RetryConfig::default(),
            metrics_enabled: true,
        }
    }

    /// Set the integration distance (km)
    pub fn maximum_distance(mut self, km: f64) -> Self {
        self.maximum_distance = km;
        self
    }

    /// Set the truncation level
    pub fn truncation_level(mut self, level: Option<f64>) -> Self {
        self.truncation_level = level;
        self
    }

    /// Set the tiling threshold
    pub fn sites_per_tile(mut self, n: usize) -> Self {
        self.sites_per_tile = n;
        self
    }

    /// Set the number of concurrent tasks
    pub fn concurrent_tasks(mut self, n: usize) -> Self {
        self.concurrent_tasks = n;
        self
    }

    /// Set an explicit split and block threshold
    pub fn max_source_weight(mut self, weight: f64) -> Self {
        self.max_source_weight = Some(weight);
        self
    }

    /// Set the quantile levels
    pub fn quantiles(mut self, quantiles: Vec<f64>) -> Self {
        self.quantile_hazard_curves = quantiles;
        self
    }

    /// Enable hazard maps at the given POEs
    pub fn hazard_maps(mut self, poes: Vec<f64>) -> Self {
        self.hazard_maps = true;
        self.poes = poes;
        self
    }

    /// Enable disaggregation envelopes
    pub fn disaggregation(mut self, poes: Vec<f64>) -> Self {
        self.poes_disagg = poes;
        self
    }

    /// Sample the logic tree
    pub fn samples(mut self, n: usize, seed: u64) -> Self {
        self.number_of_logic_tree_samples = n;
        self.random_seed = seed;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Whether rupture envelopes are collected
    pub fn is_disaggregation(&self) -> bool {
        !self.poes_disagg.is_empty()
    }

    // ========================================================================
    // 3. Parsing and validation
    // ========================================================================

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HazardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: HazardConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter, naming the offending field
    pub fn validate(&self) -> Result<()> {
        if self.imtls.is_empty() {
            return Err(HazardError::config("imtls: no intensity measure type"));
        }
        for (imt, levels, _) in self.imtls.iter() {
            if levels.is_empty() {
                return Err(HazardError::config(format!("imtls: no levels for {}", imt)));
            }
            if levels.iter().any(|&l| l <= 0.0) || levels.windows(2).any(|w| w[0] >= w[1]) {
                return Err(HazardError::config(format!(
                    "imtls: levels of {} must be positive and strictly increasing, got {:?}",
                    imt, levels
                )));
            }
        }
        if !(self.maximum_distance > 0.0) {
            return Err(HazardError::config(format!(
                "maximum_distance must be positive, got {}",
                self.maximum_distance
            )));
        }
        if let Some(level) = self.truncation_level {
            if level < 0.0 {
                return Err(HazardError::config(format!(
                    "truncation_level must not be negative, got {}",
                    level
                )));
            }
        }
        if self.sites_per_tile == 0 {
            return Err(HazardError::config("sites_per_tile must be positive"));
        }
        if self.concurrent_tasks == 0 {
            return Err(HazardError::config("concurrent_tasks must be positive"));
        }
        if let Some(w) = self.max_source_weight {
            if !(w > 0.0) {
                return Err(HazardError::config(format!(
                    "max_source_weight must be positive, got {}",
                    w
                )));
            }
        }
        if let Some(q) = self
            .quantile_hazard_curves
            .iter()
            .find(|&&q| !(0.0..=1.0).contains(&q))
        {
            return Err(HazardError::config(format!(
                "quantile_hazard_curves: {} is not in [0, 1]",
                q
            )));
        }
        if self.hazard_maps && self.poes.is_empty() {
            return Err(HazardError::config("poes: required when hazard_maps is enabled"));
        }
        for (field, values) in [("poes", &self.poes), ("poes_disagg", &self.poes_disagg)] {
            if let Some(p) = values.iter().find(|&&p| !(p > 0.0 && p <= 1.0)) {
                return Err(HazardError::config(format!("{}: {} is not in (0, 1]", field, p)));
            }
        }
        if self.is_disaggregation() && !(self.dist_bin_width > 0.0 && self.coord_bin_width > 0.0) {
            return Err(HazardError::config(
                "dist_bin_width and coord_bin_width must be positive",
            ));
        }
        self.retry.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Imt;

    const TOML: &str = r#"
maximum_distance = 150.0
quantile_hazard_curves = [0.15, 0.85]
hazard_maps = true
poes = [0.1]

[imtls]
PGA = [0.01, 0.1, 0.2]
"SA(1.0)" = [0.05]

[retry]
max_retries = 5
"#;

    #[test]
    fn test_from_toml_with_defaults() {
        let config = HazardConfig::from_toml_str(TOML).unwrap();
        assert_eq!(config.maximum_distance, 150.0);
        assert_eq!(config.truncation_level, Some(3.0));
        assert_eq!(config.sites_per_tile, 1000);
        assert_eq!(config.imtls.levels(&Imt::new("SA(1.0)")), Some(&[0.05][..]));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert!(config.mean_hazard_curves);
        assert!(!config.is_disaggregation());
    }

    #[test]
    fn test_json_round_trip() {
        let config = HazardConfig::new(Imtls::new().with("PGA", vec![0.1, 0.2])).quantiles(vec![0.5]);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(HazardConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_validate_names_field() {
        let bad_levels = HazardConfig::new(Imtls::new().with("PGA", vec![0.2, 0.1]));
        assert!(bad_levels.validate().unwrap_err().to_string().contains("imtls"));

        let bad_quantile = HazardConfig::new(Imtls::new().with("PGA", vec![0.1])).quantiles(vec![1.5]);
        assert!(bad_quantile
            .validate()
            .unwrap_err()
            .to_string()
            .contains("quantile_hazard_curves"));

        let mut no_poes = HazardConfig::new(Imtls::new().with("PGA", vec![0.1]));
        no_poes.hazard_maps = true;
        assert!(no_poes.validate().unwrap_err().to_string().contains("poes"));

        let mut bad_retry = HazardConfig::new(Imtls::new().with("PGA", vec![0.1]));
        bad_retry.retry.multiplier = 0.0;
        assert!(bad_retry.validate().unwrap_err().to_string().contains("retry.multiplier"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(&path, TOML).unwrap();
        let config = HazardConfig::load(&path).unwrap();
        assert!(config.hazard_maps);
        assert!(HazardConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
