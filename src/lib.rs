//! # Hazard Forge
//!
//! A Rust-native engine for classical probabilistic seismic hazard analysis.
//! Sources are cut into weighted blocks, each block is computed against a
//! tile of sites as an independent task, and the partial hazard curves are
//! folded on a single controller as they complete.
//!
//! ## Features
//!
//! - **Parallel tasks**: Bounded in-flight tasks with retry of transient failures
//! - **Order-independent fold**: Probability-of-no-exceedance composition
//! - **Logic trees**: Full enumeration or seeded sampling of realizations
//! - **Statistics**: Weighted mean and quantile curves, hazard maps
//! - **Disaggregation envelopes**: Per site rupture bounding boxes and bin edges
//! - **Metrics**: Prometheus-compatible metrics export
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hazard_forge::prelude::*;
//! use hazard_forge::source::{Occurrence, PointSource};
//!
//! # fn gsim() -> GsimRef { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> hazard_forge::Result<()> {
//!     let source = PointSource::new("p1", TrtModelId::new(0), Location::new(10.0, 45.0))
//!         .with_rupture(6.0, Occurrence::Poisson { rate: 0.01, time_span: 50.0 });
//!
//!     let logic_tree = LogicTree::new(vec![SourceModel::new(SourceModelId::new(0), "b1", 1.0)
//!         .with_trt_model(
//!             TrtModel::new(TrtModelId::new(0), "Active Shallow Crust")
//!                 .with_source(Arc::new(source))
//!                 .with_gsim(gsim(), 1.0),
//!         )]);
//!
//!     let config = HazardConfig::new(Imtls::new().with("PGA", vec![0.05, 0.1, 0.2]))
//!         .hazard_maps(vec![0.1]);
//!
//!     let mut calc = CalculatorBuilder::new()
//!         .with_config(config)
//!         .with_logic_tree(logic_tree)
//!         .with_sites(SiteCollection::new(vec![Site::new(0, 10.1, 45.0, 760.0)]))
//!         .build()?;
//!
//!     let outputs = calc.run().await?;
//!     println!("{:?}", outputs.mean);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod aggregate;
pub mod bbox;
pub mod calculator;
pub mod compute;
pub mod config;
pub mod curves;
pub mod error;
pub mod gsim;
pub mod logging;
pub mod logic_tree;
pub mod metrics;
pub mod site;
pub mod source;
pub mod stats;
pub mod storage;
pub mod types;

// Re-exports for ergonomic API
pub use aggregate::{Accumulator, CurveReducer};
pub use bbox::{BinEdges, BoundingBox, SphericalBox};
pub use calculator::{
    CalculatorBuilder, ClassicalCalculator, HazardOutputs, LocalExecutor, PreparedCalculation,
    RetryConfig, SourceInfo, TaskExecutor,
};
pub use compute::{compute_curves, CurveTask, PartialResult, TaskParams};
pub use config::HazardConfig;
pub use curves::{compose_poes, expand, HazardCurves};
pub use error::{HazardError, Result};
pub use gsim::{GroundMotionModel, GsimRef};
pub use logic_tree::{LogicTree, Realization, RlzsAssoc, SourceModel, TrtModel};
pub use metrics::HazardMetrics;
pub use site::{Location, Site, SiteCollection, Tile};
pub use source::{IndexedSource, Rupture, SeismicSource, SourceRef};
pub use stats::{compute_hazard_maps, compute_statistics, HazardMaps, HazardStats};
pub use storage::{FileStore, HazardStore, MemoryStore, StoredArray};
pub use types::{CalculationId, CurveKey, GsimId, Imt, Imtls, SiteId, SourceIdx, SourceModelId, TrtModelId};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::calculator::{CalculatorBuilder, ClassicalCalculator, HazardOutputs};
    pub use crate::config::HazardConfig;
    pub use crate::error::Result;
    pub use crate::gsim::{GroundMotionModel, GsimRef};
    pub use crate::logic_tree::{LogicTree, SourceModel, TrtModel};
    pub use crate::site::{Location, Site, SiteCollection};
    pub use crate::types::{Imtls, SourceModelId, TrtModelId};
}
