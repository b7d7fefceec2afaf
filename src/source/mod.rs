//! Seismic sources and ruptures
//!
//! Rupture enumeration is delegated to the source itself: a source is a
//! restartable producer of [`Rupture`] records, so a retried task simply
//! enumerates again.

pub mod filter;
pub mod point;
pub mod split;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::site::Location;
use crate::types::{SourceIdx, TrtModelId};

pub use filter::{RuptureSiteFilter, SourceSiteFilter};
pub use point::{PointSource, PointSurface};
pub use split::{block_splitter, split_sources, SourceBlock, SplitCache};

/// Temporal occurrence model of a rupture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Occurrence {
    /// Poissonian occurrence with an annual rate over a time span (years)
    Poisson {
        /// Annual occurrence rate
        rate: f64,
        /// Investigation time span in years
        time_span: f64,
    },
    /// Fixed probability of occurring once in the time span
    Probability(f64),
    /// Probability mass function over the number of occurrences: `(P(k), k)`
    NonParametric(Vec<(f64, u32)>),
}

impl Occurrence {
    /// Probability that the rupture does not cause an exceedance, given the
    /// conditional probability of exceedance `poe` of a single occurrence
    pub fn probability_no_exceedance(&self, poe: f64) -> f64 {
        match self {
            Self::Poisson { rate, time_span } => (-rate * time_span * poe).exp(),
            Self::Probability(p) => 1.0 - p * poe,
            Self::NonParametric(pmf) => pmf
                .iter()
                .map(|&(p, k)| p * (1.0 - poe).powi(k as i32))
                .sum(),
        }
    }
}

/// Rupture geometry, only used for distances
pub trait RuptureSurface: Send + Sync + fmt::Debug {
    /// Joyner-Boore distance to a site (km)
    fn distance_to(&self, site: &Location) -> f64;

    /// Point of the surface projection closest to a site
    fn closest_point(&self, site: &Location) -> Location;
}

/// A rupture produced while enumerating a source
#[derive(Debug, Clone)]
pub struct Rupture {
    /// Moment magnitude
    pub mag: f64,
    /// Rake angle (degrees)
    pub rake: f64,
    /// Hypocentral depth (km)
    pub hypo_depth: f64,
    /// Occurrence model
    pub occurrence: Occurrence,
    /// Geometry used for distance filtering
    pub surface: Arc<dyn RuptureSurface>,
}

impl Rupture {
    /// Probability of no exceedance for each POE
    pub fn probability_no_exceedance(&self, poes: &[f64]) -> Vec<f64> {
        poes.iter()
            .map(|&poe| self.occurrence.probability_no_exceedance(poe))
            .collect()
    }
}

/// Capability of a seismic source
pub trait SeismicSource: Send + Sync + fmt::Debug {
    /// Source id, unique inside its TRT model
    fn source_id(&self) -> &str;

    /// Tectonic region model the source belongs to
    fn trt_model_id(&self) -> TrtModelId;

    /// Computational cost proxy
    fn weight(&self) -> f64;

    /// Enumerate the ruptures; every call restarts from the first one
    fn ruptures(&self) -> Box<dyn Iterator<Item = Rupture> + '_>;

    /// Lower bound of the distance from any rupture of this source to `site` (km).
    ///
    /// Used by the coarse site filter, which must never drop a site a
    /// rupture-level check would keep.
    fn min_distance_to(&self, site: &Location) -> f64;

    /// Split into lighter sub-sources carrying the same seismicity.
    ///
    /// An empty result means the source cannot be split.
    fn split(&self) -> Vec<SourceRef> {
        Vec::new()
    }

    /// Source typology, for reporting
    fn kind(&self) -> &str {
        "Source"
    }
}

/// Shared source handle
pub type SourceRef = Arc<dyn SeismicSource>;

/// A source with its index in the composite source model.
///
/// Sub-sources produced by splitting keep the index of their parent so that
/// calculation times are attributed to the original source.
#[derive(Debug, Clone)]
pub struct IndexedSource {
    /// Index of the original source
    pub idx: SourceIdx,
    /// The (possibly split) source
    pub source: SourceRef,
}

impl IndexedSource {
    /// Create an indexed source
    pub fn new(idx: usize, source: SourceRef) -> Self {
        Self {
            idx: SourceIdx::new(idx),
            source,
        }
    }

    /// Index a list of sources in order
    pub fn index_all(sources: Vec<SourceRef>) -> Vec<IndexedSource> {
        sources
            .into_iter()
            .enumerate()
            .map(|(i, source)| Self::new(i, source))
            .collect()
    }
}
