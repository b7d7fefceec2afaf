//! Point sources with an explicit rupture list

use std::sync::Arc;

use crate::site::Location;
use crate::types::TrtModelId;

use super::{Occurrence, Rupture, RuptureSurface, SeismicSource, SourceRef};

/// Surface of a point rupture; distances are epicentral
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSurface {
    /// Epicenter
    pub location: Location,
}

impl RuptureSurface for PointSurface {
    fn distance_to(&self, site: &Location) -> f64 {
        self.location.distance_to(site)
    }

    fn closest_point(&self, _site: &Location) -> Location {
        self.location
    }
}

/// A point source producing one rupture per `(magnitude, occurrence)` entry
#[derive(Debug, Clone)]
pub struct PointSource {
    source_id: String,
    trt_model_id: TrtModelId,
    location: Location,
    hypo_depth: f64,
    rake: f64,
    ruptures: Vec<(f64, Occurrence)>,
}

impl PointSource {
    /// Create a point source without ruptures
    pub fn new(source_id: impl Into<String>, trt_model_id: TrtModelId, location: Location) -> Self {
        Self {
            source_id: source_id.into(),
            trt_model_id,
            location,
            hypo_depth: 10.0,
            rake: 0.0,
            ruptures: Vec::new(),
        }
    }

    /// Add a rupture
    pub fn with_rupture(mut self, mag: f64, occurrence: Occurrence) -> Self {
        self.ruptures.push((mag, occurrence));
        self
    }

    /// Set the hypocentral depth (km)
    pub fn with_depth(mut self, depth: f64) -> Self {
        self.hypo_depth = depth;
        self
    }

    /// Set the rake (degrees)
    pub fn with_rake(mut self, rake: f64) -> Self {
        self.rake = rake;
        self
    }

    /// Epicenter
    pub fn location(&self) -> Location {
        self.location
    }

    fn make_rupture(&self, mag: f64, occurrence: &Occurrence) -> Rupture {
        Rupture {
            mag,
            rake: self.rake,
            hypo_depth: self.hypo_depth,
            occurrence: occurrence.clone(),
            surface: Arc::new(PointSurface {
                location: self.location,
            }),
        }
    }
}

impl SeismicSource for PointSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn trt_model_id(&self) -> TrtModelId {
        self.trt_model_id
    }

    fn weight(&self) -> f64 {
        self.ruptures.len() as f64
    }

    fn ruptures(&self) -> Box<dyn Iterator<Item = Rupture> + '_> {
        Box::new(
            self.ruptures
                .iter()
                .map(move |(mag, occ)| self.make_rupture(*mag, occ)),
        )
    }

    fn min_distance_to(&self, site: &Location) -> f64 {
        self.location.distance_to(site)
    }

    /// One sub-source per rupture
    fn split(&self) -> Vec<SourceRef> {
        if self.ruptures.len() < 2 {
            return Vec::new();
        }
        self.ruptures
            .iter()
            .enumerate()
            .map(|(i, (mag, occ))| {
                let mut sub = PointSource::new(
                    format!("{}:{}", self.source_id, i),
                    self.trt_model_id,
                    self.location,
                )
                .with_depth(self.hypo_depth)
                .with_rake(self.rake);
                sub.ruptures.push((*mag, occ.clone()));
                Arc::new(sub) as SourceRef
            })
            .collect()
    }

    fn kind(&self) -> &str {
        "PointSource"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> PointSource {
        PointSource::new("p1", TrtModelId::new(0), Location::new(10.0, 45.0))
            .with_rupture(5.0, Occurrence::Probability(0.01))
            .with_rupture(6.0, Occurrence::Probability(0.001))
            .with_rupture(7.0, Occurrence::Probability(0.0001))
    }

    #[test]
    fn test_ruptures_restartable() {
        let src = source();
        let first: Vec<f64> = src.ruptures().map(|r| r.mag).collect();
        let second: Vec<f64> = src.ruptures().map(|r| r.mag).collect();
        assert_eq!(first, vec![5.0, 6.0, 7.0]);
        assert_eq!(first, second);
        assert_eq!(src.weight(), 3.0);
    }

    #[test]
    fn test_split_keeps_seismicity() {
        let src = source();
        let parts = src.split();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].source_id(), "p1:1");
        let mags: Vec<f64> = parts.iter().flat_map(|p| p.ruptures().map(|r| r.mag)).collect();
        assert_eq!(mags, vec![5.0, 6.0, 7.0]);
        assert!(parts.iter().all(|p| p.weight() == 1.0));
        assert!(parts[0].split().is_empty());
    }
}
