//! Distance filters
//!
//! The coarse [`SourceSiteFilter`] collapses the site set once per source
//! before the expensive per-rupture check of [`RuptureSiteFilter`] runs. The
//! coarse filter may only keep more sites than the fine one, never fewer.

use crate::site::{FilteredSites, SiteCollection};

use super::{Rupture, SeismicSource};

/// Coarse filter keeping the sites a source may reach within the integration distance
#[derive(Debug, Clone, Copy)]
pub struct SourceSiteFilter {
    max_distance: f64,
}

impl SourceSiteFilter {
    /// Create a filter with the maximum integration distance (km)
    pub fn new(max_distance: f64) -> Self {
        Self { max_distance }
    }

    /// Maximum integration distance (km)
    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    /// Sites within range of the source, or `None` if there are none
    pub fn filter<'a>(
        &self,
        source: &dyn SeismicSource,
        sites: &'a SiteCollection,
    ) -> Option<FilteredSites<'a>> {
        let indices: Vec<usize> = sites
            .iter()
            .enumerate()
            .filter(|(_, site)| source.min_distance_to(&site.location) <= self.max_distance)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            None
        } else {
            Some(FilteredSites::new(sites, indices))
        }
    }
}

/// Fine filter applied to every rupture
#[derive(Debug, Clone, Copy)]
pub struct RuptureSiteFilter {
    max_distance: f64,
}

impl RuptureSiteFilter {
    /// Create a filter with the maximum integration distance (km)
    pub fn new(max_distance: f64) -> Self {
        Self { max_distance }
    }

    /// `(ordinal, distance)` of the candidate sites within range of the rupture
    pub fn filter(&self, rupture: &Rupture, candidates: &FilteredSites<'_>) -> Vec<(usize, f64)> {
        candidates
            .iter()
            .map(|(idx, site)| (idx, rupture.surface.distance_to(&site.location)))
            .filter(|&(_, dist)| dist <= self.max_distance)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::{Location, Site};
    use crate::source::{Occurrence, PointSource};
    use crate::types::TrtModelId;

    fn sites() -> SiteCollection {
        // roughly 0, 111, 222 and 333 km north of the source
        SiteCollection::new(
            (0..4)
                .map(|i| Site::new(i, 0.0, i as f64, 760.0))
                .collect(),
        )
    }

    fn source() -> PointSource {
        PointSource::new("p", TrtModelId::new(0), Location::new(0.0, 0.0))
            .with_rupture(6.0, Occurrence::Probability(0.1))
    }

    #[test]
    fn test_source_filter_drops_far_sites() {
        let sites = sites();
        let filtered = SourceSiteFilter::new(250.0).filter(&source(), &sites).unwrap();
        assert_eq!(filtered.indices(), &[0, 1, 2]);
    }

    #[test]
    fn test_source_filter_none_when_out_of_range() {
        let sites = SiteCollection::new(vec![Site::new(0, 0.0, 10.0, 760.0)]);
        assert!(SourceSiteFilter::new(100.0).filter(&source(), &sites).is_none());
    }

    #[test]
    fn test_coarse_filter_never_drops_what_fine_filter_keeps() {
        let sites = sites();
        let src = source();
        let all = FilteredSites::all(&sites);
        for max_distance in [0.0, 50.0, 120.0, 250.0, 400.0] {
            let coarse = SourceSiteFilter::new(max_distance).filter(&src, &sites);
            let fine_filter = RuptureSiteFilter::new(max_distance);
            for rupture in src.ruptures() {
                let fine: Vec<usize> = fine_filter.filter(&rupture, &all).into_iter().map(|(i, _)| i).collect();
                let kept = coarse.as_ref().map(|c| c.indices().to_vec()).unwrap_or_default();
                assert!(fine.iter().all(|i| kept.contains(i)));
            }
        }
    }
}
