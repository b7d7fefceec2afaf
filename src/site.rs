//! Sites and site collections
//!
//! ## Table of Contents
//! - **Location**: Geographic point with haversine distance
//! - **Site**: Location plus site-condition parameters
//! - **SiteCollection**: Immutable ordered set of sites
//! - **Tile**: Consecutive chunk of the complete collection with its offset
//! - **FilteredSites**: Subset of a collection selected by distance

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

use crate::types::SiteId;

/// Mean Earth radius in km
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Geographic location (WGS84 degrees)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Longitude
    pub lon: f64,
    /// Latitude
    pub lat: f64,
}

impl Location {
    /// Create a location
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Great-circle distance to another location in km
    pub fn distance_to(&self, other: &Location) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().min(1.0).asin();

        EARTH_RADIUS_KM * c
    }
}

/// A site with its soil conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Stable site id
    pub id: SiteId,
    /// Site location
    pub location: Location,
    /// Average shear-wave velocity in the top 30 m (m/s)
    pub vs30: f64,
    /// Whether vs30 was measured or inferred
    #[serde(default)]
    pub vs30_measured: bool,
    /// Depth to the 1.0 km/s shear-wave velocity horizon (m)
    #[serde(default)]
    pub z1pt0: Option<f64>,
    /// Depth to the 2.5 km/s shear-wave velocity horizon (km)
    #[serde(default)]
    pub z2pt5: Option<f64>,
}

impl Site {
    /// Create a site with inferred vs30 and no basin depths
    pub fn new(id: u32, lon: f64, lat: f64, vs30: f64) -> Self {
        Self {
            id: SiteId::new(id),
            location: Location::new(lon, lat),
            vs30,
            vs30_measured: false,
            z1pt0: None,
            z2pt5: None,
        }
    }

    /// Set basin depth terms
    pub fn with_basin_depths(mut self, z1pt0: f64, z2pt5: f64) -> Self {
        self.z1pt0 = Some(z1pt0);
        self.z2pt5 = Some(z2pt5);
        self
    }

    /// Mark vs30 as measured
    pub fn measured(mut self) -> Self {
        self.vs30_measured = true;
        self
    }
}

/// Immutable ordered collection of sites
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteCollection {
    sites: Vec<Site>,
}

impl SiteCollection {
    /// Create a collection; site order is the ordinal order of every curve array
    pub fn new(sites: Vec<Site>) -> Self {
        Self { sites }
    }

    /// Number of sites
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// True if there are no sites
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Site at an ordinal
    pub fn get(&self, idx: usize) -> Option<&Site> {
        self.sites.get(idx)
    }

    /// Iterate sites in ordinal order
    pub fn iter(&self) -> std::slice::Iter<'_, Site> {
        self.sites.iter()
    }

    /// Site ids in ordinal order
    pub fn sids(&self) -> Vec<SiteId> {
        self.sites.iter().map(|s| s.id).collect()
    }

    /// Consecutive sub-collection
    pub fn slice(&self, range: Range<usize>) -> SiteCollection {
        let end = range.end.min(self.sites.len());
        let start = range.start.min(end);
        Self::new(self.sites[start..end].to_vec())
    }

    /// Cut the collection into tiles of at most `sites_per_tile` sites.
    ///
    /// A collection not larger than `sites_per_tile` yields one tile covering
    /// everything.
    pub fn tiles(&self, sites_per_tile: usize) -> Vec<Tile> {
        let per_tile = sites_per_tile.max(1);
        if self.sites.len() <= per_tile {
            return vec![Tile {
                offset: 0,
                sites: Arc::new(self.clone()),
            }];
        }
        (0..self.sites.len())
            .step_by(per_tile)
            .map(|offset| Tile {
                offset,
                sites: Arc::new(self.slice(offset..offset + per_tile)),
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a SiteCollection {
    type Item = &'a Site;
    type IntoIter = std::slice::Iter<'a, Site>;

    fn into_iter(self) -> Self::IntoIter {
        self.sites.iter()
    }
}

/// A consecutive chunk of the complete site collection
#[derive(Debug, Clone)]
pub struct Tile {
    /// Ordinal of the first site in the complete collection
    pub offset: usize,
    /// Sites of this tile
    pub sites: Arc<SiteCollection>,
}

impl Tile {
    /// Ordinals covered by this tile in the complete collection
    pub fn site_slice(&self) -> Range<usize> {
        self.offset..self.offset + self.sites.len()
    }
}

/// Subset of a site collection, addressed by ordinal in the parent
#[derive(Debug, Clone)]
pub struct FilteredSites<'a> {
    parent: &'a SiteCollection,
    indices: Vec<usize>,
}

impl<'a> FilteredSites<'a> {
    /// Select the given ordinals of `parent`
    pub fn new(parent: &'a SiteCollection, indices: Vec<usize>) -> Self {
        Self { parent, indices }
    }

    /// Every site of `parent`
    pub fn all(parent: &'a SiteCollection) -> Self {
        Self::new(parent, (0..parent.len()).collect())
    }

    /// Number of selected sites
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True if no site is selected
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Ordinals in the parent collection
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Iterate `(ordinal in parent, site)`
    pub fn iter(&self) -> impl Iterator<Item = (usize, &'a Site)> + '_ {
        let parent = self.parent;
        self.indices
            .iter()
            .filter_map(move |&idx| parent.get(idx).map(|site| (idx, site)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_of_sites(n: u32) -> SiteCollection {
        SiteCollection::new((0..n).map(|i| Site::new(i, i as f64 * 0.1, 45.0, 760.0)).collect())
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        let a = Location::new(10.0, 45.0);
        let b = Location::new(10.0, 46.0);
        let d = a.distance_to(&b);
        assert!((d - 111.19).abs() < 0.1, "got {}", d);
        assert_eq!(a.distance_to(&a), 0.0);
    }

    #[test]
    fn test_single_tile_when_small() {
        let sites = line_of_sites(5);
        let tiles = sites.tiles(10);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].site_slice(), 0..5);
    }

    #[test]
    fn test_tiles_preserve_offsets() {
        let sites = line_of_sites(7);
        let tiles = sites.tiles(3);
        let slices: Vec<_> = tiles.iter().map(Tile::site_slice).collect();
        assert_eq!(slices, vec![0..3, 3..6, 6..7]);
        assert_eq!(tiles[2].sites.get(0).map(|s| s.id), Some(SiteId::new(6)));
    }

    #[test]
    fn test_filtered_sites_iter() {
        let sites = line_of_sites(4);
        let filtered = FilteredSites::new(&sites, vec![1, 3]);
        let ids: Vec<_> = filtered.iter().map(|(i, s)| (i, s.id.as_u32())).collect();
        assert_eq!(ids, vec![(1, 1), (3, 3)]);
    }
}
