//! Rupture envelopes for disaggregation
//!
//! ## Table of Contents
//! - **BoundingBox**: Distance and lon/lat envelope per (source model, site)
//! - **longitudinal_extent / spherical_bounding_box**: Date-line aware helpers
//! - **BinEdges**: Disaggregation histogram edges derived from a box

use serde::{Deserialize, Serialize};

use crate::error::{HazardError, Result};
use crate::types::{SiteId, SourceModelId};

/// Signed longitudinal distance from `lon1` to `lon2`, in (-180, 180]
pub fn longitudinal_extent(lon1: f64, lon2: f64) -> f64 {
    (lon2 - lon1 + 180.0).rem_euclid(360.0) - 180.0
}

/// West/east/north/south envelope of a point set, crossing the date line if
/// the points lie on both sides of it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalBox {
    /// Westernmost longitude
    pub west: f64,
    /// Easternmost longitude
    pub east: f64,
    /// Northernmost latitude
    pub north: f64,
    /// Southernmost latitude
    pub south: f64,
}

/// Envelope of the given points.
///
/// Fails if the points span more than 180 degrees of longitude, or if a
/// longitude is outside [-180, 180].
pub fn spherical_bounding_box(lons: &[f64], lats: &[f64]) -> Result<SphericalBox> {
    if lons.is_empty() || lats.is_empty() {
        return Err(HazardError::geometry("cannot bound an empty point set"));
    }
    let north = lats.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let south = lats.iter().copied().fold(f64::INFINITY, f64::min);
    let mut west = lons.iter().copied().fold(f64::INFINITY, f64::min);
    let mut east = lons.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
        return Err(HazardError::geometry(format!(
            "longitudes out of range: west={}, east={}",
            west, east
        )));
    }
    if longitudinal_extent(west, east) < 0.0 {
        // points on both sides of the date line: the actual west is the
        // lowest positive longitude and the actual east the highest negative
        west = lons
            .iter()
            .copied()
            .filter(|&l| l > 0.0)
            .fold(f64::INFINITY, f64::min);
        east = lons
            .iter()
            .copied()
            .filter(|&l| l < 0.0)
            .fold(f64::NEG_INFINITY, f64::max);
        let within = lons.iter().all(|&lon| {
            longitudinal_extent(west, lon) >= 0.0 && longitudinal_extent(lon, east) >= 0.0
        });
        if !within {
            return Err(HazardError::geometry(
                "points collection has longitudinal extent wider than 180 deg",
            ));
        }
    }
    Ok(SphericalBox {
        west,
        east,
        north,
        south,
    })
}

/// Envelope of the ruptures of one source model as seen from one site.
///
/// Grows monotonically with every update and stays empty until the first one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Source model
    pub sm_id: SourceModelId,
    /// Site
    pub site_id: SiteId,
    /// `(min, max)` rupture distance
    dist: Option<(f64, f64)>,
    /// Longitude/latitude envelope of the closest points
    coords: Option<SphericalBox>,
}

impl BoundingBox {
    /// An empty box
    pub fn new(sm_id: SourceModelId, site_id: SiteId) -> Self {
        Self {
            sm_id,
            site_id,
            dist: None,
            coords: None,
        }
    }

    /// True until the first update
    pub fn is_empty(&self) -> bool {
        self.dist.is_none() || self.coords.is_none()
    }

    /// Minimum distance seen
    pub fn min_dist(&self) -> Option<f64> {
        self.dist.map(|(min, _)| min)
    }

    /// Maximum distance seen
    pub fn max_dist(&self) -> Option<f64> {
        self.dist.map(|(_, max)| max)
    }

    /// Longitude/latitude envelope
    pub fn coords(&self) -> Option<SphericalBox> {
        self.coords
    }

    /// Enlarge the box with distances and closest-point coordinates
    pub fn update(&mut self, dists: &[f64], lons: &[f64], lats: &[f64]) -> Result<()> {
        if dists.is_empty() {
            return Ok(());
        }
        let mut all_dists = dists.to_vec();
        let mut all_lons = lons.to_vec();
        let mut all_lats = lats.to_vec();
        if let Some((min, max)) = self.dist {
            all_dists.extend([min, max]);
        }
        if let Some(bb) = self.coords {
            all_lons.extend([bb.west, bb.east]);
            all_lats.extend([bb.south, bb.north]);
        }
        let coords = spherical_bounding_box(&all_lons, &all_lats)?;
        let min = all_dists.iter().copied().fold(f64::INFINITY, f64::min);
        let max = all_dists.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        self.dist = Some((min, max));
        self.coords = Some(coords);
        Ok(())
    }

    /// Enlarge the box to cover another one; empty boxes are ignored
    pub fn update_bb(&mut self, other: &BoundingBox) -> Result<()> {
        match (other.dist, other.coords) {
            (Some((min, max)), Some(bb)) => {
                self.update(&[min, max], &[bb.west, bb.east], &[bb.south, bb.north])
            }
            _ => Ok(()),
        }
    }

    /// Disaggregation bin edges for the given bin widths.
    ///
    /// Longitude edges follow the box eastwards from its west side, so they
    /// may wrap across the date line.
    pub fn bins_edges(&self, dist_bin_width: f64, coord_bin_width: f64) -> Result<BinEdges> {
        let ((min_dist, max_dist), bb) = match (self.dist, self.coords) {
            (Some(d), Some(c)) => (d, c),
            _ => {
                return Err(HazardError::geometry(format!(
                    "empty bounding box for {} and site {}",
                    self.sm_id, self.site_id
                )))
            }
        };
        if dist_bin_width <= 0.0 || coord_bin_width <= 0.0 {
            return Err(HazardError::config("bin widths must be positive"));
        }

        let first = (min_dist / dist_bin_width).trunc() as i64;
        let last = (max_dist / dist_bin_width).ceil() as i64 + 1;
        let dist = (first..last).map(|i| i as f64 * dist_bin_width).collect();

        let west = (bb.west / coord_bin_width).floor() * coord_bin_width;
        let east = (bb.east / coord_bin_width).ceil() * coord_bin_width;
        let extent = longitudinal_extent(west, east);
        let n_lons = (extent / coord_bin_width).round() as usize + 1;
        let lon = (0..n_lons)
            .map(|i| {
                let step = if n_lons > 1 {
                    extent * i as f64 / (n_lons - 1) as f64
                } else {
                    0.0
                };
                normalize_lon(west + step)
            })
            .collect();

        let first = (bb.south / coord_bin_width).floor() as i64;
        let last = (bb.north / coord_bin_width).ceil() as i64 + 1;
        let lat = (first..last).map(|i| i as f64 * coord_bin_width).collect();

        Ok(BinEdges { dist, lon, lat })
    }
}

fn normalize_lon(lon: f64) -> f64 {
    if lon > 180.0 {
        lon - 360.0
    } else if lon < -180.0 {
        lon + 360.0
    } else {
        lon
    }
}

/// Disaggregation histogram edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinEdges {
    /// Distance edges (km)
    pub dist: Vec<f64>,
    /// Longitude edges (degrees, west to east)
    pub lon: Vec<f64>,
    /// Latitude edges (degrees)
    pub lat: Vec<f64>,
}
