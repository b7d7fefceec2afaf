//! Hazard curve arrays and their composition rule
//!
//! ## Table of Contents
//! - **HazardCurves**: Probability-of-exceedance array indexed by (site, IMT, level)
//! - **compose_poes**: Probability-of-no-exceedance product rule
//! - **expand / contract**: Tile bookkeeping between partial and complete site ranges
//!
//! Curves of independent rupture sets combine as `1 - (1 - a)(1 - b)`,
//! evaluated as `a + b - ab` so that composing with zero is exact.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

use crate::error::{HazardError, Result};
use crate::types::{Imt, Imtls};

/// Combine two independent probabilities of exceedance
#[inline(always)]
pub fn compose_poes(a: f64, b: f64) -> f64 {
    a + b - a * b
}

/// Expand a short array to size `n`, placing it at `slice` and zero-filling elsewhere.
///
/// Fails if the array is larger than `n`, or if the slice length does not
/// match the array length.
///
/// ```
/// use hazard_forge::curves::expand;
/// assert_eq!(expand(&[1, 2, 3], 5, 1..4).unwrap(), vec![0, 1, 2, 3, 0]);
/// ```
pub fn expand<T: Copy + Default>(array: &[T], n: usize, slice: Range<usize>) -> Result<Vec<T>> {
    expand_rows(array, 1, n, slice)
}

/// Row-wise [`expand`]: `array` holds `array.len() / width` rows of `width` values
fn expand_rows<T: Copy + Default>(
    array: &[T],
    width: usize,
    n: usize,
    slice: Range<usize>,
) -> Result<Vec<T>> {
    let width = width.max(1);
    let rows = array.len() / width;
    if rows > n {
        return Err(HazardError::shape(format!(
            "The array is too large: {} > {}",
            rows, n
        )));
    }
    if rows == n {
        return Ok(array.to_vec());
    }
    if slice.end < slice.start || slice.end - slice.start != rows {
        return Err(HazardError::shape(format!(
            "The slice has {} places, but the array has length {}",
            slice.end.saturating_sub(slice.start),
            rows
        )));
    }
    if slice.end > n {
        return Err(HazardError::shape(format!(
            "The slice {:?} exceeds the target length {}",
            slice, n
        )));
    }
    let mut out = vec![T::default(); n * width];
    out[slice.start * width..slice.end * width].copy_from_slice(array);
    Ok(out)
}

/// Hazard curves for a set of sites.
///
/// Stored row-major: one row per site, each row the concatenation of the
/// levels of every IMT in [`Imtls`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct HazardCurves {
    imtls: Arc<Imtls>,
    n_sites: usize,
    data: Vec<f64>,
}

impl HazardCurves {
    /// All-zero curves (no exceedance anywhere)
    pub fn zeros(n_sites: usize, imtls: Arc<Imtls>) -> Self {
        let width = imtls.num_levels();
        Self {
            imtls,
            n_sites,
            data: vec![0.0; n_sites * width],
        }
    }

    /// Build from row-major data
    pub fn from_data(n_sites: usize, imtls: Arc<Imtls>, data: Vec<f64>) -> Result<Self> {
        let expected = n_sites * imtls.num_levels();
        if data.len() != expected {
            return Err(HazardError::shape(format!(
                "expected {} values for {} sites, got {}",
                expected,
                n_sites,
                data.len()
            )));
        }
        Ok(Self {
            imtls,
            n_sites,
            data,
        })
    }

    /// Convert probabilities of no exceedance into probabilities of exceedance
    pub(crate) fn from_pnes(n_sites: usize, imtls: Arc<Imtls>, mut pnes: Vec<f64>) -> Self {
        for v in pnes.iter_mut() {
            *v = 1.0 - *v;
        }
        Self {
            imtls,
            n_sites,
            data: pnes,
        }
    }

    /// IMTs and levels of the columns
    pub fn imtls(&self) -> &Arc<Imtls> {
        &self.imtls
    }

    /// Number of sites
    pub fn n_sites(&self) -> usize {
        self.n_sites
    }

    /// Row width (levels over all IMTs)
    pub fn num_levels(&self) -> usize {
        self.imtls.num_levels()
    }

    /// Raw row-major data
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Mutable raw data
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// All levels of one site
    pub fn row(&self, site: usize) -> &[f64] {
        let width = self.num_levels();
        &self.data[site * width..(site + 1) * width]
    }

    /// The curve of one site for one IMT
    pub fn curve(&self, site: usize, imt: &Imt) -> Option<&[f64]> {
        if site >= self.n_sites {
            return None;
        }
        let range = self.imtls.range(imt)?;
        Some(&self.row(site)[range])
    }

    /// Overwrite the curve of one site for one IMT
    pub fn set_curve(&mut self, site: usize, imt: &Imt, values: &[f64]) -> Result<()> {
        let range = self
            .imtls
            .range(imt)
            .ok_or_else(|| HazardError::shape(format!("unknown IMT {}", imt)))?;
        if site >= self.n_sites || values.len() != range.len() {
            return Err(HazardError::shape(format!(
                "cannot set {} values for {} at site {} (levels={}, sites={})",
                values.len(),
                imt,
                site,
                range.len(),
                self.n_sites
            )));
        }
        let start = site * self.num_levels();
        self.data[start + range.start..start + range.end].copy_from_slice(values);
        Ok(())
    }

    /// Sum of all values; zero means no contribution at all
    pub fn total(&self) -> f64 {
        self.data.iter().sum()
    }

    /// True if every value is exactly zero
    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&v| v == 0.0)
    }

    /// Compose `other` into `self` with the probability-of-no-exceedance rule
    pub fn combine(&mut self, other: &HazardCurves) -> Result<()> {
        if self.n_sites != other.n_sites || self.data.len() != other.data.len() {
            return Err(HazardError::shape(format!(
                "cannot combine curves of {} sites x {} levels with {} sites x {} levels",
                self.n_sites,
                self.num_levels(),
                other.n_sites,
                other.num_levels()
            )));
        }
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a = compose_poes(*a, b);
        }
        Ok(())
    }

    /// Composition of two curve sets, leaving both untouched
    pub fn combined(&self, other: &HazardCurves) -> Result<HazardCurves> {
        let mut out = self.clone();
        out.combine(other)?;
        Ok(out)
    }

    /// Expand partial-site curves to `n` sites, zero outside `slice`
    pub fn expand(&self, n: usize, slice: Range<usize>) -> Result<HazardCurves> {
        let data = expand_rows(&self.data, self.num_levels(), n, slice)?;
        Ok(Self {
            imtls: Arc::clone(&self.imtls),
            n_sites: n,
            data,
        })
    }

    /// The sites at `slice`
    pub fn contract(&self, slice: Range<usize>) -> Result<HazardCurves> {
        if slice.end < slice.start || slice.end > self.n_sites {
            return Err(HazardError::shape(format!(
                "slice {:?} out of bounds for {} sites",
                slice, self.n_sites
            )));
        }
        let width = self.num_levels();
        Ok(Self {
            imtls: Arc::clone(&self.imtls),
            n_sites: slice.end - slice.start,
            data: self.data[slice.start * width..slice.end * width].to_vec(),
        })
    }

    /// Largest absolute difference from another curve set of the same shape
    pub fn max_abs_diff(&self, other: &HazardCurves) -> f64 {
        if self.data.len() != other.data.len() {
            return f64::INFINITY;
        }
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// Flatten into a named array for hand-off
    pub fn to_array(&self) -> CurveArray {
        CurveArray {
            n_sites: self.n_sites,
            imtls: (*self.imtls).clone(),
            data: self.data.clone(),
        }
    }
}

/// Serializable form of [`HazardCurves`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveArray {
    /// Number of sites
    pub n_sites: usize,
    /// Column layout
    pub imtls: Imtls,
    /// Row-major values
    pub data: Vec<f64>,
}

impl CurveArray {
    /// Rebuild curves from the serialized form
    pub fn into_curves(self) -> Result<HazardCurves> {
        HazardCurves::from_data(self.n_sites, Arc::new(self.imtls), self.data)
    }
}
