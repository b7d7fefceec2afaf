//! Statistics over realizations and hazard maps
//!
//! ## Table of Contents
//! - **mean_curve / quantile_curve**: Per-level statistics of a set of curves
//! - **compute_statistics**: Mean and quantile curves per IMT and per site
//! - **compute_hazard_maps**: Levels at which curves cross target POEs
//!
//! Every statistic is computed per site and per IMT level; sites are
//! processed in parallel with rayon.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::curves::HazardCurves;
use crate::error::{HazardError, Result};
use crate::types::Imt;

/// Smallest POE used when taking logarithms
const MIN_POE: f64 = 1e-300;

/// Reject curves of different lengths or a weight count not matching them
fn check_curves(curves: &[&[f64]], weights: Option<&[f64]>) -> Result<()> {
    if let Some(first) = curves.first() {
        if let Some(c) = curves.iter().find(|c| c.len() != first.len()) {
            return Err(HazardError::shape(format!(
                "curves of {} and {} levels",
                first.len(),
                c.len()
            )));
        }
    }
    match weights {
        Some(w) if w.len() != curves.len() => Err(HazardError::shape(format!(
            "{} weights for {} curves",
            w.len(),
            curves.len()
        ))),
        _ => Ok(()),
    }
}

/// Weighted mean of curves of equal length.
///
/// Without weights every curve counts the same; with weights the result is
/// normalized by their sum.
pub fn mean_curve(curves: &[&[f64]], weights: Option<&[f64]>) -> Result<Vec<f64>> {
    check_curves(curves, weights)?;
    let Some(first) = curves.first() else {
        return Ok(Vec::new());
    };
    let mut out = vec![0.0; first.len()];
    let total = match weights {
        Some(w) => {
            for (curve, &weight) in curves.iter().zip(w) {
                for (o, &v) in out.iter_mut().zip(curve.iter()) {
                    *o += weight * v;
                }
            }
            w.iter().sum::<f64>()
        }
        None => {
            for curve in curves {
                for (o, &v) in out.iter_mut().zip(curve.iter()) {
                    *o += v;
                }
            }
            curves.len() as f64
        }
    };
    if total > 0.0 {
        for o in out.iter_mut() {
            *o /= total;
        }
    }
    Ok(out)
}

/// Quantile `q` of curves of equal length, level by level.
///
/// Weighted quantiles interpolate the sorted values against their cumulative
/// weights. Unweighted quantiles use plotting positions with
/// `alpha = beta = 0.4`.
pub fn quantile_curve(curves: &[&[f64]], q: f64, weights: Option<&[f64]>) -> Result<Vec<f64>> {
    check_curves(curves, weights)?;
    let Some(first) = curves.first() else {
        return Ok(Vec::new());
    };
    let out = (0..first.len())
        .map(|level| {
            let values: Vec<f64> = curves.iter().map(|c| c[level]).collect();
            match weights {
                Some(w) => weighted_quantile(&values, w, q),
                None => plotting_position_quantile(values, q),
            }
        })
        .collect();
    Ok(out)
}

fn weighted_quantile(values: &[f64], weights: &[f64], q: f64) -> f64 {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let sorted: Vec<f64> = order.iter().map(|&i| values[i]).collect();
    let cum: Vec<f64> = order
        .iter()
        .scan(0.0, |acc, &i| {
            *acc += weights[i];
            Some(*acc)
        })
        .collect();
    interp(q, &cum, &sorted)
}

fn plotting_position_quantile(mut values: Vec<f64>, q: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n == 1 {
        return values[0];
    }
    let m = 0.4 + q * 0.2;
    let aleph = n as f64 * q + m;
    let k = aleph.clamp(1.0, (n - 1) as f64).floor();
    let gamma = (aleph - k).clamp(0.0, 1.0);
    let k = k as usize;
    (1.0 - gamma) * values[k - 1] + gamma * values[k]
}

/// Piecewise-linear interpolation on increasing `xp`, clamped at both ends
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len().min(fp.len());
    if n == 0 {
        return 0.0;
    }
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    let i = xp[..n].partition_point(|&v| v <= x);
    let (x0, x1, y0, y1) = (xp[i - 1], xp[i], fp[i - 1], fp[i]);
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// Mean and quantile curves
#[derive(Debug, Clone)]
pub struct HazardStats {
    /// Mean curves, if requested
    pub mean: Option<HazardCurves>,
    /// Quantile curves in the requested order
    pub quantiles: Vec<(f64, HazardCurves)>,
}

/// Statistics of the realization curves.
///
/// `weights` is `None` for sampled realizations; otherwise it must hold one
/// weight per realization.
pub fn compute_statistics(
    rlz_curves: &[HazardCurves],
    weights: Option<&[f64]>,
    mean: bool,
    quantiles: &[f64],
) -> Result<HazardStats> {
    let first = rlz_curves
        .first()
        .ok_or_else(|| HazardError::shape("no realization curves"))?;
    if let Some(w) = weights {
        if w.len() != rlz_curves.len() {
            return Err(HazardError::shape(format!(
                "{} weights for {} realizations",
                w.len(),
                rlz_curves.len()
            )));
        }
    }
    if rlz_curves
        .iter()
        .any(|c| c.n_sites() != first.n_sites() || c.imtls() != first.imtls())
    {
        return Err(HazardError::shape("realization curves have different shapes"));
    }

    let stat = |f: &(dyn Fn(&[&[f64]]) -> Result<Vec<f64>> + Sync)| -> Result<HazardCurves> {
        let imtls = Arc::clone(first.imtls());
        let rows: Vec<Vec<f64>> = (0..first.n_sites())
            .into_par_iter()
            .map(|site| -> Result<Vec<f64>> {
                let mut row = vec![0.0; imtls.num_levels()];
                for (_, _, range) in imtls.iter() {
                    let curves: Vec<&[f64]> = rlz_curves
                        .iter()
                        .map(|c| &c.row(site)[range.clone()])
                        .collect();
                    row[range].copy_from_slice(&f(&curves)?);
                }
                Ok(row)
            })
            .collect::<Result<_>>()?;
        HazardCurves::from_data(first.n_sites(), imtls, rows.concat())
    };

    let mean = if mean {
        Some(stat(&|curves| mean_curve(curves, weights))?)
    } else {
        None
    };
    let quantiles = quantiles
        .iter()
        .map(|&q| -> Result<(f64, HazardCurves)> {
            Ok((q, stat(&|curves| quantile_curve(curves, q, weights))?))
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        realizations = rlz_curves.len(),
        quantiles = quantiles.len(),
        "Computed statistics"
    );
    Ok(HazardStats { mean, quantiles })
}

/// Hazard map values per site and `(IMT, poe)` column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardMaps {
    /// Number of sites
    pub n_sites: usize,
    /// Column names, `<IMT>~<poe>`
    pub columns: Vec<String>,
    /// Row-major values, one row per site
    pub data: Vec<f64>,
}

impl HazardMaps {
    /// Column name of an `(IMT, poe)` pair
    pub fn column_name(imt: &Imt, poe: f64) -> String {
        format!("{}~{}", imt, poe)
    }

    /// Value of one site in a column
    pub fn get(&self, site: usize, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.data.get(site * self.columns.len() + col).copied()
    }

    /// All values of one column
    pub fn column(&self, column: &str) -> Option<Vec<f64>> {
        let col = self.columns.iter().position(|c| c == column)?;
        let width = self.columns.len();
        Some((0..self.n_sites).map(|s| self.data[s * width + col]).collect())
    }
}

/// Intensity level at which each curve crosses each target POE.
///
/// Interpolates in log-log space over the curve's levels. A target POE above
/// the curve's first value maps to zero.
pub fn compute_hazard_maps(curves: &HazardCurves, poes: &[f64]) -> Result<HazardMaps> {
    if poes.iter().any(|&p| !(p > 0.0 && p <= 1.0)) {
        return Err(HazardError::config(format!(
            "hazard map POEs must be in (0, 1], got {:?}",
            poes
        )));
    }
    let imtls = curves.imtls();
    let mut columns = Vec::with_capacity(imtls.len() * poes.len());
    for imt in imtls.imts() {
        for &poe in poes {
            columns.push(HazardMaps::column_name(imt, poe));
        }
    }

    let rows: Vec<Vec<f64>> = (0..curves.n_sites())
        .into_par_iter()
        .map(|site| {
            let row = curves.row(site);
            let mut out = Vec::with_capacity(columns.len());
            for (_, levels, range) in imtls.iter() {
                let curve = &row[range];
                let log_levels: Vec<f64> = levels.iter().rev().map(|l| l.ln()).collect();
                let log_poes: Vec<f64> = curve.iter().rev().map(|p| p.max(MIN_POE).ln()).collect();
                for &poe in poes {
                    if curve.is_empty() || poe > curve[0] {
                        out.push(0.0);
                    } else {
                        out.push(interp(poe.ln(), &log_poes, &log_levels).exp());
                    }
                }
            }
            out
        })
        .collect();

    Ok(HazardMaps {
        n_sites: curves.n_sites(),
        columns,
        data: rows.concat(),
    })
}
