//! Ground-motion models
//!
//! A ground-motion model is a pure evaluation capability: given a rupture, a
//! site and the levels of one IMT it returns the conditional probability of
//! exceeding each level. Model internals live outside this crate.

use std::fmt;
use std::sync::Arc;

use crate::site::Site;
use crate::source::Rupture;
use crate::types::{GsimId, Imt};

/// Capability of a ground-motion model
pub trait GroundMotionModel: Send + Sync + fmt::Debug {
    /// Canonical id, fixed at configuration time
    fn id(&self) -> &GsimId;

    /// Probability of exceeding each of `levels` for `imt` at `site`, given
    /// that `rupture` occurs. Must not depend on anything but its inputs.
    fn poes(
        &self,
        rupture: &Rupture,
        site: &Site,
        imt: &Imt,
        levels: &[f64],
        truncation_level: Option<f64>,
    ) -> Vec<f64>;
}

/// Shared ground-motion model handle
pub type GsimRef = Arc<dyn GroundMotionModel>;
