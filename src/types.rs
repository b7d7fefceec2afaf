//! Core identifiers and intensity measure types
//!
//! ## Table of Contents
//! - **SiteId / TrtModelId / SourceModelId / SourceIdx**: Stable integer ids
//! - **GsimId**: Canonical ground-motion model identifier
//! - **CurveKey**: Independent curve key `(trt_model_id, gsim)`
//! - **CalculationId**: Unique id of one calculation run
//! - **Imt / Imtls**: Intensity measure types and their levels

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use uuid::Uuid;

/// Stable site identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(u32);

impl SiteId {
    /// Create a SiteId
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tectonic region model identifier (one TRT inside one source model)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrtModelId(u32);

impl TrtModelId {
    /// Create a TrtModelId
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TrtModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source model (logic-tree branch) ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceModelId(u32);

impl SourceModelId {
    /// Create a SourceModelId
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SourceModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm-{}", self.0)
    }
}

/// Index of a source in the composite source model, before splitting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceIdx(usize);

impl SourceIdx {
    /// Create a SourceIdx
    pub fn new(idx: usize) -> Self {
        Self(idx)
    }

    /// Get the inner value
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Canonical identifier of a ground-motion model.
///
/// Built from the model name and its sorted parameters, e.g.
/// `Campbell2003(sigma_mu_epsilon=1.0)`. Two instances with the same name
/// and parameters share an id; differently-parameterised instances never do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GsimId(String);

impl GsimId {
    /// Id of a model without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Id of a parameterised model; parameters are sorted by key
    pub fn with_params<K, V>(name: &str, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: fmt::Display,
    {
        let sorted: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();
        if sorted.is_empty() {
            return Self::new(name);
        }
        let args: Vec<String> = sorted.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Self(format!("{}({})", name, args.join(",")))
    }

    /// Canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GsimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of an independent hazard curve set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CurveKey {
    /// Tectonic region model
    pub trt_model_id: TrtModelId,
    /// Ground-motion model
    pub gsim: GsimId,
}

impl CurveKey {
    /// Create a curve key
    pub fn new(trt_model_id: TrtModelId, gsim: GsimId) -> Self {
        Self { trt_model_id, gsim }
    }
}

impl fmt::Display for CurveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.trt_model_id, self.gsim)
    }
}

/// Unique identifier of a calculation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalculationId(Uuid);

impl CalculationId {
    /// Create a new random CalculationId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CalculationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CalculationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "calc-{}", &self.0.to_string()[..8])
    }
}

/// Intensity measure type, e.g. `PGA` or `SA(0.2)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Imt(String);

impl Imt {
    /// Create an IMT
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// IMT name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Imt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Imt {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Intensity measure types and levels.
///
/// IMTs are kept sorted by name; a hazard curve row for one site is the
/// concatenation of the levels of every IMT in this order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Imtls(BTreeMap<Imt, Vec<f64>>);

impl Imtls {
    /// Create an empty set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add an IMT with its levels
    pub fn with(mut self, imt: impl Into<Imt>, levels: Vec<f64>) -> Self {
        self.0.insert(imt.into(), levels);
        self
    }

    /// Number of IMTs
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no IMTs
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of levels over all IMTs
    pub fn num_levels(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Levels of one IMT
    pub fn levels(&self, imt: &Imt) -> Option<&[f64]> {
        self.0.get(imt).map(Vec::as_slice)
    }

    /// IMTs in row order
    pub fn imts(&self) -> impl Iterator<Item = &Imt> {
        self.0.keys()
    }

    /// Iterate `(imt, levels, column range)` in row order
    pub fn iter(&self) -> impl Iterator<Item = (&Imt, &[f64], Range<usize>)> {
        let mut offset = 0;
        self.0.iter().map(move |(imt, levels)| {
            let range = offset..offset + levels.len();
            offset += levels.len();
            (imt, levels.as_slice(), range)
        })
    }

    /// Column range of one IMT inside a site row
    pub fn range(&self, imt: &Imt) -> Option<Range<usize>> {
        self.iter()
            .find(|(candidate, _, _)| *candidate == imt)
            .map(|(_, _, range)| range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gsim_id_sorts_params() {
        let a = GsimId::with_params("Campbell2003", [("b", 2.0), ("a", 1.5)]);
        let b = GsimId::with_params("Campbell2003", [("a", 1.5), ("b", 2.0)]);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "Campbell2003(a=1.5,b=2)");
    }

    #[test]
    fn test_gsim_id_without_params() {
        let id = GsimId::with_params("BooreAtkinson2008", Vec::<(String, f64)>::new());
        assert_eq!(id, GsimId::new("BooreAtkinson2008"));
    }

    #[test]
    fn test_imtls_ranges() {
        let imtls = Imtls::new()
            .with("SA(0.2)", vec![0.1, 0.2])
            .with("PGA", vec![0.01, 0.02, 0.04]);

        assert_eq!(imtls.num_levels(), 5);
        // sorted by name: PGA first
        assert_eq!(imtls.range(&Imt::new("PGA")), Some(0..3));
        assert_eq!(imtls.range(&Imt::new("SA(0.2)")), Some(3..5));
        assert!(imtls.range(&Imt::new("PGV")).is_none());
    }

    #[test]
    fn test_display_ids() {
        assert_eq!(SourceModelId::new(2).to_string(), "sm-2");
        let key = CurveKey::new(TrtModelId::new(1), GsimId::new("AkB2010"));
        assert_eq!(key.to_string(), "(1, AkB2010)");
    }
}
