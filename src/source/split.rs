//! Source weighting: splitting heavy sources and grouping sources into task blocks

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::error::{HazardError, Result};
use crate::types::TrtModelId;

use super::{IndexedSource, SourceRef};

/// Memo of already-split sources, keyed by `(trt_model_id, source_id)`.
///
/// Owned by the controller for the lifetime of one calculation and filled
/// before any task is dispatched.
#[derive(Debug, Default)]
pub struct SplitCache {
    splits: HashMap<(TrtModelId, String), Vec<SourceRef>>,
}

impl SplitCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached splits
    pub fn len(&self) -> usize {
        self.splits.len()
    }

    /// True if nothing has been split yet
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// Whether a source has already been split
    pub fn contains(&self, trt_model_id: TrtModelId, source_id: &str) -> bool {
        self.splits
            .contains_key(&(trt_model_id, source_id.to_string()))
    }

    /// The cached fragments of a source
    pub fn get(&self, trt_model_id: TrtModelId, source_id: &str) -> Option<&[SourceRef]> {
        self.splits
            .get(&(trt_model_id, source_id.to_string()))
            .map(Vec::as_slice)
    }
}

/// Split the sources heavier than `max_weight`.
///
/// Lighter sources pass through unchanged and the input order is preserved;
/// fragments replace their parent in place and inherit its index. A source
/// that cannot be brought under the threshold is a configuration error.
pub fn split_sources(
    sources: &[IndexedSource],
    max_weight: f64,
    cache: &mut SplitCache,
) -> Result<Vec<IndexedSource>> {
    let mut out = Vec::with_capacity(sources.len());
    for src in sources {
        if src.source.weight() <= max_weight {
            out.push(src.clone());
            continue;
        }
        let key = (src.source.trt_model_id(), src.source.source_id().to_string());
        let fragments = match cache.splits.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                info!(
                    source = %key.1,
                    trt_model_id = %key.0,
                    weight = src.source.weight(),
                    max_weight,
                    "Splitting source of weight > max"
                );
                let fragments = split_below(&src.source, max_weight)?;
                cache.splits.insert(key, fragments.clone());
                fragments
            }
        };
        out.extend(fragments.into_iter().map(|source| IndexedSource {
            idx: src.idx,
            source,
        }));
    }
    Ok(out)
}

fn split_below(source: &SourceRef, max_weight: f64) -> Result<Vec<SourceRef>> {
    let parts = source.split();
    if parts.is_empty() {
        return Err(HazardError::config(format!(
            "source {} (trt_model_id={}) of weight {} cannot be split below {}",
            source.source_id(),
            source.trt_model_id(),
            source.weight(),
            max_weight
        )));
    }
    let mut fragments = Vec::with_capacity(parts.len());
    for part in parts {
        // every fragment must be strictly lighter than its parent
        if part.weight() >= source.weight() {
            return Err(HazardError::config(format!(
                "source {} (trt_model_id={}) of weight {} split into fragment {} of weight {}",
                source.source_id(),
                source.trt_model_id(),
                source.weight(),
                part.source_id(),
                part.weight()
            )));
        }
        if part.weight() > max_weight {
            fragments.extend(split_below(&part, max_weight)?);
        } else {
            fragments.push(part);
        }
    }
    Ok(fragments)
}

/// A block of sources of one TRT model, computed by one task
#[derive(Debug, Clone)]
pub struct SourceBlock {
    /// Shared TRT model of every source in the block
    pub trt_model_id: TrtModelId,
    /// Sources of the block
    pub sources: Vec<IndexedSource>,
    /// Total weight of the block
    pub weight: f64,
}

/// Group sources by TRT model and chunk each group into blocks of weight at
/// most `max_weight` (a single heavier source forms its own block)
pub fn block_splitter(sources: Vec<IndexedSource>, max_weight: f64) -> Vec<SourceBlock> {
    let mut by_trt: BTreeMap<TrtModelId, Vec<IndexedSource>> = BTreeMap::new();
    for src in sources {
        by_trt.entry(src.source.trt_model_id()).or_default().push(src);
    }

    let mut blocks = Vec::new();
    for (trt_model_id, group) in by_trt {
        let mut current = SourceBlock {
            trt_model_id,
            sources: Vec::new(),
            weight: 0.0,
        };
        for src in group {
            let w = src.source.weight();
            if !current.sources.is_empty() && current.weight + w > max_weight {
                let full = std::mem::replace(
                    &mut current,
                    SourceBlock {
                        trt_model_id,
                        sources: Vec::new(),
                        weight: 0.0,
                    },
                );
                blocks.push(full);
            }
            current.weight += w;
            current.sources.push(src);
        }
        if !current.sources.is_empty() {
            blocks.push(current);
        }
    }
    debug!(blocks = blocks.len(), max_weight, "Built source blocks");
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::Location;
    use crate::source::{Occurrence, PointSource, Rupture, SeismicSource};
    use std::sync::Arc;

    fn point(id: &str, trt: u32, n_ruptures: usize) -> SourceRef {
        let mut src = PointSource::new(id, TrtModelId::new(trt), Location::new(0.0, 0.0));
        for i in 0..n_ruptures {
            src = src.with_rupture(5.0 + i as f64 * 0.1, Occurrence::Probability(0.01));
        }
        Arc::new(src)
    }

    #[test]
    fn test_light_sources_pass_through() {
        let sources = IndexedSource::index_all(vec![point("a", 0, 2), point("b", 0, 1)]);
        let mut cache = SplitCache::new();
        let out = split_sources(&sources, 2.0, &mut cache).unwrap();
        let ids: Vec<_> = out.iter().map(|s| s.source.source_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_heavy_source_split_in_place() {
        let sources = IndexedSource::index_all(vec![point("a", 0, 1), point("b", 0, 3), point("c", 0, 1)]);
        let mut cache = SplitCache::new();
        let out = split_sources(&sources, 1.0, &mut cache).unwrap();
        let ids: Vec<_> = out.iter().map(|s| s.source.source_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b:0", "b:1", "b:2", "c"]);
        assert!(out[1..4].iter().all(|s| s.idx.as_usize() == 1));
        assert!(cache.contains(TrtModelId::new(0), "b"));
    }

    #[test]
    fn test_split_is_idempotent_with_cache() {
        let sources = IndexedSource::index_all(vec![point("a", 0, 4), point("b", 1, 3)]);
        let mut cache = SplitCache::new();
        let first = split_sources(&sources, 1.0, &mut cache).unwrap();
        let cached = cache.len();
        let second = split_sources(&sources, 1.0, &mut cache).unwrap();

        assert_eq!(cache.len(), cached);
        assert_eq!(first.len(), second.len());
        for (x, y) in first.iter().zip(second.iter()) {
            // same fragment objects, not a re-split
            assert!(Arc::ptr_eq(&x.source, &y.source));
        }
    }

    #[test]
    fn test_unsplittable_source_is_config_error() {
        let sources = IndexedSource::index_all(vec![point("single", 0, 1)]);
        let mut cache = SplitCache::new();
        let err = split_sources(&sources, 0.5, &mut cache).unwrap_err();
        assert!(matches!(err, HazardError::Config(_)));
        assert!(err.to_string().contains("single"));
    }

    /// Splits into a copy of itself
    #[derive(Debug)]
    struct SelfSplitting;

    impl SeismicSource for SelfSplitting {
        fn source_id(&self) -> &str {
            "self-splitting"
        }

        fn trt_model_id(&self) -> TrtModelId {
            TrtModelId::new(3)
        }

        fn weight(&self) -> f64 {
            10.0
        }

        fn ruptures(&self) -> Box<dyn Iterator<Item = Rupture> + '_> {
            Box::new(std::iter::empty())
        }

        fn min_distance_to(&self, _: &Location) -> f64 {
            0.0
        }

        fn split(&self) -> Vec<SourceRef> {
            vec![Arc::new(SelfSplitting)]
        }
    }

    #[test]
    fn test_split_without_progress_is_config_error() {
        let sources = IndexedSource::index_all(vec![Arc::new(SelfSplitting) as SourceRef]);
        let mut cache = SplitCache::new();
        let err = split_sources(&sources, 1.0, &mut cache).unwrap_err();
        assert!(matches!(err, HazardError::Config(_)));
        let msg = err.to_string();
        assert!(msg.contains("self-splitting"));
        assert!(msg.contains("trt_model_id=3"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_block_splitter_groups_by_trt() {
        let sources = IndexedSource::index_all(vec![
            point("a", 1, 2),
            point("b", 0, 2),
            point("c", 1, 2),
            point("d", 1, 5),
        ]);
        let blocks = block_splitter(sources, 4.0);
        let shape: Vec<(u32, Vec<String>)> = blocks
            .iter()
            .map(|b| {
                (
                    b.trt_model_id.as_u32(),
                    b.sources.iter().map(|s| s.source.source_id().to_string()).collect(),
                )
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                (0, vec!["b".to_string()]),
                (1, vec!["a".to_string(), "c".to_string()]),
                (1, vec!["d".to_string()]),
            ]
        );
        assert_eq!(blocks[2].weight, 5.0);
    }
}
