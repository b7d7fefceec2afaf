//! Output hand-off for hazard results
//!
//! ## Table of Contents
//! - **HazardStore**: Trait for output storage backends
//! - **MemoryStore**: In-memory store (default)
//! - **FileStore**: File-based persistent storage
//! - **StoredArray**: Named array with attributes, the unit of hand-off
//! - **keys**: Output key builders

use crate::error::{HazardError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock as SyncRwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Trait for output storage backends
#[async_trait]
pub trait HazardStore: Send + Sync {
    /// Get a value by key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys with a prefix
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Make every write durable
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Store name for logging
    fn name(&self) -> &str;
}

/// Get and deserialize JSON from the store
pub async fn store_get_json<T: DeserializeOwned>(store: &dyn HazardStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize and set JSON in the store
pub async fn store_set_json<T: Serialize>(store: &dyn HazardStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}

/// A named array handed off to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArray {
    /// Output name, e.g. `hcurves/mean`
    pub name: String,
    /// Dimensions, outermost first
    pub shape: Vec<usize>,
    /// Names of the innermost columns
    pub columns: Vec<String>,
    /// Row-major values
    pub data: Vec<f64>,
    /// Free-form attributes (`uid`, `trt`, `gsim`, `poes`, ...)
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl StoredArray {
    /// Create an array without attributes
    pub fn new(name: impl Into<String>, shape: Vec<usize>, columns: Vec<String>, data: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            shape,
            columns,
            data,
            attrs: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Add an attribute
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Size of the data in bytes
    pub fn nbytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }

    /// Write the array under its own name
    pub async fn save(&self, store: &dyn HazardStore) -> Result<()> {
        store_set_json(store, &self.name, self).await
    }

    /// Read an array back
    pub async fn load(store: &dyn HazardStore, name: &str) -> Result<Option<StoredArray>> {
        store_get_json(store, name).await
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: SyncRwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create a new memory store
    pub fn new() -> Self {
        Self {
            data: SyncRwLock::new(HashMap::new()),
        }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl HazardStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// File-based persistent storage
///
/// One JSON document holding every output of a calculation.
pub struct FileStore {
    path: PathBuf,
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl FileStore {
    /// Open or create a file store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| HazardError::storage(format!("Failed to read store: {}", e)))?;
            serde_json::from_str(&contents)
                .map_err(|e| HazardError::storage(format!("Corrupt store {}: {}", path.display(), e)))?
        } else {
            HashMap::new()
        };

        info!(path = %path.display(), "File store opened");

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }
}

#[async_trait]
impl HazardStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read().await;
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush(&self) -> Result<()> {
        let data = self.data.read().await;
        let contents = serde_json::to_string(&*data)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HazardError::storage(format!("Failed to create dir: {}", e)))?;
        }

        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|e| HazardError::storage(format!("Failed to write store: {}", e)))?;

        debug!(path = %self.path.display(), keys = data.len(), "File store flushed");
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Type alias for a shared store
pub type SharedStore = Arc<dyn HazardStore>;

/// Create a memory store
pub fn memory_store() -> SharedStore {
    Arc::new(MemoryStore::new()) as SharedStore
}

/// Output names
pub mod keys {
    /// Hazard curves prefix
    pub const HCURVES: &str = "hcurves";
    /// Hazard maps prefix
    pub const HMAPS: &str = "hmaps";
    /// Curves by source model prefix
    pub const CURVES_BY_SM: &str = "curves_by_sm";
    /// Disaggregation bin edges prefix
    pub const BIN_EDGES: &str = "bin_edges";
    /// Source info table
    pub const SOURCE_INFO: &str = "source_info";
    /// Realization table
    pub const REALIZATIONS: &str = "realizations";

    /// Kind of a realization output, e.g. `rlz-003`
    pub fn rlz_kind(ordinal: usize) -> String {
        format!("rlz-{:03}", ordinal)
    }

    /// Kind of a quantile output, e.g. `quantile-0.15`
    pub fn quantile_kind(q: f64) -> String {
        format!("quantile-{}", q)
    }

    /// Build a hazard curves key
    pub fn hcurves(kind: &str) -> String {
        format!("{}/{}", HCURVES, kind)
    }

    /// Build a hazard maps key
    pub fn hmaps(kind: &str) -> String {
        format!("{}/{}", HMAPS, kind)
    }

    /// Build a curves-by-source-model key, e.g. `curves_by_sm/b1/001-0`
    pub fn curves_by_sm(sm_path: &str, trt_model_id: u32, gsim_index: usize) -> String {
        format!("{}/{}/{:03}-{}", CURVES_BY_SM, sm_path, trt_model_id, gsim_index)
    }

    /// Build a bin edges key for a `(source model, site)` pair
    pub fn bin_edges(sm_id: u32, site_id: u32) -> String {
        format!("{}/sm-{}/site-{}", BIN_EDGES, sm_id, site_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();

        store.set("key1", b"value1".to_vec()).await.unwrap();
        let value = store.get("key1").await.unwrap();
        assert_eq!(value, Some(b"value1".to_vec()));

        store.delete("key1").await.unwrap();
        assert!(store.get("key1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_prefix() {
        let store = MemoryStore::new();

        store.set("hcurves/rlz-001", b"1".to_vec()).await.unwrap();
        store.set("hcurves/rlz-000", b"2".to_vec()).await.unwrap();
        store.set("hmaps/mean", b"3".to_vec()).await.unwrap();

        let keys = store.list_prefix("hcurves/").await.unwrap();
        assert_eq!(keys, vec!["hcurves/rlz-000", "hcurves/rlz-001"]);
    }

    #[test]
    fn test_stored_array_round_trip() {
        let store = MemoryStore::new();
        let array = StoredArray::new("hcurves/mean", vec![1, 2], vec!["PGA".into()], vec![0.1, 0.01])
            .with_attr("uid", "b1~A");
        tokio_test::block_on(array.save(&store)).unwrap();
        let loaded = tokio_test::block_on(StoredArray::load(&store, "hcurves/mean"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, array);
        assert_eq!(loaded.nbytes(), 16);
    }

    #[tokio::test]
    async fn test_stored_array_keeps_every_bit() {
        let store = MemoryStore::new();
        let data = vec![
            0.022734583460298254,
            1.0 - (-0.1f64).exp(),
            f64::MIN_POSITIVE,
            0.1 + 0.2,
            1.0 / 3.0,
        ];
        StoredArray::new("hcurves/mean", vec![1, 5], Vec::new(), data.clone())
            .save(&store)
            .await
            .unwrap();
        let loaded = StoredArray::load(&store, "hcurves/mean").await.unwrap().unwrap();
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&loaded.data), bits(&data));
    }

    #[tokio::test]
    async fn test_file_store_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("calc.json");

        let store = FileStore::open(&path).unwrap();
        store_set_json(&store, keys::SOURCE_INFO, &vec![1, 2, 3]).await.unwrap();
        store.flush().await.unwrap();

        let reopened = FileStore::open(&path).unwrap();
        let loaded: Option<Vec<i32>> = store_get_json(&reopened, keys::SOURCE_INFO).await.unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_key_builders() {
        assert_eq!(keys::hcurves(&keys::rlz_kind(3)), "hcurves/rlz-003");
        assert_eq!(keys::hmaps(&keys::quantile_kind(0.15)), "hmaps/quantile-0.15");
        assert_eq!(keys::curves_by_sm("b1", 1, 0), "curves_by_sm/b1/001-0");
        assert_eq!(keys::bin_edges(0, 7), "bin_edges/sm-0/site-7");
    }
}
