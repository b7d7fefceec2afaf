//! Error types for hazard calculations
//!
//! ## Table of Contents
//! - **HazardError**: Main error enum covering all failure modes
//! - **Result**: Type alias for `Result<T, HazardError>`
//!
//! Configuration, shape and geometry errors are fatal. Transient and worker
//! errors are retried by the controller before being escalated.

use crate::types::TrtModelId;
use thiserror::Error;

/// Result type alias for hazard operations
pub type Result<T> = std::result::Result<T, HazardError>;

/// Main error type for hazard operations
#[derive(Error, Debug)]
pub enum HazardError {
    /// Invalid configuration or input model (unsplittable source, mixed TRTs in one task)
    #[error("configuration error: {0}")]
    Config(String),

    /// Array size or slice mismatch while expanding or composing curves
    #[error("shape error: {0}")]
    Shape(String),

    /// Invalid geographic envelope
    #[error("geometry error: {0}")]
    Geometry(String),

    /// Retryable failure of a worker (resource exhaustion, lost connection)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Worker crashed while running a task
    #[error("worker error: {0}")]
    Worker(String),

    /// A curve task failed
    #[error("task #{task_no} (trt_model_id={trt_model_id}) failed: {source}")]
    Task {
        /// Ordinal of the failed task
        task_no: usize,
        /// Tectonic region model of the failed task
        trt_model_id: TrtModelId,
        /// Underlying failure
        #[source]
        source: Box<HazardError>,
    },

    /// Transient failures kept occurring after the configured number of retries
    #[error("task #{task_no} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Ordinal of the failed task
        task_no: usize,
        /// Number of attempts made
        attempts: u32,
        /// Last failure
        #[source]
        source: Box<HazardError>,
    },

    /// Output store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Metrics registration or export failure
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration parse error
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Internal error (should not occur in normal operation)
    #[error("internal error: {0}")]
    Internal(String),
}

impl HazardError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape error
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// Create a geometry error
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::Geometry(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a worker error
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a metrics error
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a task failure with its context
    pub fn task(task_no: usize, trt_model_id: TrtModelId, source: HazardError) -> Self {
        Self::Task {
            task_no,
            trt_model_id,
            source: Box::new(source),
        }
    }

    /// Whether resubmitting the identical task may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Worker(_))
    }
}

impl From<prometheus::Error> for HazardError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HazardError::transient("worker lost").is_retryable());
        assert!(HazardError::worker("panicked").is_retryable());
        assert!(!HazardError::config("bad").is_retryable());
        assert!(!HazardError::shape("too large").is_retryable());
    }

    #[test]
    fn test_task_error_names_trt_model() {
        let err = HazardError::task(3, TrtModelId::new(7), HazardError::config("mixed TRTs"));
        let msg = err.to_string();
        assert!(msg.contains("task #3"));
        assert!(msg.contains("trt_model_id=7"));
        assert!(msg.contains("mixed TRTs"));
        assert!(!err.is_retryable());
    }
}
