//! openaire-core: shared plumbing for the OpenAIRE dump loader.
//!
//! - `storage/` - object storage abstraction (GCS, local filesystem)
//! - `metrics/` - Prometheus metrics events and textfile export
//! - `config/` - YAML loading with environment variable interpolation
//! - `signal` - signal handling for graceful shutdown
//! - `error` - storage, config and metrics error types

pub mod config;
pub mod error;
pub mod metrics;
pub mod signal;
pub mod storage;
pub mod tracing;

pub use crate::config::{MetricsConfig, interpolate, load_yaml, parse_yaml};
pub use crate::error::{ConfigError, MetricsError, StorageError};
pub use crate::metrics::{
    MetricsController, init_global as init_metrics, init_test as init_metrics_test,
};
pub use crate::signal::{cancel_on_signal, shutdown_signal};
pub use crate::storage::{StorageProvider, StorageProviderRef};
pub use crate::tracing::init_tracing;
