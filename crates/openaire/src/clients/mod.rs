//! External collaborators consumed by the pipeline.
//!
//! Each concern sits behind a trait so the orchestrator can be handed real
//! clients in production and fakes in tests. Clients are built once per run
//! and shared as `Arc<dyn Trait>`.

mod archive;
mod bigquery;
mod download;
mod staging;

pub use archive::TarExpander;
pub use bigquery::BigQueryWarehouse;
pub use download::HttpDownloader;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;

use crate::config::WriteMode;
use crate::error::{DownloadError, LoadError, StorageError};

/// Fetches a remote file to local disk.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` to `destination`, returning the bytes written.
    ///
    /// Bytes go to `<destination>.partial` first, which is truncated if a
    /// previous attempt left it behind, and are renamed into place on success.
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64, DownloadError>;
}

/// Expands an archive into a directory.
pub trait ArchiveExpander: Send + Sync {
    /// Extract every member of `archive` under `destination`.
    fn expand(&self, archive: &Path, destination: &Path) -> Result<usize, DownloadError>;
}

/// Object storage used for staging parts before a load.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Base names of the objects directly under `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<BTreeSet<String>, StorageError>;

    /// Upload `local_path` to `remote_name`, returning the bytes sent.
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<u64, StorageError>;
}

/// Source file format of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    NewlineDelimitedJson,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::NewlineDelimitedJson => "NEWLINE_DELIMITED_JSON",
        }
    }
}

impl WriteMode {
    /// Warehouse write disposition for this mode.
    pub fn disposition(&self) -> &'static str {
        match self {
            WriteMode::Replace => "WRITE_TRUNCATE",
            WriteMode::Append => "WRITE_APPEND",
        }
    }
}

/// A bulk load of staged objects into one table.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    /// Object glob, e.g. `gs://bucket/folder/table/*_NR.json.gz`.
    pub uri: String,
    /// `project.dataset.table`
    pub table_id: String,
    /// Column schema as a JSON array of field definitions.
    pub schema: Value,
    pub source_format: SourceFormat,
    pub write_mode: WriteMode,
    pub ignore_unknown_values: bool,
    /// Location the load job runs in.
    pub location: String,
}

/// Result of a finished load job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    pub job_id: String,
    pub output_rows: Option<u64>,
}

/// Bulk-loading data warehouse.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Create the dataset if it does not exist. An existing dataset is fine.
    async fn ensure_dataset(
        &self,
        project_id: &str,
        dataset_id: &str,
        location: &str,
        description: &str,
    ) -> Result<(), LoadError>;

    /// Run a load job to completion. Failures are not retried.
    async fn bulk_load(&self, request: &LoadRequest) -> Result<LoadOutcome, LoadError>;
}
