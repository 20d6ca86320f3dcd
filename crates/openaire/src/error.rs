//! Error types for the OpenAIRE loader.

use std::path::PathBuf;

use snafu::prelude::*;

pub use openaire_core::error::{ConfigError, MetricsError, StorageError};

/// Errors raised while sanitizing a single part.
///
/// Every variant is fatal for that part only; the temp output is removed and
/// the final output never appears.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// Input part could not be opened.
    #[snafu(display("Failed to open input part {}: {source}", path.display()))]
    OpenInput {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Temp output could not be created.
    #[snafu(display("Failed to create output {}: {source}", path.display()))]
    CreateOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Reading or decompressing the input failed.
    #[snafu(display("Failed to read {} at line {line}: {source}", path.display()))]
    ReadLine {
        path: PathBuf,
        line: usize,
        source: std::io::Error,
    },

    /// A line was not valid JSON.
    #[snafu(display("Malformed JSON in {} at line {line}: {source}", path.display()))]
    MalformedJson {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    /// Writing or compressing the output failed.
    #[snafu(display("Failed to write {}: {source}", path.display()))]
    WriteOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Moving the finished temp file into place failed.
    #[snafu(display("Failed to finalize {}: {source}", path.display()))]
    Finalize {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors from the per-table state ledger and lock.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StateError {
    /// Ledger file could not be read.
    #[snafu(display("Failed to read state file {}: {source}", path.display()))]
    ReadState {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Ledger file is not valid JSON.
    #[snafu(display("Failed to parse state file {}: {source}", path.display()))]
    ParseState {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Ledger could not be serialized.
    #[snafu(display("Failed to serialize state: {source}"))]
    SerializeState { source: serde_json::Error },

    /// Ledger file could not be written.
    #[snafu(display("Failed to write state file {}: {source}", path.display()))]
    WriteState {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another run holds the table lock.
    #[snafu(display("Table directory is locked by another run: {}", path.display()))]
    TableLocked { path: PathBuf },

    /// Lock file could not be created.
    #[snafu(display("Failed to create lock file {}: {source}", path.display()))]
    CreateLock {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors from fetching and expanding upstream archives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DownloadError {
    /// HTTP client could not be built.
    #[snafu(display("Failed to build HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },

    /// HTTP request failed.
    #[snafu(display("Request to {url} failed: {source}"))]
    Request { url: String, source: reqwest::Error },

    /// Server answered with a non-success status.
    #[snafu(display("Request to {url} returned HTTP {status}"))]
    HttpStatus { url: String, status: u16 },

    /// Writing the downloaded bytes failed.
    #[snafu(display("Failed to write download {}: {source}", path.display()))]
    WriteDownload {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Archive could not be opened.
    #[snafu(display("Failed to open archive {}: {source}", path.display()))]
    OpenArchive {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Archive is corrupt or extraction failed.
    #[snafu(display("Failed to extract archive {}: {source}", path.display()))]
    ExtractArchive {
        path: PathBuf,
        source: std::io::Error,
    },

    /// One or more archives failed in a batch.
    #[snafu(display("{} of {total} archives failed: {}", failed.len(), failed.join(", ")))]
    BatchFailed { total: usize, failed: Vec<String> },
}

/// Errors from the staging and load driver.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoadError {
    /// One or more uploads failed; no load is attempted.
    #[snafu(display(
        "Table {table}: {} of {total} uploads failed: {}",
        failed.len(),
        failed.join(", ")
    ))]
    UploadsFailed {
        table: String,
        total: usize,
        failed: Vec<String>,
    },

    /// Listing the staging prefix failed.
    #[snafu(display("Failed to list staged objects under {prefix}: {source}"))]
    ListStaged { prefix: String, source: StorageError },

    /// Schema file does not exist.
    #[snafu(display("Schema file does not exist: {}", path.display()))]
    MissingSchema { path: PathBuf },

    /// Schema file could not be read.
    #[snafu(display("Failed to read schema {}: {source}", path.display()))]
    ReadSchema {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Schema file is not a JSON array of fields.
    #[snafu(display("Invalid schema {}: {source}", path.display()))]
    ParseSchema {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Source URI does not point at Cloud Storage.
    #[snafu(display("Load URI must begin with 'gs://': {uri}"))]
    InvalidUri { uri: String },

    /// Table id is not `project.dataset.table`.
    #[snafu(display("Table id {table_id} requires 3 parts but has {parts}"))]
    InvalidTableId { table_id: String, parts: usize },

    /// Warehouse API call failed.
    #[snafu(display("Warehouse request failed: {message}"))]
    Warehouse { message: String },

    /// Load job finished with an error.
    #[snafu(display("Load into {table_id} failed: {message}"))]
    JobFailed { table_id: String, message: String },
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Transform error.
    #[snafu(display("Transform error: {source}"))]
    Transform { source: TransformError },

    /// State ledger or lock error.
    #[snafu(display("State error: {source}"))]
    State { source: StateError },

    /// Download or decompress error.
    #[snafu(display("Download error: {source}"))]
    Download { source: DownloadError },

    /// Staging or load error.
    #[snafu(display("Load error: {source}"))]
    Load { source: LoadError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Sanitized part count does not match raw part count after a transform.
    #[snafu(display(
        "Table {table}: number of raw and sanitized parts differ: {expected} vs {actual}{}",
        if failed.is_empty() { String::new() } else { format!(" (failed: {})", failed.join(", ")) }
    ))]
    PartCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
        failed: Vec<String>,
    },

    /// Local filesystem operation failed.
    #[snafu(display("IO error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// A stage needs a client that was not built for this run.
    #[snafu(display("Stage {stage} requires the {client} client, which was not configured"))]
    MissingClient {
        stage: &'static str,
        client: &'static str,
    },

    /// Shutdown was requested before the stage finished.
    #[snafu(display("Cancelled by shutdown signal"))]
    Cancelled,
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<TransformError> for PipelineError {
    fn from(source: TransformError) -> Self {
        PipelineError::Transform { source }
    }
}

impl From<StateError> for PipelineError {
    fn from(source: StateError) -> Self {
        PipelineError::State { source }
    }
}

impl From<DownloadError> for PipelineError {
    fn from(source: DownloadError) -> Self {
        PipelineError::Download { source }
    }
}

impl From<LoadError> for PipelineError {
    fn from(source: LoadError) -> Self {
        PipelineError::Load { source }
    }
}

impl From<MetricsError> for PipelineError {
    fn from(source: MetricsError) -> Self {
        PipelineError::Metrics { source }
    }
}
