//! Common error types shared by the loader crates.
//!
//! Storage, configuration and metrics errors live here because both the
//! core plumbing and the pipeline stages produce them.

use std::path::PathBuf;

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },
}

// ============ Config Errors ============

/// Errors that can occur during configuration loading and validation.
///
/// Every variant is fatal at startup: the process exits before any network
/// or cloud action is taken.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Configuration file does not exist.
    #[snafu(display("Config path does not exist: {}", path.display()))]
    MissingConfigFile { path: PathBuf },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// A required value is empty.
    #[snafu(display("Required config value '{field}' cannot be empty"))]
    EmptyValue { field: String },

    /// The working path does not exist on disk.
    #[snafu(display("Given working path does not exist: {}", path.display()))]
    MissingWorkingPath { path: PathBuf },

    /// A configured path is not valid UTF-8.
    #[snafu(display("{field} is not valid UTF-8: {}", path.display()))]
    NonUtf8Path { field: &'static str, path: PathBuf },

    /// No tables were configured.
    #[snafu(display("No tables found for the workflow to process"))]
    NoTables,

    /// A table is missing a required parameter.
    #[snafu(display("Table '{table}' is missing required parameter '{parameter}'"))]
    MissingTableParameter { table: String, parameter: String },

    /// A table parameter has an invalid value.
    #[snafu(display("Table '{table}' has invalid '{parameter}': {message}"))]
    InvalidTableParameter {
        table: String,
        parameter: String,
        message: String,
    },

    /// Release date is not a valid `YYYYMMDD` date.
    #[snafu(display("Given release date is not a valid YYYYMMDD date: {value}"))]
    InvalidReleaseDate { value: String },

    /// A numeric setting that must be positive was zero.
    #[snafu(display("'{field}' must be greater than zero"))]
    ZeroValue { field: String },

    /// Failed to create a local working directory.
    #[snafu(display("Failed to create directory {}: {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization and export.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Recorder already initialized (double-init attempted).
    #[snafu(display("Metrics recorder already initialized"))]
    AlreadyInitialized,

    /// Recorder not initialized (controller accessed before init).
    #[snafu(display("Metrics recorder not initialized"))]
    NotInitialized,

    /// Failed to write the metrics textfile.
    #[snafu(display("Failed to write metrics textfile {}: {source}", path.display()))]
    WriteTextfile {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingTableParameter {
            table: "publication".to_string(),
            parameter: "num_parts".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Table 'publication' is missing required parameter 'num_parts'"
        );
    }
}
