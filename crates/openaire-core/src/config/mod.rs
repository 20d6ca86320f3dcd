//! Configuration helpers shared by the loader binaries.
//!
//! Config files are YAML. Environment variables are interpolated into the raw
//! text before it is parsed, so any scalar may come from the environment.

mod vars;

pub use vars::{InterpolationResult, interpolate, interpolate_with};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{
    ConfigError, EnvInterpolationSnafu, MissingConfigFileSnafu, ReadFileSnafu, YamlParseSnafu,
};

/// Metrics export settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Where to write the Prometheus text exposition at the end of a run.
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

/// Read a YAML file, interpolate environment variables and deserialize it.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    ensure!(path.exists(), MissingConfigFileSnafu { path });

    let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    debug!(path = %path.display(), bytes = raw.len(), "Read config file");
    parse_yaml(&raw)
}

/// Interpolate environment variables in `raw` and deserialize it.
pub fn parse_yaml<T: DeserializeOwned>(raw: &str) -> Result<T, ConfigError> {
    let interpolated = interpolate(raw);
    if !interpolated.is_ok() {
        return EnvInterpolationSnafu {
            message: interpolated.errors.join("\n"),
        }
        .fail();
    }

    serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)
}
