//! URL parsing for storage backends.
//!
//! Extracts backend configuration from GCS and local filesystem URLs.

use object_store::path::Path;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{GcsConfig, LocalConfig};

const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";
const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>/.*)$";
const FILE_PATH: &str = r"^(?P<path>/.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Gcs,
    Local,
}

fn matchers() -> &'static [(Backend, Regex)] {
    static MATCHERS: OnceLock<Vec<(Backend, Regex)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        [
            (Backend::Gcs, GCS_URL),
            (Backend::Gcs, GCS_PATH),
            (Backend::Gcs, GCS_VIRTUAL),
            (Backend::Local, FILE_URI),
            (Backend::Local, FILE_PATH),
        ]
        .into_iter()
        .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("valid URL pattern")))
        .collect()
    })
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Gcs(GcsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let Some((backend, captures)) = matchers()
            .iter()
            .find_map(|(backend, regex)| regex.captures(url).map(|c| (*backend, c)))
        else {
            return InvalidUrlSnafu {
                url: url.to_string(),
            }
            .fail();
        };

        match backend {
            Backend::Gcs => {
                let bucket = captures
                    .name("bucket")
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                let key = captures
                    .name("key")
                    .map(|m| Path::from(m.as_str().trim_end_matches('/')));
                Ok(BackendConfig::Gcs(GcsConfig { bucket, key }))
            }
            Backend::Local => {
                let path = captures
                    .name("path")
                    .map(|m| m.as_str().trim_end_matches('/').to_string())
                    .unwrap_or_default();
                Ok(BackendConfig::Local(LocalConfig {
                    path: if path.is_empty() { "/".to_string() } else { path },
                }))
            }
        }
    }

    /// The key prefix inside the bucket, if any.
    pub fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::Gcs(config) => config.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gs_url_with_key() {
        let config = BackendConfig::parse_url("gs://openaire-bucket/dumps/2023").unwrap();
        assert_eq!(
            config,
            BackendConfig::Gcs(GcsConfig {
                bucket: "openaire-bucket".to_string(),
                key: Some(Path::from("dumps/2023")),
            })
        );
    }

    #[test]
    fn test_parse_gs_url_bucket_only() {
        let config = BackendConfig::parse_url("gs://openaire-bucket").unwrap();
        assert_eq!(config.key(), None);
    }

    #[test]
    fn test_parse_https_gcs_path() {
        let config =
            BackendConfig::parse_url("https://storage.googleapis.com/my-bucket/a/b").unwrap();
        match config {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "my-bucket");
                assert_eq!(gcs.key, Some(Path::from("a/b")));
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn test_parse_local_paths() {
        assert_eq!(
            BackendConfig::parse_url("/tmp/staging/").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/tmp/staging".to_string()
            })
        );
        assert_eq!(
            BackendConfig::parse_url("file:///tmp/staging").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/tmp/staging".to_string()
            })
        );
    }

    #[test]
    fn test_parse_unsupported_url() {
        let err = BackendConfig::parse_url("s3://bucket/key").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }
}
