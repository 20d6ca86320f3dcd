//! Configuration for the OpenAIRE loader.
//!
//! ```yaml
//! cloud_workspace:
//!   project_id: ${GCP_PROJECT}
//!   dataset_id: openaire
//!   bucket_id: my-staging-bucket
//!   bucket_folder: openaire
//!   data_location: us
//! workflow_config:
//!   working_path: /data/openaire
//!   zenodo_url_path: https://zenodo.org/records/1234/files
//!   release_date: "20231215"
//!   google_secret_path: /secrets/sa.json
//!   tables:
//!     publication:
//!       num_parts: 3
//!       remove_nulls: "source, author"
//!     relation:
//!       num_parts: 11
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::{Path, PathBuf};

use openaire_core::config::{MetricsConfig, load_yaml, parse_yaml};

use crate::error::ConfigError;
use openaire_core::error::{
    EmptyValueSnafu, InvalidReleaseDateSnafu, InvalidTableParameterSnafu,
    MissingTableParameterSnafu, MissingWorkingPathSnafu, NoTablesSnafu, NonUtf8PathSnafu,
    ZeroValueSnafu,
};

/// Top-level loader configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub cloud_workspace: CloudWorkspace,
    pub workflow_config: WorkflowConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Cloud project, warehouse dataset and staging bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudWorkspace {
    pub project_id: String,
    pub dataset_id: String,
    pub bucket_id: String,
    /// Folder inside the bucket that holds one sub-folder per table.
    pub bucket_folder: String,
    /// Location the dataset is created in, e.g. `us`.
    pub data_location: String,
}

/// Local paths, release metadata and the tables to load.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Existing directory under which `data/` is created.
    pub working_path: PathBuf,
    /// Base URL of the upstream record's files.
    pub zenodo_url_path: String,
    /// Release date as `YYYYMMDD`, appended to every table id.
    pub release_date: String,
    /// Service account key used for storage and warehouse clients.
    #[serde(default)]
    pub google_secret_path: Option<PathBuf>,
    #[serde(default = "default_schema_folder")]
    pub schema_folder: PathBuf,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub write_mode: WriteMode,
    /// Tables keyed by name, in the order they are processed.
    #[serde(default)]
    pub tables: IndexMap<String, Option<TableConfig>>,
}

fn default_schema_folder() -> PathBuf {
    PathBuf::from("schemas")
}

fn default_max_workers() -> usize {
    7
}

fn default_chunk_size() -> usize {
    7
}

/// What a load does to rows already in the destination table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Truncate the table and write the new rows.
    #[default]
    Replace,
    /// Add the new rows to the existing ones.
    Append,
}

/// Per-table parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    #[serde(default)]
    pub num_parts: Option<usize>,
    /// Name used upstream for the archives and the extracted directory.
    #[serde(default)]
    pub alt_name: Option<String>,
    #[serde(default)]
    pub remove_nulls: Option<FieldList>,
}

/// A list of field names, written either as `"a, b"` or as a YAML sequence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FieldList {
    Csv(String),
    List(Vec<String>),
}

impl FieldList {
    /// Trimmed, non-empty field names with duplicates removed, in first-seen order.
    pub fn fields(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            FieldList::Csv(s) => s.split(',').collect(),
            FieldList::List(items) => items.iter().map(String::as_str).collect(),
        };

        let mut fields: Vec<String> = Vec::with_capacity(raw.len());
        for field in raw.into_iter().map(str::trim).filter(|f| !f.is_empty()) {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
        fields
    }
}

/// A table entry after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTable<'a> {
    pub name: &'a str,
    pub num_parts: usize,
    pub alt_name: Option<&'a str>,
    pub remove_nulls: Option<Vec<String>>,
}

impl Config {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string and validate it.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = parse_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cw = &self.cloud_workspace;
        for (field, value) in [
            ("cloud_workspace.project_id", &cw.project_id),
            ("cloud_workspace.dataset_id", &cw.dataset_id),
            ("cloud_workspace.bucket_id", &cw.bucket_id),
            ("cloud_workspace.bucket_folder", &cw.bucket_folder),
            ("cloud_workspace.data_location", &cw.data_location),
            (
                "workflow_config.zenodo_url_path",
                &self.workflow_config.zenodo_url_path,
            ),
        ] {
            ensure!(!value.trim().is_empty(), EmptyValueSnafu { field });
        }

        let wf = &self.workflow_config;
        ensure!(
            wf.working_path.is_dir(),
            MissingWorkingPathSnafu {
                path: &wf.working_path
            }
        );
        if let Some(path) = &wf.google_secret_path {
            ensure!(
                path.to_str().is_some(),
                NonUtf8PathSnafu {
                    field: "workflow_config.google_secret_path",
                    path,
                }
            );
        }
        validate_release_date(&wf.release_date)?;
        ensure!(
            wf.max_workers > 0,
            ZeroValueSnafu {
                field: "workflow_config.max_workers"
            }
        );
        ensure!(
            wf.chunk_size > 0,
            ZeroValueSnafu {
                field: "workflow_config.chunk_size"
            }
        );

        self.tables().map(|_| ())
    }

    /// Validated table entries in configuration order.
    pub fn tables(&self) -> Result<Vec<ValidTable<'_>>, ConfigError> {
        ensure!(!self.workflow_config.tables.is_empty(), NoTablesSnafu);

        self.workflow_config
            .tables
            .iter()
            .map(|(name, params)| validate_table(name, params.as_ref()))
            .collect()
    }

    /// `<working_path>/data`
    pub fn data_path(&self) -> PathBuf {
        self.workflow_config.working_path.join("data")
    }

    /// `<working_path>/data/download`
    pub fn download_folder(&self) -> PathBuf {
        self.data_path().join("download")
    }

    /// `<working_path>/data/decompress`
    pub fn decompress_folder(&self) -> PathBuf {
        self.data_path().join("decompress")
    }

    /// Service account key path as a string, if configured.
    pub fn service_account_path(&self) -> Option<&str> {
        self.workflow_config
            .google_secret_path
            .as_deref()
            .and_then(Path::to_str)
    }
}

fn validate_table<'a>(
    name: &'a str,
    params: Option<&'a TableConfig>,
) -> Result<ValidTable<'a>, ConfigError> {
    ensure!(
        !name.trim().is_empty(),
        EmptyValueSnafu {
            field: "workflow_config.tables"
        }
    );

    let params = params.context(MissingTableParameterSnafu {
        table: name,
        parameter: "num_parts",
    })?;
    let num_parts = params.num_parts.context(MissingTableParameterSnafu {
        table: name,
        parameter: "num_parts",
    })?;
    ensure!(
        num_parts >= 1,
        InvalidTableParameterSnafu {
            table: name,
            parameter: "num_parts",
            message: "must be at least 1",
        }
    );

    let alt_name = match params.alt_name.as_deref().map(str::trim) {
        Some("") => {
            return InvalidTableParameterSnafu {
                table: name,
                parameter: "alt_name",
                message: "cannot be empty",
            }
            .fail();
        }
        other => other,
    };

    let remove_nulls = match &params.remove_nulls {
        None => None,
        Some(list) => {
            let fields = list.fields();
            ensure!(
                !fields.is_empty(),
                InvalidTableParameterSnafu {
                    table: name,
                    parameter: "remove_nulls",
                    message: "must name at least one field",
                }
            );
            Some(fields)
        }
    };

    Ok(ValidTable {
        name,
        num_parts,
        alt_name,
        remove_nulls,
    })
}

fn validate_release_date(value: &str) -> Result<(), ConfigError> {
    let well_formed = value.len() == 8
        && value.bytes().all(|b| b.is_ascii_digit())
        && chrono::NaiveDate::parse_from_str(value, "%Y%m%d").is_ok();
    ensure!(well_formed, InvalidReleaseDateSnafu { value });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(working_path: &Path, tables: &str, release_date: &str) -> String {
        format!(
            r#"
cloud_workspace:
  project_id: academic-observatory
  dataset_id: openaire
  bucket_id: staging-bucket
  bucket_folder: openaire
  data_location: us
workflow_config:
  working_path: {}
  zenodo_url_path: https://zenodo.org/records/1/files
  release_date: "{release_date}"
  tables:
{tables}
"#,
            working_path.display()
        )
    }

    #[test]
    fn test_parse_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::parse(&yaml(
            dir.path(),
            "    publication:\n      num_parts: 3\n",
            "20231215",
        ))
        .unwrap();

        let wf = &config.workflow_config;
        assert_eq!(wf.max_workers, 7);
        assert_eq!(wf.chunk_size, 7);
        assert_eq!(wf.write_mode, WriteMode::Replace);
        assert_eq!(wf.schema_folder, PathBuf::from("schemas"));
        assert!(wf.google_secret_path.is_none());
        assert!(config.metrics.textfile.is_none());
        assert_eq!(config.download_folder(), dir.path().join("data/download"));
        assert_eq!(
            config.decompress_folder(),
            dir.path().join("data/decompress")
        );
    }

    #[test]
    fn test_remove_nulls_string_and_list_forms() {
        let dir = TempDir::new().unwrap();
        let tables = "    publication:\n      num_parts: 3\n      remove_nulls: \"source, author\"\n    software:\n      num_parts: 1\n      remove_nulls: [source, source, description]\n    relation:\n      num_parts: 11\n";
        let config = Config::parse(&yaml(dir.path(), tables, "20231215")).unwrap();
        let tables = config.tables().unwrap();

        assert_eq!(tables.len(), 3);
        assert_eq!(
            tables[0].remove_nulls,
            Some(vec!["source".to_string(), "author".to_string()])
        );
        assert_eq!(
            tables[1].remove_nulls,
            Some(vec!["source".to_string(), "description".to_string()])
        );
        assert_eq!(tables[2].remove_nulls, None);
        // configuration order is preserved
        assert_eq!(tables[2].name, "relation");
    }

    #[test]
    fn test_missing_num_parts_rejected() {
        let dir = TempDir::new().unwrap();
        let tables = "    publication:\n      alt_name: publications\n";
        let err = Config::parse(&yaml(dir.path(), tables, "20231215")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingTableParameter { ref table, ref parameter }
                if table == "publication" && parameter == "num_parts"
        ));
    }

    #[test]
    fn test_table_without_params_rejected() {
        let dir = TempDir::new().unwrap();
        let err = Config::parse(&yaml(dir.path(), "    publication:\n", "20231215")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTableParameter { .. }));
    }

    #[test]
    fn test_zero_num_parts_rejected() {
        let dir = TempDir::new().unwrap();
        let tables = "    publication:\n      num_parts: 0\n";
        let err = Config::parse(&yaml(dir.path(), tables, "20231215")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTableParameter { .. }));
    }

    #[test]
    fn test_empty_remove_nulls_rejected() {
        let dir = TempDir::new().unwrap();
        let tables = "    publication:\n      num_parts: 1\n      remove_nulls: \" , \"\n";
        let err = Config::parse(&yaml(dir.path(), tables, "20231215")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTableParameter { .. }));
    }

    #[test]
    fn test_invalid_release_dates_rejected() {
        let dir = TempDir::new().unwrap();
        let tables = "    publication:\n      num_parts: 1\n";
        for bad in ["2023-12-15", "20231332", "2023121", "202312150", "abcdefgh"] {
            let err = Config::parse(&yaml(dir.path(), tables, bad)).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidReleaseDate { .. }),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_no_tables_rejected() {
        let dir = TempDir::new().unwrap();
        let err = Config::parse(&yaml(dir.path(), "    {}", "20231215")).unwrap_err();
        assert!(matches!(err, ConfigError::NoTables));
    }

    #[test]
    fn test_missing_working_path_rejected() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let tables = "    publication:\n      num_parts: 1\n";
        let err = Config::parse(&yaml(&missing, tables, "20231215")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingWorkingPath { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_secret_path_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        let tables = "    publication:\n      num_parts: 1\n";
        let mut config = Config::parse(&yaml(dir.path(), tables, "20231215")).unwrap();
        config.workflow_config.google_secret_path =
            Some(PathBuf::from(OsStr::from_bytes(b"/secrets/\xffkey.json")));

        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NonUtf8Path {
                field: "workflow_config.google_secret_path",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_max_workers_rejected() {
        let dir = TempDir::new().unwrap();
        let raw = yaml(
            dir.path(),
            "    publication:\n      num_parts: 1\n",
            "20231215",
        )
        .replace("  tables:", "  max_workers: 0\n  tables:");
        let err = Config::parse(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroValue { .. }));
    }

    #[test]
    fn test_append_write_mode() {
        let dir = TempDir::new().unwrap();
        let raw = yaml(
            dir.path(),
            "    publication:\n      num_parts: 1\n",
            "20231215",
        )
        .replace("  tables:", "  write_mode: append\n  tables:");
        let config = Config::parse(&raw).unwrap();
        assert_eq!(config.workflow_config.write_mode, WriteMode::Append);
    }

    #[test]
    fn test_from_file_interpolates_environment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let raw = yaml(
            dir.path(),
            "    publication:\n      num_parts: ${OPENAIRE_TEST_PARTS_UNSET:-4}\n",
            "20231215",
        );
        std::fs::write(&path, raw).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.tables().unwrap()[0].num_parts, 4);
    }
}
