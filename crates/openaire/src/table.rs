//! Table model.
//!
//! A `Table` is built once per run from validated configuration and shared
//! read-only between stages. Every path and identifier a stage needs is
//! derived here so the naming rules live in one place.

use indexmap::IndexMap;
use std::io;
use std::path::PathBuf;

use crate::config::{Config, ValidTable};
use crate::error::ConfigError;
use crate::part::{self, PART_EXTENSION, PartKind, SANITIZED_MARKER};

/// A named dataset published as `num_parts` archives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub num_parts: usize,
    pub alt_name: Option<String>,
    /// Top-level fields whose arrays have nulls removed, if any.
    pub remove_nulls: Option<Vec<String>>,
    /// Warehouse column schema, `<schema_folder>/<name>.json`.
    pub schema_path: PathBuf,
    /// Archive URL to local download path, in part order.
    pub download_paths: IndexMap<String, PathBuf>,
    /// Directory the archives extract into, `<decompress_folder>/<remote_name>`.
    pub part_location: PathBuf,
    /// `<project_id>.<dataset_id>.<name><release_date>`
    pub full_table_id: String,
    /// Object prefix in the staging bucket, `<bucket_folder>/<name>`.
    pub bucket_prefix: String,
    /// `gs://<bucket_id>/<bucket_folder>/<name>`
    pub uri_prefix: String,
}

impl Table {
    /// Build every configured table.
    pub fn from_config(config: &Config) -> Result<Vec<Table>, ConfigError> {
        Ok(config
            .tables()?
            .into_iter()
            .map(|t| Table::new(config, t))
            .collect())
    }

    fn new(config: &Config, t: ValidTable<'_>) -> Table {
        let cw = &config.cloud_workspace;
        let wf = &config.workflow_config;
        let remote_name = t.alt_name.unwrap_or(t.name);

        let download_folder = config.download_folder();
        let url_base = wf.zenodo_url_path.trim_end_matches('/');
        let download_paths = (1..=t.num_parts)
            .map(|i| {
                let file = format!("{remote_name}_{i}.tar");
                (format!("{url_base}/{file}"), download_folder.join(&file))
            })
            .collect();

        let bucket_folder = cw.bucket_folder.trim_matches('/');

        Table {
            name: t.name.to_string(),
            num_parts: t.num_parts,
            alt_name: t.alt_name.map(str::to_string),
            remove_nulls: t.remove_nulls,
            schema_path: wf.schema_folder.join(format!("{}.json", t.name)),
            download_paths,
            part_location: config.decompress_folder().join(remote_name),
            full_table_id: format!(
                "{}.{}.{}{}",
                cw.project_id, cw.dataset_id, t.name, wf.release_date
            ),
            bucket_prefix: format!("{bucket_folder}/{}", t.name),
            uri_prefix: format!("gs://{}/{bucket_folder}/{}", cw.bucket_id, t.name),
        }
    }

    /// Name used upstream for archives and the extracted directory.
    pub fn remote_name(&self) -> &str {
        self.alt_name.as_deref().unwrap_or(&self.name)
    }

    /// Whether this table goes through the null-sanitizing transform.
    pub fn sanitizes(&self) -> bool {
        self.remove_nulls.is_some()
    }

    /// Glob of staged objects a load reads.
    pub fn uri_pattern(&self) -> String {
        if self.sanitizes() {
            format!("{}/*{SANITIZED_MARKER}{PART_EXTENSION}", self.uri_prefix)
        } else {
            format!("{}/*{PART_EXTENSION}", self.uri_prefix)
        }
    }

    /// Part kind that is staged and loaded for this table.
    pub fn staged_kind(&self) -> PartKind {
        if self.sanitizes() {
            PartKind::Sanitized
        } else {
            PartKind::Raw
        }
    }

    /// Raw parts on disk, sorted.
    pub fn extracted_files(&self) -> io::Result<Vec<PathBuf>> {
        part::list_parts(&self.part_location, PartKind::Raw)
    }

    /// Sanitized parts on disk, sorted.
    pub fn transform_files(&self) -> io::Result<Vec<PathBuf>> {
        part::list_parts(&self.part_location, PartKind::Sanitized)
    }

    /// Local files the upload stage considers, sorted.
    pub fn stage_candidates(&self) -> io::Result<Vec<PathBuf>> {
        part::list_parts(&self.part_location, self.staged_kind())
    }
}
