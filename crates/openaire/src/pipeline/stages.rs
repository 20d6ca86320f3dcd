//! Stage implementations.

use std::collections::BTreeSet;
use std::sync::Arc;

use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{StagingStore, WarehouseClient};
use crate::delta;
use crate::error::{
    BatchFailedSnafu, CancelledSnafu, IoSnafu, PipelineError, TaskJoinSnafu,
};
use crate::executor::{TransformJob, ensure_complete};
use crate::load::{load_table, stage_table, staged_names};
use crate::part;
use crate::state::{Ledger, PartStatus, TableLock};
use crate::table::Table;

use super::{DATASET_DESCRIPTION, Workflow};

impl Workflow {
    /// Fetch every archive not already on disk. Failed archives do not stop
    /// the rest but fail the stage.
    pub(super) async fn download(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let mut total = 0usize;
        let mut failed = Vec::new();

        for table in &self.tables {
            for (url, path) in &table.download_paths {
                total += 1;
                if path.is_file() {
                    info!(table = %table.name, path = %path.display(), "Archive present, skipping download");
                    continue;
                }
                ensure!(!cancel.is_cancelled(), CancelledSnafu);

                if let Err(e) = self.clients.downloader.fetch(url, path).await {
                    warn!(table = %table.name, url = %url, error = %e, "Download failed");
                    failed.push(url.clone());
                }
            }
        }

        ensure!(failed.is_empty(), BatchFailedSnafu { total, failed });
        Ok(())
    }

    /// Expand every downloaded archive into the decompress folder.
    ///
    /// Archives are always re-expanded; members overwrite what is there.
    pub(super) async fn decompress(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let destination = self.config.decompress_folder();
        let mut total = 0usize;
        let mut failed = Vec::new();

        for table in &self.tables {
            for archive in table.download_paths.values() {
                total += 1;
                ensure!(!cancel.is_cancelled(), CancelledSnafu);

                let expander = Arc::clone(&self.clients.expander);
                let (archive_path, dest) = (archive.clone(), destination.clone());
                let result = tokio::task::spawn_blocking(move || expander.expand(&archive_path, &dest))
                    .await
                    .context(TaskJoinSnafu)?;

                match result {
                    Ok(members) => {
                        debug!(table = %table.name, archive = %archive.display(), members, "Expanded")
                    }
                    Err(e) => {
                        warn!(table = %table.name, archive = %archive.display(), error = %e, "Decompress failed");
                        failed.push(archive.display().to_string());
                    }
                }
            }
        }

        ensure!(failed.is_empty(), BatchFailedSnafu { total, failed });
        Ok(())
    }

    /// Sanitize the raw parts of every table with `remove_nulls`.
    pub(super) async fn transform(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        for table in &self.tables {
            match &table.remove_nulls {
                Some(fields) => self.transform_table(table, fields, cancel).await?,
                None => info!(table = %table.name, "No fields to sanitize, skipping transform"),
            }
        }
        Ok(())
    }

    async fn transform_table(
        &self,
        table: &Table,
        fields: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let _lock = TableLock::acquire(&table.part_location)?;
        let mut ledger = Ledger::open(&table.part_location, &table.name)?;
        ledger
            .reconcile(table, &BTreeSet::new())
            .context(IoSnafu {
                path: &table.part_location,
            })?;
        ledger.save()?;

        let raw = part::names(&table.extracted_files().context(IoSnafu {
            path: &table.part_location,
        })?);
        let sanitized: BTreeSet<String> = part::names(&table.transform_files().context(IoSnafu {
            path: &table.part_location,
        })?)
        .into_iter()
        .collect();

        let jobs: Vec<TransformJob> = delta::resolve_pending_transforms(&raw, &sanitized)
            .iter()
            .filter_map(|name| TransformJob::for_raw(&table.part_location.join(name)))
            .collect();
        info!(
            table = %table.name,
            fields = ?fields,
            raw = raw.len(),
            pending = jobs.len(),
            "Resolved transform delta"
        );

        let report = self
            .executor
            .run(&table.name, jobs, fields.into(), cancel, |done| {
                ledger.advance_all(done.iter().map(TransformJob::name), PartStatus::Sanitized);
                if let Err(e) = ledger.save() {
                    warn!(table = %table.name, error = %e, "Failed to checkpoint part ledger");
                }
            })
            .await?;

        ensure_complete(table, &report.failed)?;
        info!(
            table = %table.name,
            written = report.written,
            skipped = report.skipped,
            records = report.records,
            nulls_removed = report.nulls_removed,
            "Transform complete"
        );
        Ok(())
    }

    /// Stage the delta of every table to the bucket.
    pub(super) async fn upload(
        &self,
        store: &dyn StagingStore,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        for table in &self.tables {
            ensure!(!cancel.is_cancelled(), CancelledSnafu);

            let _lock = TableLock::acquire(&table.part_location)?;
            let mut ledger = Ledger::open(&table.part_location, &table.name)?;
            let staged = staged_names(table, store).await?;
            ledger.reconcile(table, &staged).context(IoSnafu {
                path: &table.part_location,
            })?;
            ledger.save()?;

            let report = stage_table(table, store).await?;
            ledger.advance_all(&report.uploaded, PartStatus::Staged);
            ledger.save()?;
            info!(
                table = %table.name,
                uploaded = report.uploaded.len(),
                already_staged = report.already_staged(),
                "Table staged"
            );
        }
        Ok(())
    }

    /// Ensure the dataset exists, then bulk load every table.
    pub(super) async fn load(
        &self,
        warehouse: &dyn WarehouseClient,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let cw = &self.config.cloud_workspace;
        warehouse
            .ensure_dataset(
                &cw.project_id,
                &cw.dataset_id,
                &cw.data_location,
                DATASET_DESCRIPTION,
            )
            .await?;

        let write_mode = self.config.workflow_config.write_mode;
        for table in &self.tables {
            ensure!(!cancel.is_cancelled(), CancelledSnafu);

            let _lock = TableLock::acquire(&table.part_location)?;
            load_table(table, warehouse, &cw.data_location, write_mode).await?;

            let mut ledger = Ledger::open(&table.part_location, &table.name)?;
            let loaded = ledger.advance_known(PartStatus::Staged, PartStatus::Loaded);
            ledger.save()?;
            debug!(table = %table.name, parts = loaded, "Marked parts loaded");
        }
        Ok(())
    }

    /// Remove the downloaded and decompressed files and the data directory.
    pub(super) async fn cleanup(&self) -> Result<(), PipelineError> {
        let data_path = self.config.data_path();
        for dir in [self.config.download_folder(), self.config.decompress_folder()] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(path = %dir.display(), "Removed directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(PipelineError::Io { path: dir, source }),
            }
        }
        match tokio::fs::remove_dir(&data_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(PipelineError::Io {
                    path: data_path,
                    source,
                });
            }
        }
        info!(path = %data_path.display(), "Removed data directory");
        Ok(())
    }
}
