//! Staging and bulk-load driver.
//!
//! Staging pushes the delta of local parts to the table's bucket prefix;
//! loading points one bulk load job at the staged glob.

use serde_json::Value;
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use openaire_core::emit;
use openaire_core::metrics::events::{LoadJobCompleted, PartStaged};

use crate::clients::{LoadOutcome, LoadRequest, SourceFormat, StagingStore, WarehouseClient};
use crate::config::WriteMode;
use crate::delta;
use crate::executor::ensure_complete;
use crate::error::{
    InvalidTableIdSnafu, InvalidUriSnafu, IoSnafu, ListStagedSnafu, LoadError, MissingSchemaSnafu,
    ParseSchemaSnafu, PipelineError, ReadSchemaSnafu, UploadsFailedSnafu,
};
use crate::part;
use crate::table::Table;

/// Outcome of staging one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Local candidates considered.
    pub candidates: usize,
    /// Names uploaded this run, sorted.
    pub uploaded: Vec<String>,
    pub bytes: u64,
}

impl StageReport {
    /// Candidates that were already staged.
    pub fn already_staged(&self) -> usize {
        self.candidates - self.uploaded.len()
    }
}

/// Names already staged under the table's prefix.
pub async fn staged_names(
    table: &Table,
    store: &dyn StagingStore,
) -> Result<BTreeSet<String>, LoadError> {
    store
        .list_objects(&table.bucket_prefix)
        .await
        .context(ListStagedSnafu {
            prefix: &table.bucket_prefix,
        })
}

/// Upload every local candidate that is not staged yet.
///
/// A sanitizing table is only staged once every raw part has its sanitized
/// sibling. Uploads run one after another in name order. A failed upload does
/// not stop the rest, but any failure fails the table with the failed names.
pub async fn stage_table(
    table: &Table,
    store: &dyn StagingStore,
) -> Result<StageReport, PipelineError> {
    if table.sanitizes() {
        ensure_complete(table, &[])?;
    }
    let candidates = table.stage_candidates().context(IoSnafu {
        path: &table.part_location,
    })?;
    let local = part::names(&candidates);
    let remote = staged_names(table, store).await?;
    let pending = delta::resolve(&local, &remote);

    info!(
        table = %table.name,
        local = local.len(),
        staged = remote.len(),
        pending = pending.len(),
        "Resolved staging delta"
    );

    let mut report = StageReport {
        candidates: local.len(),
        ..Default::default()
    };
    let mut failed = Vec::new();

    for name in &pending {
        let local_path = table.part_location.join(name);
        let remote_name = format!("{}/{name}", table.bucket_prefix);
        match store.upload(&local_path, &remote_name).await {
            Ok(bytes) => {
                debug!(table = %table.name, part = %name, bytes, "Staged part");
                report.bytes += bytes;
                report.uploaded.push(name.clone());
                emit!(PartStaged {
                    table: table.name.clone(),
                });
            }
            Err(e) => {
                warn!(table = %table.name, part = %name, error = %e, "Upload failed");
                failed.push(name.clone());
            }
        }
    }

    if !failed.is_empty() {
        let err = UploadsFailedSnafu {
            table: &table.name,
            total: pending.len(),
            failed,
        }
        .build();
        return Err(err.into());
    }

    info!(
        table = %table.name,
        uploaded = report.uploaded.len(),
        bytes = report.bytes,
        "Staging finished"
    );
    Ok(report)
}

/// Read a column schema file as a JSON array, uppercasing `type` and `mode`.
pub fn read_schema(path: &Path) -> Result<Value, LoadError> {
    ensure!(path.is_file(), MissingSchemaSnafu { path });
    let raw = std::fs::read(path).context(ReadSchemaSnafu { path })?;
    let mut fields: Vec<Value> = serde_json::from_slice(&raw).context(ParseSchemaSnafu { path })?;
    fields.iter_mut().for_each(normalize_field);
    Ok(Value::Array(fields))
}

fn normalize_field(field: &mut Value) {
    let Some(object) = field.as_object_mut() else {
        return;
    };
    for key in ["type", "mode"] {
        if let Some(Value::String(value)) = object.get_mut(key) {
            *value = value.to_uppercase();
        }
    }
    if let Some(Value::Array(nested)) = object.get_mut("fields") {
        nested.iter_mut().for_each(normalize_field);
    }
}

/// Check the parts of a load request that the warehouse would reject late.
pub fn validate_request(request: &LoadRequest) -> Result<(), LoadError> {
    ensure!(
        request.uri.starts_with("gs://"),
        InvalidUriSnafu { uri: &request.uri }
    );
    let parts = request.table_id.split('.').count();
    ensure!(
        parts == 3 && request.table_id.split('.').all(|p| !p.is_empty()),
        InvalidTableIdSnafu {
            table_id: &request.table_id,
            parts,
        }
    );
    Ok(())
}

/// Build the load request for `table`.
pub fn load_request(
    table: &Table,
    location: &str,
    write_mode: WriteMode,
) -> Result<LoadRequest, LoadError> {
    let request = LoadRequest {
        uri: table.uri_pattern(),
        table_id: table.full_table_id.clone(),
        schema: read_schema(&table.schema_path)?,
        source_format: SourceFormat::NewlineDelimitedJson,
        write_mode,
        ignore_unknown_values: true,
        location: location.to_string(),
    };
    validate_request(&request)?;
    Ok(request)
}

/// Bulk load the table's staged objects. Failures are reported, not retried.
pub async fn load_table(
    table: &Table,
    warehouse: &dyn WarehouseClient,
    location: &str,
    write_mode: WriteMode,
) -> Result<LoadOutcome, LoadError> {
    let request = load_request(table, location, write_mode)?;
    info!(
        table = %table.name,
        table_id = %request.table_id,
        uri = %request.uri,
        write_mode = request.write_mode.disposition(),
        "Loading table"
    );

    let start = Instant::now();
    let result = warehouse.bulk_load(&request).await;
    emit!(LoadJobCompleted {
        table: table.name.clone(),
        success: result.is_ok(),
        duration: start.elapsed(),
    });

    let outcome = result?;
    info!(
        table = %table.name,
        job_id = %outcome.job_id,
        rows = ?outcome.output_rows,
        "Load finished"
    );
    Ok(outcome)
}
