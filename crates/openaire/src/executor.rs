//! Bounded parallel executor for the sanitize transform.
//!
//! A single worker set spans the whole stage: at most `max_workers`
//! transforms run at once on the blocking pool, and a new one is dispatched
//! as soon as any finishes. `chunk_size` only decides how often progress is
//! logged and the ledger is checkpointed.

use futures::stream::{FuturesUnordered, StreamExt};
use snafu::prelude::*;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use openaire_core::emit;
use openaire_core::metrics::events::{
    ActiveTransforms, PartOutcome, PartTransformed, RecordsSanitized,
};

use crate::error::{CancelledSnafu, IoSnafu, PartCountMismatchSnafu, PipelineError, TransformError};
use crate::part::{self, file_name, sanitized_name};
use crate::sanitize::{TransformOutcome, transform_part};
use crate::table::Table;

type WorkResult = Result<TransformOutcome, TransformError>;

/// Future resolving to a finished job and its result.
type WorkerFuture = Pin<Box<dyn Future<Output = (TransformJob, Result<WorkResult, JoinError>)> + Send>>;

/// One part to sanitize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl TransformJob {
    /// Job for a raw part, writing its sanitized sibling. `None` if `input`
    /// is not a raw part.
    pub fn for_raw(input: &Path) -> Option<Self> {
        let output_name = sanitized_name(file_name(input)?)?;
        Some(Self {
            input: input.to_path_buf(),
            output: input.with_file_name(output_name),
        })
    }

    /// Base name of the input part.
    pub fn name(&self) -> String {
        file_name(&self.input)
            .map(str::to_string)
            .unwrap_or_else(|| self.input.display().to_string())
    }
}

/// Totals for one executor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub written: usize,
    pub skipped: usize,
    /// Input names of jobs that failed or panicked.
    pub failed: Vec<String>,
    pub records: u64,
    pub nulls_removed: u64,
}

/// Runs transform jobs with bounded parallelism.
#[derive(Debug, Clone, Copy)]
pub struct Executor {
    max_workers: usize,
    chunk_size: usize,
}

impl Executor {
    pub fn new(max_workers: usize, chunk_size: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Sanitize `fields` in every job's input.
    pub async fn run<F>(
        &self,
        table: &str,
        jobs: Vec<TransformJob>,
        fields: Arc<[String]>,
        cancel: &CancellationToken,
        on_checkpoint: F,
    ) -> Result<ExecutionReport, PipelineError>
    where
        F: FnMut(&[TransformJob]),
    {
        let work = move |job: &TransformJob| transform_part(&job.input, &fields, &job.output);
        self.run_with(table, jobs, work, cancel, on_checkpoint)
            .await
    }

    /// Run `work` for every job.
    ///
    /// Per-job failures and panics are logged and collected in the report;
    /// they never stop sibling jobs. `on_checkpoint` receives the jobs that
    /// succeeded since the last call, every `chunk_size` completions and once
    /// at the end. On cancellation no new jobs start, in-flight jobs finish,
    /// and `Cancelled` is returned.
    pub async fn run_with<W, F>(
        &self,
        table: &str,
        jobs: Vec<TransformJob>,
        work: W,
        cancel: &CancellationToken,
        mut on_checkpoint: F,
    ) -> Result<ExecutionReport, PipelineError>
    where
        W: Fn(&TransformJob) -> WorkResult + Send + Sync + 'static,
        F: FnMut(&[TransformJob]),
    {
        ensure!(!cancel.is_cancelled(), CancelledSnafu);

        let total = jobs.len();
        let work = Arc::new(work);
        let mut report = ExecutionReport::default();
        let mut in_flight: FuturesUnordered<WorkerFuture> = FuturesUnordered::new();
        let mut pending = jobs.into_iter();
        let mut completed = 0usize;
        let mut since_checkpoint: Vec<TransformJob> = Vec::new();
        let mut cancelled = false;

        info!(
            table,
            parts = total,
            max_workers = self.max_workers,
            chunk_size = self.chunk_size,
            "Starting transform"
        );

        for job in pending.by_ref().take(self.max_workers) {
            debug!(table, part = %job.name(), "Dispatching transform");
            in_flight.push(spawn_job(job, work.clone()));
        }
        emit!(ActiveTransforms {
            count: in_flight.len(),
            table: table.to_string(),
        });

        while let Some((job, result)) = in_flight.next().await {
            completed += 1;
            let name = job.name();

            match result {
                Ok(Ok(TransformOutcome::Written {
                    records,
                    nulls_removed,
                })) => {
                    debug!(table, part = %name, records, nulls_removed, "Sanitized part");
                    report.written += 1;
                    report.records += records;
                    report.nulls_removed += nulls_removed;
                    emit!(PartTransformed {
                        outcome: PartOutcome::Written,
                        table: table.to_string(),
                    });
                    emit!(RecordsSanitized {
                        count: records,
                        table: table.to_string(),
                    });
                    since_checkpoint.push(job);
                }
                Ok(Ok(TransformOutcome::Skipped)) => {
                    report.skipped += 1;
                    emit!(PartTransformed {
                        outcome: PartOutcome::Skipped,
                        table: table.to_string(),
                    });
                    since_checkpoint.push(job);
                }
                Ok(Err(e)) => {
                    warn!(table, part = %name, error = %e, "Transform failed");
                    report.failed.push(name);
                    emit!(PartTransformed {
                        outcome: PartOutcome::Failed,
                        table: table.to_string(),
                    });
                }
                Err(e) => {
                    error!(table, part = %name, error = %e, "Transform worker panicked");
                    report.failed.push(name);
                    emit!(PartTransformed {
                        outcome: PartOutcome::Failed,
                        table: table.to_string(),
                    });
                }
            }

            if completed % self.chunk_size == 0 || completed == total {
                info!(
                    table,
                    chunk = completed.div_ceil(self.chunk_size),
                    completed,
                    total,
                    "Transform progress"
                );
                on_checkpoint(&since_checkpoint);
                since_checkpoint.clear();
            }

            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                info!(
                    table,
                    in_flight = in_flight.len(),
                    "Shutdown requested, waiting for in-flight transforms"
                );
            }
            if !cancelled {
                if let Some(next) = pending.next() {
                    debug!(table, part = %next.name(), "Dispatching transform");
                    in_flight.push(spawn_job(next, work.clone()));
                }
            }

            emit!(ActiveTransforms {
                count: in_flight.len(),
                table: table.to_string(),
            });
        }

        if !since_checkpoint.is_empty() {
            on_checkpoint(&since_checkpoint);
        }
        ensure!(!cancelled, CancelledSnafu);

        info!(
            table,
            written = report.written,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Transform finished"
        );
        Ok(report)
    }
}

fn spawn_job<W>(job: TransformJob, work: Arc<W>) -> WorkerFuture
where
    W: Fn(&TransformJob) -> WorkResult + Send + Sync + 'static,
{
    Box::pin(async move {
        let handle = {
            let job = job.clone();
            tokio::task::spawn_blocking(move || work(&job))
        };
        let result = handle.await;
        (job, result)
    })
}

/// Check that every raw part of `table` has its sanitized counterpart on disk.
///
/// `failed` names the units the executor reported as failed and is carried
/// into the error.
pub fn ensure_complete(table: &Table, failed: &[String]) -> Result<(), PipelineError> {
    let raw = part::names(
        &table
            .extracted_files()
            .context(IoSnafu { path: &table.part_location })?,
    );
    let sanitized: BTreeSet<String> = part::names(
        &table
            .transform_files()
            .context(IoSnafu { path: &table.part_location })?,
    )
    .into_iter()
    .collect();

    let expected = raw.len();
    let actual = raw
        .iter()
        .filter_map(|name| sanitized_name(name))
        .filter(|output| sanitized.contains(output))
        .count();
    if sanitized.len() > actual {
        warn!(
            table = %table.name,
            orphans = sanitized.len() - actual,
            "Sanitized parts without a raw part"
        );
    }

    ensure!(
        expected == actual,
        PartCountMismatchSnafu {
            table: &table.name,
            expected,
            actual,
            failed: failed.to_vec(),
        }
    );
    Ok(())
}
