//! Internal events for loader metrics emission.
//!
//! Each event struct represents a measurable occurrence in the loader.
//! Events implement the `InternalEvent` trait which records the
//! corresponding Prometheus metric. Per-table events carry a `table` label.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Transform events
// ============================================================================

/// Outcome of transforming a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    Written,
    Skipped,
    Failed,
}

impl PartOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartOutcome::Written => "written",
            PartOutcome::Skipped => "skipped",
            PartOutcome::Failed => "failed",
        }
    }
}

/// Event emitted when the transform of one part finishes.
pub struct PartTransformed {
    pub outcome: PartOutcome,
    pub table: String,
}

impl InternalEvent for PartTransformed {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), table = %self.table, "Part transformed");
        counter!(
            "openaire_parts_transformed_total",
            "outcome" => self.outcome.as_str(),
            "table" => self.table
        )
        .increment(1);
    }
}

/// Event emitted with the number of records rewritten in one part.
pub struct RecordsSanitized {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for RecordsSanitized {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Records sanitized");
        counter!("openaire_records_sanitized_total", "table" => self.table).increment(self.count);
    }
}

/// Gauge of transforms currently in flight.
pub struct ActiveTransforms {
    pub count: usize,
    pub table: String,
}

impl InternalEvent for ActiveTransforms {
    fn emit(self) {
        gauge!("openaire_active_transforms", "table" => self.table).set(self.count as f64);
    }
}

// ============================================================================
// Stage and load events
// ============================================================================

/// Event emitted when a part is staged to object storage.
pub struct PartStaged {
    pub table: String,
}

impl InternalEvent for PartStaged {
    fn emit(self) {
        trace!(table = %self.table, "Part staged");
        counter!("openaire_parts_staged_total", "table" => self.table).increment(1);
    }
}

/// Event emitted when an archive download finishes.
pub struct ArchiveDownloaded {
    pub bytes: u64,
    pub duration: Duration,
}

impl InternalEvent for ArchiveDownloaded {
    fn emit(self) {
        trace!(bytes = self.bytes, duration_ms = self.duration.as_millis(), "Archive downloaded");
        counter!("openaire_download_bytes_total").increment(self.bytes);
        histogram!("openaire_download_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a warehouse load job finishes.
pub struct LoadJobCompleted {
    pub table: String,
    pub success: bool,
    pub duration: Duration,
}

impl InternalEvent for LoadJobCompleted {
    fn emit(self) {
        let status = if self.success { "success" } else { "error" };
        trace!(table = %self.table, status, "Load job completed");
        counter!("openaire_load_jobs_total", "table" => self.table.clone(), "status" => status)
            .increment(1);
        histogram!("openaire_load_job_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a workflow stage finishes.
pub struct StageCompleted {
    pub stage: &'static str,
    pub duration: Duration,
}

impl InternalEvent for StageCompleted {
    fn emit(self) {
        trace!(stage = self.stage, duration_ms = self.duration.as_millis(), "Stage completed");
        histogram!("openaire_stage_duration_seconds", "stage" => self.stage)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Put,
    List,
    CreateMultipart,
    CompleteMultipart,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
            StorageOperation::CreateMultipart => "create_multipart",
            StorageOperation::CompleteMultipart => "complete_multipart",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "openaire_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "openaire_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Event emitted with the size of a finished upload.
pub struct BytesUploaded {
    pub bytes: u64,
}

impl InternalEvent for BytesUploaded {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes uploaded");
        counter!("openaire_bytes_uploaded_total").increment(self.bytes);
    }
}
