//! Metrics infrastructure.
//!
//! The loader is a batch job, so there is no scrape endpoint: a Prometheus
//! recorder is installed at startup and the rendered exposition text can be
//! written to a textfile (for node_exporter's textfile collector) when the
//! run ends.

pub mod events;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

use crate::error::{
    AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu, PrometheusInitSnafu,
    WriteTextfileSnafu,
};

/// Macro for emitting metric events.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding Prometheus metric.
///
/// ```ignore
/// emit!(PartStaged { table: "publication".to_string() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

/// Histogram buckets for duration metrics (in seconds). Load jobs and
/// whole-stage durations run into minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0,
];

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Controller for the installed recorder.
pub struct MetricsController {
    handle: PrometheusHandle,
}

fn install() -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())
}

/// Install the global Prometheus recorder.
pub fn init_global() -> Result<(), MetricsError> {
    install()?;
    info!("Metrics recorder installed");
    Ok(())
}

/// Install the recorder for tests; safe to call from many test threads.
pub fn init_test() {
    if install().is_err() {
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

impl MetricsController {
    /// Get a reference to the global metrics controller.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Write the rendered metrics to `path`, replacing it atomically.
    pub fn write_textfile(&self, path: &Path) -> Result<(), MetricsError> {
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, self.render()).context(WriteTextfileSnafu { path: &tmp })?;
        std::fs::rename(&tmp, path).context(WriteTextfileSnafu { path })
    }
}
