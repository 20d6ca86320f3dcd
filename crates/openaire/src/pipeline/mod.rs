//! Workflow orchestration.
//!
//! A [`Workflow`] owns the validated configuration, the table models and the
//! injected clients, and runs the selected stages in their fixed order.

mod stages;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use clap::ValueEnum;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::info;

use openaire_core::emit;
use openaire_core::metrics::events::StageCompleted;
use openaire_core::storage::StorageProvider;

use crate::clients::{
    ArchiveExpander, BigQueryWarehouse, Downloader, HttpDownloader, StagingStore, TarExpander,
    WarehouseClient,
};
use crate::config::Config;
use crate::error::{CancelledSnafu, IoSnafu, MissingClientSnafu, PipelineError};
use crate::executor::Executor;
use crate::table::Table;

/// Description given to a dataset the load stage creates.
pub const DATASET_DESCRIPTION: &str = "OpenAIRE data dump";

/// A workflow stage, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Decompress,
    Transform,
    Upload,
    Load,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Download,
        Stage::Decompress,
        Stage::Transform,
        Stage::Upload,
        Stage::Load,
        Stage::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Decompress => "decompress",
            Stage::Transform => "transform",
            Stage::Upload => "upload",
            Stage::Load => "load",
            Stage::Cleanup => "cleanup",
        }
    }

    /// Deduplicate and sort `stages` into run order; empty means all.
    pub fn plan(stages: &[Stage]) -> Vec<Stage> {
        if stages.is_empty() {
            return Stage::ALL.to_vec();
        }
        let mut plan = stages.to_vec();
        plan.sort();
        plan.dedup();
        plan
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators a run talks to. Staging and warehouse clients are only
/// built when a selected stage needs them.
#[derive(Clone)]
pub struct Clients {
    pub downloader: Arc<dyn Downloader>,
    pub expander: Arc<dyn ArchiveExpander>,
    pub staging: Option<Arc<dyn StagingStore>>,
    pub warehouse: Option<Arc<dyn WarehouseClient>>,
}

impl Clients {
    /// Build production clients for `stages`.
    pub async fn connect(config: &Config, stages: &[Stage]) -> Result<Self, PipelineError> {
        let sa_path = config.service_account_path();

        let needs_staging = stages.contains(&Stage::Upload);
        let staging: Option<Arc<dyn StagingStore>> = if needs_staging {
            let url = format!("gs://{}", config.cloud_workspace.bucket_id);
            let provider = StorageProvider::for_url(&url, sa_path).await?;
            info!(url = %provider.canonical_url(), "Connected staging bucket");
            Some(Arc::new(provider))
        } else {
            None
        };

        let warehouse: Option<Arc<dyn WarehouseClient>> = if stages.contains(&Stage::Load) {
            let client = BigQueryWarehouse::connect(sa_path).await?;
            info!(project_id = %config.cloud_workspace.project_id, "Connected warehouse");
            Some(Arc::new(client))
        } else {
            None
        };

        Ok(Self {
            downloader: Arc::new(HttpDownloader::new()?),
            expander: Arc::new(TarExpander),
            staging,
            warehouse,
        })
    }

    fn staging(&self, stage: Stage) -> Result<&dyn StagingStore, PipelineError> {
        self.staging.as_deref().context(MissingClientSnafu {
            stage: stage.as_str(),
            client: "staging",
        })
    }

    fn warehouse(&self, stage: Stage) -> Result<&dyn WarehouseClient, PipelineError> {
        self.warehouse.as_deref().context(MissingClientSnafu {
            stage: stage.as_str(),
            client: "warehouse",
        })
    }
}

/// One run over the configured tables.
pub struct Workflow {
    config: Arc<Config>,
    tables: Vec<Arc<Table>>,
    clients: Clients,
    executor: Executor,
}

impl Workflow {
    /// Build the table models and create the working folders.
    pub fn new(config: Config, clients: Clients) -> Result<Self, PipelineError> {
        let tables = Table::from_config(&config)?
            .into_iter()
            .map(Arc::new)
            .collect();
        let wf = &config.workflow_config;
        let executor = Executor::new(wf.max_workers, wf.chunk_size);

        for dir in [config.download_folder(), config.decompress_folder()] {
            std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;
        }

        Ok(Self {
            config: Arc::new(config),
            tables,
            clients,
            executor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tables(&self) -> &[Arc<Table>] {
        &self.tables
    }

    /// Run `stages` (all when empty) in order, stopping at the first failure.
    pub async fn run(
        &self,
        stages: &[Stage],
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let plan = Stage::plan(stages);
        info!(
            stages = ?plan.iter().map(Stage::as_str).collect::<Vec<_>>(),
            tables = self.tables.len(),
            "Starting workflow"
        );

        for stage in plan {
            ensure!(!cancel.is_cancelled(), CancelledSnafu);

            let start = Instant::now();
            info!(stage = %stage, "Stage started");
            match stage {
                Stage::Download => self.download(cancel).await?,
                Stage::Decompress => self.decompress(cancel).await?,
                Stage::Transform => self.transform(cancel).await?,
                Stage::Upload => self.upload(self.clients.staging(stage)?, cancel).await?,
                Stage::Load => self.load(self.clients.warehouse(stage)?, cancel).await?,
                Stage::Cleanup => self.cleanup().await?,
            }
            let duration = start.elapsed();
            emit!(StageCompleted {
                stage: stage.as_str(),
                duration,
            });
            info!(stage = %stage, duration_ms = duration.as_millis(), "Stage finished");
        }

        info!("Workflow finished");
        Ok(())
    }
}
