//! openaire-loader: runs the OpenAIRE dump workflow.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use openaire::{
    Clients, Config, MetricsController, PipelineError, Stage, Workflow, cancel_on_signal,
    init_metrics, init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "openaire-loader", version, about = "Load the OpenAIRE dump into BigQuery")]
struct CliArgs {
    /// Path to the YAML config file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Stage to run; repeat for several. Runs every stage when omitted.
    #[arg(short, long = "stage", value_enum)]
    stages: Vec<Stage>,

    /// Override `workflow_config.max_workers`.
    #[arg(long)]
    max_workers: Option<usize>,
}

fn load_config(args: &CliArgs) -> Result<Config, PipelineError> {
    let mut config = Config::from_file(&args.config)?;
    if let Some(max_workers) = args.max_workers {
        config.workflow_config.max_workers = max_workers;
        config.validate()?;
    }
    Ok(config)
}

async fn run(
    config: Config,
    stages: &[Stage],
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let clients = Clients::connect(&config, stages).await?;
    let workflow = Workflow::new(config, clients)?;
    workflow.run(stages, cancel).await
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = CliArgs::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to install metrics recorder");
    }
    let textfile = config.metrics.textfile.clone();
    let stages = Stage::plan(&args.stages);

    let cancel = CancellationToken::new();
    let signals = cancel_on_signal(cancel.clone());

    info!(
        config = %args.config.display(),
        stages = ?stages.iter().map(Stage::as_str).collect::<Vec<_>>(),
        "Starting openaire-loader"
    );
    let result = run(config, &stages, &cancel).await;
    signals.abort();

    if let Some(path) = textfile {
        match MetricsController::get().and_then(|m| m.write_textfile(&path)) {
            Ok(()) => info!(path = %path.display(), "Wrote metrics textfile"),
            Err(e) => warn!(error = %e, "Failed to write metrics textfile"),
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Workflow failed");
            ExitCode::FAILURE
        }
    }
}
