//! OpenAIRE dump loader.
//!
//! Downloads the multi-part OpenAIRE graph dump from Zenodo, strips nulls
//! from selected array fields, stages the parts in Cloud Storage and bulk
//! loads them into BigQuery. Every stage works out what is left to do from
//! the files on disk and the objects already staged, so an interrupted run
//! can simply be started again.

pub mod clients;
pub mod config;
pub mod delta;
pub mod error;
pub mod executor;
pub mod load;
pub mod part;
pub mod pipeline;
pub mod sanitize;
pub mod state;
pub mod table;

pub use config::{Config, WriteMode};
pub use error::PipelineError;
pub use pipeline::{Clients, Stage, Workflow};
pub use table::Table;

pub use openaire_core::{
    MetricsController, StorageProvider, cancel_on_signal, init_metrics, init_tracing,
};
