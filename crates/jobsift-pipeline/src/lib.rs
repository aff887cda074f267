//! Job evaluation pipeline: sourcing, rule filters, tiered inference, scoring and reports.

use std::sync::Arc;

use anyhow::{Context, Result};
use jobsift_storage::{HttpClientConfig, HttpFetcher};
use serde::Serialize;
use tracing::warn;

pub mod config;
pub mod filter;
pub mod intel;
pub mod orchestrator;
pub mod parser;
pub mod profile;
pub mod prompt;
pub mod providers;
pub mod report;
pub mod router;
pub mod scheduler;
pub mod scoring;
pub mod sourcing;

pub use config::PipelineConfig;
pub use filter::{FilterDecision, FilterEngine, FilterPolicy, FilterRule, FilterTables};
pub use orchestrator::{EvaluationMode, Pipeline, INFERENCE_UNAVAILABLE};
pub use parser::{parse, split_batch_response, BATCH_ARRAY_KEY, BATCH_SEPARATOR};
pub use report::RunSummary;
pub use router::{InferenceOutcome, InferenceProvider, InferenceRouter, ProviderError, ProviderId};
pub use scoring::{score_to_verdict, Scorer};
pub use sourcing::{resolve_adapters, SourcingSummary};

/// Outcome of a full `source -> evaluate` pass.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunReport {
    /// `None` when no adapter was configured.
    pub sourcing: Option<SourcingSummary>,
    pub evaluations: Vec<RunSummary>,
}

/// Source with every configured adapter, then evaluate until the high-tier goal is met.
pub async fn run_pipeline_once(config: PipelineConfig) -> Result<PipelineRunReport> {
    let adapters = resolve_adapters(&config.sourcing.adapters);
    let mut pipeline = Pipeline::from_config(config).await?;

    let sourcing = if adapters.is_empty() {
        warn!("no source adapters configured; evaluating existing rows only");
        None
    } else {
        let http = HttpFetcher::new(HttpClientConfig::default()).context("building http client")?;
        Some(pipeline.source(adapters, Arc::new(http)).await?)
    };

    let evaluations = pipeline.run_until_target().await?;
    Ok(PipelineRunReport {
        sourcing,
        evaluations,
    })
}

/// Run once with configuration read from the environment, as scheduled triggers do.
pub(crate) async fn run_pipeline_once_from_env() -> Result<PipelineRunReport> {
    run_pipeline_once(PipelineConfig::from_env()).await
}
