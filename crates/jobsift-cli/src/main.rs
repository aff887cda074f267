use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use jobsift_core::Verdict;
use jobsift_pipeline::scheduler::maybe_build_scheduler;
use jobsift_pipeline::{resolve_adapters, EvaluationMode, Pipeline, PipelineConfig};
use jobsift_storage::{HttpClientConfig, HttpFetcher};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobsift")]
#[command(about = "Job posting sourcing and evaluation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull postings from the configured adapters into today's tab.
    Source,
    /// Evaluate NEW rows, or re-evaluate rows carrying a verdict.
    Evaluate {
        /// Verdict to re-evaluate: auto-apply, strong-match, worth-considering or no.
        #[arg(long)]
        reevaluate: Option<String>,
    },
    /// Source, then evaluate until the high-tier goal is met.
    Run,
    /// Re-sort every tab.
    Sort,
    /// Run the pipeline on the configured cron schedule until interrupted.
    Schedule,
}

fn parse_verdict(value: &str) -> Result<Verdict> {
    let normalized = value.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
    Verdict::ALL
        .into_iter()
        .find(|v| v.name().to_ascii_lowercase().replace(['-', '_', ' '], "") == normalized)
        .or_else(|| Verdict::from_label(value))
        .ok_or_else(|| anyhow!("unknown verdict {value:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Source => {
            let adapters = resolve_adapters(&config.sourcing.adapters);
            let mut pipeline = Pipeline::from_config(config).await?;
            let http = HttpFetcher::new(HttpClientConfig::default())?;
            let summary = pipeline.source(adapters, Arc::new(http)).await?;
            println!(
                "source complete: run_id={} tab={} fetched={} rejected={} duplicates={} appended={}",
                summary.run_id,
                summary.tab,
                summary.fetched,
                summary.rejected_total(),
                summary.duplicates,
                summary.appended
            );
        }
        Commands::Evaluate { reevaluate } => {
            let mode = match reevaluate {
                Some(value) => EvaluationMode::Reevaluate(parse_verdict(&value)?),
                None => EvaluationMode::New,
            };
            let mut pipeline = Pipeline::from_config(config).await?;
            let summary = pipeline.evaluate(mode).await?;
            println!(
                "evaluate complete: run_id={} mode={} evaluated={} already_seen={} filtered={} fallback={}",
                summary.run_id,
                summary.mode,
                summary.evaluated,
                summary.already_seen,
                summary.filtered,
                summary.fallback_scored
            );
        }
        Commands::Run => {
            let report = jobsift_pipeline::run_pipeline_once(config).await?;
            let appended = report.sourcing.as_ref().map(|s| s.appended).unwrap_or_default();
            let evaluated = report.evaluations.iter().map(|s| s.evaluated).sum::<usize>();
            let high_tier = report
                .evaluations
                .iter()
                .map(|s| s.high_tier_count())
                .sum::<usize>();
            println!(
                "run complete: appended={appended} passes={} evaluated={evaluated} high_tier={high_tier}",
                report.evaluations.len()
            );
        }
        Commands::Sort => {
            let pipeline = Pipeline::from_config(config).await?;
            let tabs = pipeline.sort_all().await?;
            println!("sort complete: tabs={tabs}");
        }
        Commands::Schedule => {
            let Some(mut sched) = maybe_build_scheduler(&config.schedule).await? else {
                eprintln!("scheduler disabled; set schedule.enabled or JOBSIFT_SCHEDULER_ENABLED=1");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(crons = ?config.schedule.crons, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_names_and_labels_both_parse() {
        assert_eq!(parse_verdict("worth-considering").unwrap(), Verdict::WorthConsidering);
        assert_eq!(parse_verdict("Strong_Match").unwrap(), Verdict::StrongMatch);
        assert_eq!(parse_verdict("🔥 Auto-Apply").unwrap(), Verdict::AutoApply);
        assert_eq!(parse_verdict("maybe").unwrap(), Verdict::WorthConsidering);
        assert!(parse_verdict("sometimes").is_err());
    }

    #[test]
    fn cli_accepts_reevaluate_flag() {
        let cli = Cli::parse_from(["jobsift", "evaluate", "--reevaluate", "worth-considering"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Evaluate { reevaluate: Some(ref v) }) if v == "worth-considering"
        ));
    }
}
