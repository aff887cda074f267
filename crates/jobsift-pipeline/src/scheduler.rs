//! Cron-triggered pipeline runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::run_pipeline_once_from_env;

/// Build a scheduler with one job per configured cron, or `None` when scheduling is disabled.
/// The caller starts it.
pub async fn maybe_build_scheduler(config: &ScheduleConfig) -> Result<Option<JobScheduler>> {
    if !config.enabled {
        return Ok(None);
    }
    if config.crons.is_empty() {
        warn!("scheduler enabled without any cron expression");
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    // Shared across jobs so a slow run is never overlapped by the next trigger.
    let running = Arc::new(Mutex::new(()));
    for cron in &config.crons {
        let running = Arc::clone(&running);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let running = Arc::clone(&running);
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("previous scheduled run still active; skipping trigger");
                    return;
                };
                info!("scheduled pipeline run triggered");
                match run_pipeline_once_from_env().await {
                    Ok(report) => info!(
                        appended = report.sourcing.as_ref().map(|s| s.appended).unwrap_or_default(),
                        evaluated = report.evaluations.iter().map(|s| s.evaluated).sum::<usize>(),
                        "scheduled pipeline run finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled pipeline run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    info!(jobs = config.crons.len(), "scheduler built");
    Ok(Some(sched))
}
