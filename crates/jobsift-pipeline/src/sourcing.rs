//! Sourcing runs: fan out `adapter x query x location` searches over a bounded worker pool and
//! append the filtered, deduplicated postings to today's tab from a single writer.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use jobsift_adapters::{adapter_for_source, AdapterContext, SearchTarget, SourceAdapter};
use jobsift_core::{JobRecord, RawJob};
use jobsift_storage::{HttpFetcher, RowFilter};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::orchestrator::Pipeline;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourcingSummary {
    pub run_id: Uuid,
    /// Tab the new rows were appended to.
    pub tab: String,
    pub tasks: usize,
    pub failed_tasks: usize,
    pub fetched: usize,
    pub missing_url: usize,
    /// Rejection reason -> count.
    pub rejected: BTreeMap<String, usize>,
    pub duplicates: usize,
    pub appended: usize,
}

impl SourcingSummary {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// Instantiate adapters by id, skipping ids nothing is registered for.
pub fn resolve_adapters(ids: &[String]) -> Vec<Arc<dyn SourceAdapter>> {
    ids.iter()
        .filter_map(|id| match adapter_for_source(id) {
            Some(adapter) => Some(Arc::from(adapter)),
            None => {
                warn!(adapter = %id, "unknown source adapter; skipping");
                None
            }
        })
        .collect()
}

struct TaskOutcome {
    source: &'static str,
    target: SearchTarget,
    jobs: Result<Vec<RawJob>, String>,
}

impl Pipeline {
    /// One sourcing pass. Adapter failures only cost the failing task.
    pub async fn source(
        &mut self,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http: Arc<HttpFetcher>,
    ) -> Result<SourcingSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sourcing_run", %run_id);
        self.source_inner(run_id, adapters, http).instrument(span).await
    }

    async fn source_inner(
        &mut self,
        run_id: Uuid,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http: Arc<HttpFetcher>,
    ) -> Result<SourcingSummary> {
        let tab = Local::now().format("%Y-%m-%d").to_string();
        let mut summary = SourcingSummary {
            run_id,
            tab: tab.clone(),
            ..Default::default()
        };

        let mut seen = self
            .store
            .get_all(&RowFilter::all())
            .await
            .context("reading job table")?
            .iter()
            .map(|stored| JobRecord::from_cells(stored.row.clone(), &stored.cells))
            .filter(|r| !r.canonical_url.is_empty())
            .map(|r| r.canonical_url)
            .collect::<HashSet<_>>();

        let ctx = AdapterContext::new(run_id);
        let limiter = Arc::new(Semaphore::new(self.config.sourcing.max_workers.max(1)));
        let mut join_set = JoinSet::new();

        for adapter in &adapters {
            for query in &self.config.sourcing.queries {
                for (location, results_wanted) in &self.config.sourcing.locations {
                    let target = SearchTarget {
                        query: query.clone(),
                        location: location.clone(),
                        results_wanted: *results_wanted,
                    };
                    let adapter = Arc::clone(adapter);
                    let http = Arc::clone(&http);
                    let ctx = ctx.clone();
                    let limiter = Arc::clone(&limiter);
                    join_set.spawn(async move {
                        let permit = limiter.acquire_owned().await;
                        let jobs = adapter
                            .search(&http, &ctx, &target)
                            .await
                            .map_err(|e| e.to_string());
                        drop(permit);
                        TaskOutcome {
                            source: adapter.source_id(),
                            target,
                            jobs,
                        }
                    });
                    summary.tasks += 1;
                }
            }
        }
        info!(tasks = summary.tasks, adapters = adapters.len(), known_urls = seen.len(), "sourcing run started");

        let mut rows = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "sourcing task aborted");
                    summary.failed_tasks += 1;
                    continue;
                }
            };
            let jobs = match outcome.jobs {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(
                        source = outcome.source,
                        query = %outcome.target.query,
                        location = %outcome.target.location,
                        error = %err,
                        "search failed"
                    );
                    summary.failed_tasks += 1;
                    continue;
                }
            };
            debug!(
                source = outcome.source,
                query = %outcome.target.query,
                location = %outcome.target.location,
                jobs = jobs.len(),
                "search finished"
            );
            summary.fetched += jobs.len();

            for mut raw in jobs {
                if raw.source.is_none() {
                    raw.source = Some(outcome.source.to_string());
                }
                let decision = self.filters.sourcing(&raw);
                if !decision.passed() {
                    debug!(title = raw.title(), reason = %decision.reason, "rejected at sourcing");
                    *summary.rejected.entry(decision.reason).or_default() += 1;
                    continue;
                }
                let Some(record) = JobRecord::from_raw(&raw, Local::now()) else {
                    summary.missing_url += 1;
                    continue;
                };
                if !seen.insert(record.canonical_url.clone()) {
                    summary.duplicates += 1;
                    continue;
                }
                self.descriptions
                    .insert(&record.canonical_url, &record.description);
                rows.push(record.to_cells());
            }
        }

        if !rows.is_empty() {
            self.store
                .append(&tab, &rows)
                .await
                .with_context(|| format!("appending to tab {tab}"))?;
        }
        summary.appended = rows.len();

        if let Err(err) = self.descriptions.flush().await {
            warn!(error = %err, "description cache could not be written");
        }

        info!(
            tab = %summary.tab,
            fetched = summary.fetched,
            rejected = summary.rejected_total(),
            duplicates = summary.duplicates,
            appended = summary.appended,
            failed_tasks = summary.failed_tasks,
            "sourcing run finished"
        );
        Ok(summary)
    }
}
