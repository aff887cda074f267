//! Evaluation runs: dedup, prefilter, batched inference, checkpointing and the final sort.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use jobsift_core::{EvaluationResult, JobEvaluation, JobRecord, JobStatus, MatchType, Verdict};
use jobsift_storage::{CsvTableStore, DescriptionCache, RowFilter, RowUpdate, TableStore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::filter::FilterEngine;
use crate::intel::{IntelCache, IntelPaths};
use crate::parser::split_batch_response;
use crate::profile::ProfileContext;
use crate::prompt::{build_user_prompt, load_system_prompt, JobContext, DEFAULT_SYSTEM_PROMPT};
use crate::providers::build_router;
use crate::report::{write_run_report, RunSummary};
use crate::router::{FormatHint, InferenceRouter};
use crate::scoring::{score_to_verdict, Scorer};

/// Reasoning written when no tier produced a response.
pub const INFERENCE_UNAVAILABLE: &str = "Inference unavailable on all tiers";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// `NEW` rows: dedup, prefilter, then inference.
    New,
    /// Already evaluated rows carrying the given verdict. Dedup and prefilter are skipped.
    Reevaluate(Verdict),
}

impl EvaluationMode {
    fn selects(&self, record: &JobRecord) -> bool {
        match self {
            Self::New => record.status == JobStatus::New,
            Self::Reevaluate(verdict) => {
                record.status == JobStatus::Evaluated
                    && record.match_type == Some(MatchType::Verdict(*verdict))
            }
        }
    }
}

impl fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("NEW"),
            Self::Reevaluate(verdict) => write!(f, "REEVALUATE {}", verdict.name()),
        }
    }
}

/// Buffers row updates and writes them every `interval` processed jobs.
struct Checkpointer {
    pending: Vec<RowUpdate>,
    interval: usize,
    flushes: usize,
}

impl Checkpointer {
    fn new(interval: usize) -> Self {
        Self {
            pending: Vec::new(),
            interval: interval.max(1),
            flushes: 0,
        }
    }

    async fn push(&mut self, store: &dyn TableStore, update: RowUpdate) -> Result<()> {
        self.pending.push(update);
        if self.pending.len() >= self.interval {
            self.flush(store).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, store: &dyn TableStore) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        store
            .update(&self.pending)
            .await
            .context("writing evaluation checkpoint")?;
        self.flushes += 1;
        info!(rows = self.pending.len(), checkpoint = self.flushes, "checkpoint written");
        self.pending.clear();
        Ok(())
    }
}

/// Everything a run needs, passed explicitly instead of living in module state.
pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) store: Arc<dyn TableStore>,
    pub(crate) router: InferenceRouter,
    pub(crate) filters: FilterEngine,
    pub(crate) scorer: Scorer,
    pub(crate) intel: IntelCache,
    pub(crate) descriptions: DescriptionCache,
    pub(crate) profile: ProfileContext,
    pub(crate) system_prompt: String,
    pub(crate) reports_dir: Option<PathBuf>,
}

impl Pipeline {
    /// Pipeline with in-memory caches, no profile and no reports.
    pub fn new(config: PipelineConfig, store: Arc<dyn TableStore>, router: InferenceRouter) -> Self {
        Self {
            filters: FilterEngine::new(&config.filters),
            scorer: Scorer::new(config.scoring.clone()),
            config,
            store,
            router,
            intel: IntelCache::in_memory(),
            descriptions: DescriptionCache::in_memory(),
            profile: ProfileContext::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            reports_dir: None,
        }
    }

    /// Wire the CSV store, HTTP providers and on-disk caches named in `config.paths`.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let paths = config.paths.clone();
        let store: Arc<dyn TableStore> = Arc::new(CsvTableStore::new(&paths.store_dir));
        let router = build_router(&config).context("building inference router")?;
        let intel = IntelCache::load(IntelPaths::in_dir(&paths.data_dir)).await;
        let descriptions = DescriptionCache::load(&paths.jd_cache).await;
        Ok(Self::new(config, store, router)
            .with_intel(intel)
            .with_descriptions(descriptions)
            .with_profile(ProfileContext::load(&paths.profile))
            .with_system_prompt(load_system_prompt(&paths.system_prompt))
            .with_reports_dir(paths.reports_dir))
    }

    pub fn with_intel(mut self, intel: IntelCache) -> Self {
        self.intel = intel;
        self
    }

    pub fn with_descriptions(mut self, descriptions: DescriptionCache) -> Self {
        self.descriptions = descriptions;
        self
    }

    pub fn with_profile(mut self, profile: ProfileContext) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: String) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(reports_dir.into());
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    pub fn intel(&self) -> &IntelCache {
        &self.intel
    }

    pub fn descriptions(&self) -> &DescriptionCache {
        &self.descriptions
    }

    /// One evaluation pass over the rows selected by `mode`, capped at `evaluation.limit`.
    pub async fn evaluate(&mut self, mode: EvaluationMode) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("evaluation_run", %run_id, mode = %mode);
        self.evaluate_inner(run_id, mode).instrument(span).await
    }

    async fn evaluate_inner(&mut self, run_id: Uuid, mode: EvaluationMode) -> Result<RunSummary> {
        let mut summary = RunSummary::new(run_id, mode.to_string());
        let rows = self
            .store
            .get_all(&RowFilter::all())
            .await
            .context("reading job table")?;
        let records = rows
            .iter()
            .map(|stored| JobRecord::from_cells(stored.row.clone(), &stored.cells))
            .collect::<Vec<_>>();

        let mut seen = records
            .iter()
            .filter(|r| r.is_dedup_anchor() && !r.canonical_url.is_empty())
            .map(|r| r.canonical_url.clone())
            .collect::<HashSet<_>>();
        let mut candidates = records
            .into_iter()
            .filter(|r| mode.selects(r))
            .take(self.config.evaluation.limit)
            .collect::<Vec<_>>();
        for record in &mut candidates {
            if let Some(description) = self.descriptions.get(&record.canonical_url) {
                record.description = description.to_string();
            }
        }
        summary.candidates = candidates.len();
        info!(candidates = candidates.len(), anchors = seen.len(), "evaluation run started");

        let mut checkpoint = Checkpointer::new(self.config.evaluation.checkpoint_interval);
        let mut touched_tabs = BTreeSet::new();
        let mut queue = Vec::new();

        for record in candidates {
            let Some(row) = record.row.clone() else {
                continue;
            };
            touched_tabs.insert(row.tab.clone());

            if mode == EvaluationMode::New {
                if !record.canonical_url.is_empty() && !seen.insert(record.canonical_url.clone()) {
                    info!(title = %record.title, company = %record.company, url = %record.canonical_url, "already seen; skipping");
                    summary.already_seen += 1;
                    checkpoint
                        .push(
                            self.store.as_ref(),
                            RowUpdate {
                                row,
                                cells: JobRecord::already_seen_cells(),
                            },
                        )
                        .await?;
                    continue;
                }

                let decision = self.filters.prefilter(&record);
                if !decision.passed() {
                    info!(title = %record.title, reason = %decision.reason, "rejected by prefilter");
                    let evaluation = JobEvaluation::rejected(&decision.reason);
                    summary.filtered += 1;
                    summary.record_verdict(evaluation.verdict);
                    checkpoint
                        .push(
                            self.store.as_ref(),
                            RowUpdate {
                                row,
                                cells: JobRecord::evaluated_cells(&evaluation),
                            },
                        )
                        .await?;
                    continue;
                }
            }
            queue.push(record);
        }

        let batch_size = self.config.evaluation.batch_size.max(1);
        for (index, chunk) in queue.chunks(batch_size).enumerate() {
            let span = info_span!("inference_batch", batch = index + 1, jobs = chunk.len());
            let evaluations = self
                .evaluate_batch(chunk, &mut summary)
                .instrument(span)
                .await;
            for (job, evaluation) in chunk.iter().zip(evaluations) {
                let Some(row) = job.row.clone() else {
                    continue;
                };
                info!(
                    title = %job.title,
                    company = %job.company,
                    score = evaluation.score.unwrap_or_default(),
                    verdict = %evaluation.verdict,
                    "job evaluated"
                );
                summary.evaluated += 1;
                summary.record_verdict(evaluation.verdict);
                checkpoint
                    .push(
                        self.store.as_ref(),
                        RowUpdate {
                            row,
                            cells: JobRecord::evaluated_cells(&evaluation),
                        },
                    )
                    .await?;
            }
        }

        checkpoint.flush(self.store.as_ref()).await?;
        summary.checkpoints = checkpoint.flushes;

        match self.intel.flush().await {
            Ok(true) => debug!("intel caches persisted"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "intel caches could not be written"),
        }
        if let Err(err) = self.descriptions.flush().await {
            warn!(error = %err, "description cache could not be written");
        }

        for tab in &touched_tabs {
            self.sort_tab(tab).await?;
        }

        summary.finish();
        if let Some(warning) = summary.calibration_warning() {
            warn!(%warning, "calibration warning");
        }
        info!(
            evaluated = summary.evaluated,
            already_seen = summary.already_seen,
            filtered = summary.filtered,
            fallback_scored = summary.fallback_scored,
            inference_failed = summary.inference_failed,
            "evaluation run finished"
        );

        if let Some(dir) = &self.reports_dir {
            match write_run_report(dir, &summary).await {
                Ok(path) => info!(path = %path.display(), "run report written"),
                Err(err) => warn!(error = %err, "run report could not be written"),
            }
        }
        Ok(summary)
    }

    /// One inference call for `chunk`. Always yields one evaluation per job, in order.
    async fn evaluate_batch(
        &mut self,
        chunk: &[JobRecord],
        summary: &mut RunSummary,
    ) -> Vec<JobEvaluation> {
        let contexts = chunk
            .iter()
            .map(|job| {
                if job.description.trim().is_empty() {
                    warn!(title = %job.title, company = %job.company, "empty job description; fit estimated from title and location");
                }
                let overlap = self
                    .scorer
                    .keyword_overlap(&job.description, &self.profile.keywords);
                JobContext {
                    title: &job.title,
                    company: &job.company,
                    location: &job.location,
                    url: &job.url,
                    description: &job.description,
                    sponsorship_hint: self.intel.sponsorship(&job.company).map(|f| f.label()),
                    location_priority: self.scorer.location_priority(&job.location),
                    nudge_threshold: self
                        .scorer
                        .needs_overlap_nudge(overlap)
                        .then_some(self.scorer.config().overlap_nudge_threshold),
                }
            })
            .collect::<Vec<_>>();
        let format = self.config.evaluation.json_mode.then_some(FormatHint::Json);
        let user_prompt = build_user_prompt(&self.profile.summary, &contexts, format);

        let outcome = self
            .router
            .generate(&self.system_prompt, &user_prompt, format)
            .await;
        let failed = outcome.is_failed();
        let results = if failed {
            warn!(jobs = chunk.len(), "inference failed for batch; using fallback scores");
            summary.inference_failed += chunk.len();
            vec![EvaluationResult::unparsed(); chunk.len()]
        } else {
            *summary
                .providers
                .entry(outcome.provider.to_string())
                .or_default() += chunk.len();
            split_batch_response(&outcome.text, chunk.len())
        };

        let mut evaluations = Vec::with_capacity(chunk.len());
        for (job, result) in chunk.iter().zip(results) {
            if !failed && result != EvaluationResult::unparsed() {
                self.intel.record_evaluation(job, &result);
            }
            evaluations.push(self.finalize(job, result, failed, summary));
        }
        evaluations
    }

    /// Settle the score and derive the verdict from it.
    fn finalize(
        &self,
        job: &JobRecord,
        result: EvaluationResult,
        inference_failed: bool,
        summary: &mut RunSummary,
    ) -> JobEvaluation {
        let score = if result.has_score() {
            result.score
        } else {
            summary.fallback_scored += 1;
            let score = self
                .scorer
                .fallback_score(&job.description, &job.location, &self.profile.keywords);
            debug!(title = %job.title, score, "no parsed score; fallback scorer used");
            score
        };
        let verdict = score_to_verdict(score);
        if let Some(declared) = result.declared_verdict.as_deref() {
            if Verdict::from_label(declared) != Some(verdict) {
                debug!(title = %job.title, %declared, %verdict, "declared verdict replaced by score");
            }
        }
        JobEvaluation {
            score: Some(score),
            verdict,
            recommended_role: result.recommended_role,
            h1b_status: result.h1b_status,
            location_verification: result.location_verification,
            missing_skills: result.missing_skills,
            reasoning: if inference_failed {
                INFERENCE_UNAVAILABLE.to_string()
            } else {
                result.reasoning
            },
            salary_range: result.salary_range,
            tech_stack: result.tech_stack,
        }
    }

    /// Rewrite `tab` in sort order. Returns the number of rows written.
    pub async fn sort_tab(&self, tab: &str) -> Result<usize> {
        let rows = self
            .store
            .get_all(&RowFilter::tab(tab))
            .await
            .with_context(|| format!("reading tab {tab}"))?;
        let mut keyed = rows
            .into_iter()
            .map(|stored| {
                let key = self
                    .scorer
                    .sort_key(&JobRecord::from_cells(stored.row.clone(), &stored.cells));
                (key, stored.cells)
            })
            .collect::<Vec<_>>();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let cells = keyed.into_iter().map(|(_, cells)| cells).collect::<Vec<_>>();
        self.store
            .rewrite_sorted(tab, &cells)
            .await
            .with_context(|| format!("rewriting tab {tab}"))?;
        info!(tab, rows = cells.len(), "tab sorted");
        Ok(cells.len())
    }

    /// Sort every tab in the store.
    pub async fn sort_all(&self) -> Result<usize> {
        let tabs = self.store.tabs().await.context("listing tabs")?;
        for tab in &tabs {
            self.sort_tab(tab).await?;
        }
        Ok(tabs.len())
    }

    /// Repeat `NEW` passes until `target_high_tier` high-tier verdicts are collected, the store
    /// runs out of `NEW` rows, or `max_iterations` is hit.
    pub async fn run_until_target(&mut self) -> Result<Vec<RunSummary>> {
        let target = self.config.evaluation.target_high_tier;
        if target == 0 {
            return Ok(vec![self.evaluate(EvaluationMode::New).await?]);
        }
        let max_iterations = self.config.evaluation.max_iterations.max(1);
        let mut collected = 0;
        let mut runs = Vec::new();
        for iteration in 1..=max_iterations {
            let summary = self.evaluate(EvaluationMode::New).await?;
            collected += summary.high_tier_count();
            let exhausted = summary.candidates == 0;
            runs.push(summary);
            info!(iteration, collected, target, "goal-seeking iteration finished");
            if collected >= target {
                info!(collected, "high-tier target reached");
                break;
            }
            if exhausted {
                info!(collected, target, "no NEW rows left before target");
                break;
            }
            if iteration == max_iterations {
                warn!(collected, target, max_iterations, "iteration cap reached before target");
            }
        }
        Ok(runs)
    }
}
