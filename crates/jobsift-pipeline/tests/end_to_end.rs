use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobsift_adapters::{FixtureAdapter, SourceAdapter};
use jobsift_core::{columns, Cells, JobEvaluation, JobRecord, RawJob, Verdict, ALREADY_SEEN_LABEL};
use jobsift_pipeline::router::{ExponentialBackoff, InferenceRequest, Tier};
use jobsift_pipeline::{
    EvaluationMode, InferenceProvider, InferenceRouter, Pipeline, PipelineConfig, ProviderError,
    BATCH_SEPARATOR,
};
use jobsift_storage::{HttpClientConfig, HttpFetcher, MemoryTableStore, RowFilter, TableStore};
use tempfile::tempdir;

/// Answers every posting in a prompt with the score registered for its title.
struct TitleScoredProvider {
    scores: BTreeMap<&'static str, u8>,
    calls: Arc<Mutex<usize>>,
}

#[async_trait]
impl InferenceProvider for TitleScoredProvider {
    fn id(&self) -> &str {
        "SCRIPTED"
    }

    async fn generate(&self, request: &InferenceRequest<'_>) -> Result<String, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        let blocks = request
            .user_prompt
            .lines()
            .filter_map(|line| line.strip_prefix("Job Title: "))
            .map(|title| {
                let score = self.scores.get(title).copied().unwrap_or(0);
                format!(
                    r#"{{"apply_conviction_score": {score}, "verdict": "⚖️ Worth Considering", "recommended_resume": "Business Analyst", "h1b_sponsorship": "Unknown", "reasoning": "scored {title}", "tech_stack": ["SQL"], "skill_gaps": []}}"#
                )
            })
            .collect::<Vec<_>>();
        Ok(blocks.join(&format!("\n{BATCH_SEPARATOR}\n")))
    }
}

fn router(scores: &[(&'static str, u8)]) -> (InferenceRouter, Arc<Mutex<usize>>) {
    let calls = Arc::new(Mutex::new(0));
    let provider = TitleScoredProvider {
        scores: scores.iter().copied().collect(),
        calls: Arc::clone(&calls),
    };
    let router = InferenceRouter::new(
        vec![Tier::new(Box::new(provider)).with_max_retries(1)],
        ExponentialBackoff {
            base: 2.0,
            max_delay: Duration::ZERO,
        },
    );
    (router, calls)
}

fn new_row(title: &str, url: &str) -> Cells {
    let raw = RawJob {
        title: Some(title.into()),
        company: Some("Harbor Health".into()),
        location: Some("Remote, US".into()),
        url: Some(url.into()),
        description: Some("SQL dashboards and stakeholder workshops".into()),
        ..Default::default()
    };
    JobRecord::from_raw(&raw, chrono::Local::now()).unwrap().to_cells()
}

async fn rows(store: &MemoryTableStore, tab: &str) -> Vec<Cells> {
    store
        .get_all(&RowFilter::tab(tab))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.cells)
        .collect()
}

#[tokio::test]
async fn tracking_variants_of_one_job_are_evaluated_once() {
    let store = Arc::new(MemoryTableStore::new());
    store
        .append(
            "2026-04-02",
            &[
                new_row("Business Analyst", "https://jobs.harbor.io/ba-7?utm_source=linkedin"),
                new_row("Business Analyst", "https://jobs.harbor.io/ba-7?utm_campaign=spring#apply"),
            ],
        )
        .await
        .unwrap();
    let (router, calls) = router(&[("Business Analyst", 81)]);
    let mut pipeline = Pipeline::new(PipelineConfig::default(), store.clone(), router);

    let summary = pipeline.evaluate(EvaluationMode::New).await.expect("run");
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.already_seen, 1);
    assert_eq!(*calls.lock().unwrap(), 1);

    let tab = rows(&store, "2026-04-02").await;
    let statuses = tab
        .iter()
        .map(|r| (r[columns::STATUS].as_str(), r[columns::MATCH_TYPE].as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        [("EVALUATED", "✅ Strong Match"), ("SKIPPED", ALREADY_SEEN_LABEL)]
    );

    // A second run finds nothing left to evaluate.
    let again = pipeline.evaluate(EvaluationMode::New).await.expect("rerun");
    assert_eq!(again.candidates, 0);
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn sorting_orders_rows_by_descending_score() {
    let store = Arc::new(MemoryTableStore::new());
    let scored = [55u8, 92, 78, 10]
        .into_iter()
        .enumerate()
        .map(|(i, score)| {
            let mut cells = new_row(&format!("Business Analyst {i}"), &format!("https://x.io/{i}"));
            let evaluation = JobEvaluation {
                score: Some(score),
                verdict: jobsift_pipeline::score_to_verdict(score),
                recommended_role: "Business Analyst".into(),
                h1b_status: "Unknown".into(),
                location_verification: "Remote".into(),
                missing_skills: Vec::new(),
                reasoning: String::new(),
                salary_range: String::new(),
                tech_stack: Vec::new(),
            };
            cells.extend(JobRecord::evaluated_cells(&evaluation));
            cells
        })
        .collect::<Vec<_>>();
    store.append("2026-04-03", &scored).await.unwrap();
    let (router, _) = router(&[]);
    let pipeline = Pipeline::new(PipelineConfig::default(), store.clone(), router);

    assert_eq!(pipeline.sort_tab("2026-04-03").await.unwrap(), 4);
    let order = rows(&store, "2026-04-03")
        .await
        .iter()
        .map(|r| r[columns::APPLY_SCORE].parse::<u8>().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(order, [92, 78, 55, 10]);
}

#[tokio::test]
async fn fixture_jobs_flow_from_sourcing_to_sorted_verdicts() {
    let dir = tempdir().expect("tempdir");
    let fixture = dir.path().join("jobs.json");
    std::fs::write(
        &fixture,
        r#"[
          {"title": "Business Analyst", "company": "Harbor Health", "location": "Dallas, TX, United States",
           "job_url": "https://jobs.harbor.io/ba-1?utm_source=linkedin", "description": "SQL, Tableau and Jira."},
          {"title": "Business Analyst", "company": "Harbor Health", "location": "Dallas, TX, United States",
           "job_url": "https://jobs.harbor.io/ba-1?utm_medium=email"},
          {"title": "Product Owner", "company": "Beta Labs", "location": "Remote, US",
           "url": "https://beta.io/careers/po", "description": "Own the backlog."},
          {"title": "Senior Product Manager", "company": "Lumen", "location": "Remote, US",
           "url": "https://lumen.io/spm"}
        ]"#,
    )
    .unwrap();

    let mut config = PipelineConfig::default();
    config.sourcing.queries = vec!["analyst".into(), "product".into()];
    config.sourcing.locations = [("United States".to_string(), 10)].into_iter().collect();
    let store = Arc::new(MemoryTableStore::new());
    let (router, calls) = router(&[("Business Analyst", 88), ("Product Owner", 40)]);
    let reports = dir.path().join("reports");
    let mut pipeline = Pipeline::new(config, store.clone(), router).with_reports_dir(&reports);

    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(FixtureAdapter::new(&fixture))];
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let sourced = pipeline.source(adapters, http).await.expect("sourcing");
    assert_eq!(sourced.tasks, 2);
    assert_eq!(sourced.appended, 2);
    assert_eq!(sourced.duplicates, 1);
    assert_eq!(sourced.rejected_total(), 1);

    let summary = pipeline.evaluate(EvaluationMode::New).await.expect("evaluation");
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.fallback_scored, 0);
    assert_eq!(summary.providers.get("SCRIPTED"), Some(&2));
    assert_eq!(*calls.lock().unwrap(), 1, "both jobs fit one batch");
    assert_eq!(summary.verdict_count(Verdict::AutoApply), 1);
    assert_eq!(summary.verdict_count(Verdict::No), 1);

    let tab = rows(&store, &sourced.tab).await;
    assert_eq!(tab[0][columns::ROLE_TITLE], "Business Analyst");
    assert_eq!(tab[0][columns::MATCH_TYPE], Verdict::AutoApply.label());
    assert_eq!(tab[0][columns::JOB_LINK], "https://jobs.harbor.io/ba-1?utm_source=linkedin");
    assert_eq!(tab[1][columns::ROLE_TITLE], "Product Owner");
    assert_eq!(tab[1][columns::APPLY_SCORE], "40");

    let brief = std::fs::read_to_string(
        reports.join(summary.run_id.to_string()).join("daily_brief.md"),
    )
    .expect("daily brief");
    assert!(brief.contains("- SCRIPTED: 2"));
}
