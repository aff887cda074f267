use std::path::{Path, PathBuf};

use jobsift_adapters::{
    load_raw_jobs, parse_arbeitnow, parse_remotive, AdapterContext, FixtureAdapter, SearchTarget,
    SourceAdapter,
};
use jobsift_storage::{HttpClientConfig, HttpFetcher};
use uuid::Uuid;

fn fixture(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(relative)
}

#[test]
fn remotive_fixture_decodes_into_raw_jobs() {
    let body = std::fs::read(fixture("remotive/search.json")).expect("fixture");
    let jobs = parse_remotive(&body, 10).expect("parse");

    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].title.as_deref(), Some("Product Manager, Growth"));
    assert_eq!(jobs[0].location.as_deref(), Some("Remote (USA)"));
    assert_eq!(
        jobs[0].description.as_deref(),
        Some("Own the\nactivation roadmap\n.\nSQL\nA/B testing\nJira")
    );
    assert_eq!(jobs[1].location, None);
    assert_eq!(jobs[1].description.as_deref(), Some(""));
}

#[test]
fn arbeitnow_fixture_keeps_matching_titles_only() {
    let body = std::fs::read(fixture("arbeitnow/job-board.json")).expect("fixture");
    let jobs = parse_arbeitnow(&body, "Product Owner", 10).expect("parse");

    let titles = jobs
        .iter()
        .map(|j| j.title.as_deref().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["Product Owner Payments (m/w/d)", "Product Owner Platform"]);
    assert_eq!(jobs[1].location.as_deref(), Some("Remote"));

    let capped = parse_arbeitnow(&body, "product owner", 1).expect("parse");
    assert_eq!(capped.len(), 1);
}

#[test]
fn raw_job_file_accepts_scraper_aliases() {
    let jobs = load_raw_jobs(fixture("raw_jobs/sample.json")).expect("load");
    assert_eq!(jobs.len(), 5);
    assert_eq!(jobs[0].source.as_deref(), Some("linkedin"));
    assert!(jobs[0].url().contains("utm_source"));
    assert_eq!(jobs[1].source.as_deref(), Some("fixture"));
    assert_eq!(jobs[4].url, None);
}

#[tokio::test]
async fn fixture_adapter_filters_by_query() {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
    let adapter = FixtureAdapter::new(fixture("raw_jobs/sample.json"));
    let ctx = AdapterContext::new(Uuid::new_v4());
    let target = SearchTarget {
        query: "business analyst".into(),
        location: "United States".into(),
        results_wanted: 10,
    };

    let jobs = adapter.search(&http, &ctx, &target).await.expect("search");
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.title() == "Business Analyst"));
}
