//! Scraper adapter contract and the job-board adapters that feed the pipeline.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsift_core::RawJob;
use jobsift_storage::{FetchError, HttpFetcher};
use scraper::Html;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

/// One `(query, location)` sourcing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTarget {
    pub query: String,
    pub location: String,
    pub results_wanted: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Return raw postings for one target. Every field of the result is optional.
    async fn search(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &SearchTarget,
    ) -> Result<Vec<RawJob>, AdapterError>;
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Flatten an HTML description into plain text, one text run per line.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    fragment
        .root_element()
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect()
}

fn title_matches_query(title: &str, terms: &[String]) -> bool {
    let title = title.to_lowercase();
    terms.iter().all(|t| title.contains(t.as_str()))
}

#[derive(Debug, Deserialize)]
struct RemotiveFeed {
    #[serde(default)]
    jobs: Vec<RemotiveJob>,
}

#[derive(Debug, Deserialize)]
struct RemotiveJob {
    url: Option<String>,
    title: Option<String>,
    company_name: Option<String>,
    candidate_required_location: Option<String>,
    description: Option<String>,
}

/// Decode a Remotive `remote-jobs` payload.
pub fn parse_remotive(body: &[u8], limit: usize) -> Result<Vec<RawJob>, AdapterError> {
    let feed: RemotiveFeed = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Message(format!("invalid remotive payload: {e}")))?;
    Ok(feed
        .jobs
        .into_iter()
        .take(limit)
        .map(|job| RawJob {
            title: job.title.and_then(text_or_none),
            company: job.company_name.and_then(text_or_none),
            location: job
                .candidate_required_location
                .and_then(text_or_none)
                .map(|loc| format!("Remote ({loc})")),
            url: job.url.and_then(text_or_none),
            source: Some("remotive".to_string()),
            description: job.description.map(|d| html_to_text(&d)),
        })
        .collect())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemotiveAdapter;

impl RemotiveAdapter {
    const ENDPOINT: &'static str = "https://remotive.com/api/remote-jobs";

    fn search_url(target: &SearchTarget) -> Result<Url, AdapterError> {
        let limit = target.results_wanted.to_string();
        Url::parse_with_params(
            Self::ENDPOINT,
            [("search", target.query.as_str()), ("limit", limit.as_str())],
        )
        .map_err(|e| AdapterError::Message(format!("building remotive url: {e}")))
    }
}

#[async_trait]
impl SourceAdapter for RemotiveAdapter {
    fn source_id(&self) -> &'static str {
        "remotive"
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &SearchTarget,
    ) -> Result<Vec<RawJob>, AdapterError> {
        let url = Self::search_url(target)?;
        let response = http
            .fetch_bytes(ctx.run_id, self.source_id(), url.as_str())
            .await?;
        let jobs = parse_remotive(&response.body, target.results_wanted)?;
        debug!(source = self.source_id(), query = %target.query, jobs = jobs.len(), "remotive search parsed");
        Ok(jobs)
    }
}

#[derive(Debug, Deserialize)]
struct ArbeitnowFeed {
    #[serde(default)]
    data: Vec<ArbeitnowJob>,
}

#[derive(Debug, Deserialize)]
struct ArbeitnowJob {
    url: Option<String>,
    title: Option<String>,
    company_name: Option<String>,
    location: Option<String>,
    #[serde(default)]
    remote: bool,
    description: Option<String>,
}

/// Decode an Arbeitnow job-board page, keeping only titles that contain every query term.
pub fn parse_arbeitnow(body: &[u8], query: &str, limit: usize) -> Result<Vec<RawJob>, AdapterError> {
    let feed: ArbeitnowFeed = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Message(format!("invalid arbeitnow payload: {e}")))?;
    let terms = query_terms(query);
    Ok(feed
        .data
        .into_iter()
        .filter(|job| title_matches_query(job.title.as_deref().unwrap_or_default(), &terms))
        .take(limit)
        .map(|job| {
            let location = job.location.and_then(text_or_none);
            let location = match (location, job.remote) {
                (Some(loc), true) => Some(format!("{loc} (Remote)")),
                (None, true) => Some("Remote".to_string()),
                (loc, false) => loc,
            };
            RawJob {
                title: job.title.and_then(text_or_none),
                company: job.company_name.and_then(text_or_none),
                location,
                url: job.url.and_then(text_or_none),
                source: Some("arbeitnow".to_string()),
                description: job.description.map(|d| html_to_text(&d)),
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArbeitnowAdapter;

#[async_trait]
impl SourceAdapter for ArbeitnowAdapter {
    fn source_id(&self) -> &'static str {
        "arbeitnow"
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &SearchTarget,
    ) -> Result<Vec<RawJob>, AdapterError> {
        let response = http
            .fetch_bytes(
                ctx.run_id,
                self.source_id(),
                "https://www.arbeitnow.com/api/job-board-api",
            )
            .await?;
        Ok(parse_arbeitnow(
            &response.body,
            &target.query,
            target.results_wanted,
        )?)
    }
}

/// Serves raw job JSON files from disk, for offline runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn load_raw_jobs(path: impl AsRef<Path>) -> Result<Vec<RawJob>> {
    let jobs: Vec<RawJob> = read_json_file(path.as_ref())?;
    Ok(jobs
        .into_iter()
        .map(|mut job| {
            if job.source.is_none() {
                job.source = Some("fixture".to_string());
            }
            job
        })
        .collect())
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
        target: &SearchTarget,
    ) -> Result<Vec<RawJob>, AdapterError> {
        let terms = query_terms(&target.query);
        Ok(load_raw_jobs(&self.path)?
            .into_iter()
            .filter(|job| title_matches_query(job.title(), &terms))
            .take(target.results_wanted)
            .collect())
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "remotive" => Some(Box::new(RemotiveAdapter)),
        "arbeitnow" => Some(Box::new(ArbeitnowAdapter)),
        _ => source_id
            .strip_prefix("fixture:")
            .map(|path| Box::new(FixtureAdapter::new(path)) as Box<dyn SourceAdapter>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_descriptions_flatten_to_lines() {
        let text = html_to_text("<p>Own the <b>roadmap</b></p><ul><li>SQL</li><li> Jira </li></ul>");
        assert_eq!(text, "Own the\nroadmap\nSQL\nJira");
    }

    #[test]
    fn arbeitnow_filters_on_every_query_term() {
        let body = br#"{"data":[
            {"url":"https://a.io/1","title":"Product Manager Payments","company_name":"A","location":"Berlin","remote":true,"description":"<p>x</p>"},
            {"url":"https://a.io/2","title":"Backend Engineer","company_name":"B","location":"Munich","remote":false,"description":""}
        ]}"#;
        let jobs = parse_arbeitnow(body, "product manager", 10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].location.as_deref(), Some("Berlin (Remote)"));
        assert_eq!(jobs[0].source.as_deref(), Some("arbeitnow"));
    }

    #[test]
    fn remotive_search_url_encodes_query() {
        let target = SearchTarget {
            query: "product owner".into(),
            location: "Remote".into(),
            results_wanted: 15,
        };
        let url = RemotiveAdapter::search_url(&target).unwrap();
        assert_eq!(
            url.as_str(),
            "https://remotive.com/api/remote-jobs?search=product+owner&limit=15"
        );
    }

    #[test]
    fn unknown_sources_have_no_adapter() {
        assert!(adapter_for_source("remotive").is_some());
        assert!(adapter_for_source("fixture:/tmp/jobs.json").is_some());
        assert!(adapter_for_source("linkedin").is_none());
    }
}
