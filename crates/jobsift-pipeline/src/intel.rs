//! Learned facts that enrich later evaluations: sponsorship history, skill-gap frequency,
//! salary observations and per-company tech stacks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobsift_core::{EvaluationResult, JobRecord};
use jobsift_storage::write_atomic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::fs;
use tracing::{debug, info, warn};

/// Minimum Jaro-Winkler similarity for a fuzzy company match.
pub const COMPANY_MATCH_THRESHOLD: f64 = 0.95;

const COMPANY_SUFFIXES: &[&str] = &[
    "inc",
    "llc",
    "ltd",
    "corp",
    "corporation",
    "co",
    "company",
    "gmbh",
    "plc",
    "limited",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SponsorshipStatus {
    Sponsors,
    DoesNotSponsor,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Verified,
    LearnedFromText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorshipFact {
    pub status: SponsorshipStatus,
    pub provenance: Provenance,
}

impl SponsorshipFact {
    pub fn learned(status: SponsorshipStatus) -> Self {
        Self {
            status,
            provenance: Provenance::LearnedFromText,
        }
    }

    /// Hint text injected into the prompt.
    pub fn label(&self) -> String {
        let status = match self.status {
            SponsorshipStatus::Sponsors => "Sponsors",
            SponsorshipStatus::DoesNotSponsor => "Does Not Sponsor",
            SponsorshipStatus::Unknown => "Unknown",
        };
        match self.provenance {
            Provenance::Verified => format!("{status} (Verified)"),
            Provenance::LearnedFromText => format!("{status} (Learned from JD)"),
        }
    }

    /// Decode the flat label form used by hand-maintained sponsor lists.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        let status = if lower.contains("does not") || lower.contains("no sponsor") {
            SponsorshipStatus::DoesNotSponsor
        } else if lower.contains("sponsor") || lower.contains("yes") {
            SponsorshipStatus::Sponsors
        } else {
            SponsorshipStatus::Unknown
        };
        let provenance = if lower.contains("learned") {
            Provenance::LearnedFromText
        } else {
            Provenance::Verified
        };
        Self { status, provenance }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StoredSponsorship {
    Typed(SponsorshipFact),
    Label(String),
}

impl From<StoredSponsorship> for SponsorshipFact {
    fn from(stored: StoredSponsorship) -> Self {
        match stored {
            StoredSponsorship::Typed(fact) => fact,
            StoredSponsorship::Label(label) => SponsorshipFact::from_label(&label),
        }
    }
}

static NEGATED_SPONSORSHIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bunlikely\b|(?:\b(?:not|no|never|cannot)|n't)\s+(?:\w+\s+)?(?:likely|sponsor\w*|visa)\b")
        .expect("negated sponsorship regex")
});

static LIKELY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blikely\b").expect("likely regex"));

/// Classify the model's sponsorship text. Only clear "likely"/"unlikely" language counts, and
/// negated phrasings ("not likely", "no sponsorship") read as a refusal.
pub fn classify_sponsorship_text(text: &str) -> Option<SponsorshipStatus> {
    if NEGATED_SPONSORSHIP.is_match(text) {
        Some(SponsorshipStatus::DoesNotSponsor)
    } else if LIKELY.is_match(text) {
        Some(SponsorshipStatus::Sponsors)
    } else {
        None
    }
}

/// Lower-case, strip punctuation and drop legal-form suffixes.
pub fn normalize_company(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|token| !COMPANY_SUFFIXES.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

fn clean_token(raw: &str) -> Option<String> {
    let token = raw
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '[' || c == ']')
        .trim();
    let lower = token.to_lowercase();
    if token.is_empty() || matches!(lower.as_str(), "n/a" | "none" | "unknown" | "not mentioned") {
        None
    } else {
        Some(token.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyInsight {
    #[serde(default)]
    pub tech_stack: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct IntelPaths {
    pub sponsors: PathBuf,
    pub skill_gaps: PathBuf,
    pub salary_benchmarks: PathBuf,
    pub company_insights: PathBuf,
}

impl IntelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            sponsors: dir.join("sponsors.yaml"),
            skill_gaps: dir.join("skill_gaps.yaml"),
            salary_benchmarks: dir.join("salary_benchmarks.yaml"),
            company_insights: dir.join("company_insights.yaml"),
        }
    }
}

/// The four caches, owned by the orchestrator and flushed together once per run.
#[derive(Debug)]
pub struct IntelCache {
    paths: Option<IntelPaths>,
    sponsors: BTreeMap<String, SponsorshipFact>,
    sponsor_index: BTreeMap<String, String>,
    skill_gaps: BTreeMap<String, u64>,
    salaries: BTreeMap<String, BTreeMap<String, String>>,
    companies: BTreeMap<String, CompanyInsight>,
    dirty: bool,
}

async fn read_yaml_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "intel cache unreadable; starting empty");
            return T::default();
        }
    };
    if text.trim().is_empty() {
        return T::default();
    }
    match serde_yaml::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "intel cache malformed; starting empty");
            T::default()
        }
    }
}

async fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, text.as_bytes())
        .await
        .with_context(|| format!("writing {}", path.display()))
}

impl IntelCache {
    /// Cache that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            paths: None,
            sponsors: BTreeMap::new(),
            sponsor_index: BTreeMap::new(),
            skill_gaps: BTreeMap::new(),
            salaries: BTreeMap::new(),
            companies: BTreeMap::new(),
            dirty: false,
        }
    }

    pub async fn load(paths: IntelPaths) -> Self {
        let stored: BTreeMap<String, StoredSponsorship> = read_yaml_or_default(&paths.sponsors).await;
        let mut cache = Self {
            sponsors: stored.into_iter().map(|(k, v)| (k, v.into())).collect(),
            skill_gaps: read_yaml_or_default(&paths.skill_gaps).await,
            salaries: read_yaml_or_default(&paths.salary_benchmarks).await,
            companies: read_yaml_or_default(&paths.company_insights).await,
            paths: Some(paths),
            sponsor_index: BTreeMap::new(),
            dirty: false,
        };
        cache.rebuild_index();
        debug!(
            sponsors = cache.sponsors.len(),
            skills = cache.skill_gaps.len(),
            companies = cache.companies.len(),
            "intel caches loaded"
        );
        cache
    }

    fn rebuild_index(&mut self) {
        self.sponsor_index = self
            .sponsors
            .keys()
            .map(|k| (normalize_company(k), k.clone()))
            .collect();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Sponsorship history for `company`: exact normalized match first, then fuzzy.
    pub fn sponsorship(&self, company: &str) -> Option<&SponsorshipFact> {
        let normalized = normalize_company(company);
        if normalized.is_empty() {
            return None;
        }
        if let Some(key) = self.sponsor_index.get(&normalized) {
            return self.sponsors.get(key);
        }
        self.sponsor_index
            .iter()
            .map(|(candidate, key)| (jaro_winkler(&normalized, candidate), key))
            .filter(|(score, _)| *score >= COMPANY_MATCH_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .and_then(|(_, key)| self.sponsors.get(key))
    }

    /// Record a sponsorship signal. Returns whether the cache changed.
    pub fn record_sponsorship(&mut self, company: &str, h1b_text: &str) -> bool {
        let company = company.trim();
        if company.is_empty() {
            return false;
        }
        let Some(status) = classify_sponsorship_text(h1b_text) else {
            return false;
        };
        let normalized = normalize_company(company);
        let key = self
            .sponsor_index
            .get(&normalized)
            .cloned()
            .unwrap_or_else(|| company.to_string());

        match self.sponsors.get(&key) {
            Some(existing) if existing.provenance == Provenance::Verified => return false,
            Some(existing) if existing.status == status => return false,
            _ => {}
        }
        self.sponsors.insert(key.clone(), SponsorshipFact::learned(status));
        self.sponsor_index.insert(normalized, key);
        self.dirty = true;
        true
    }

    pub fn skill_gap_count(&self, skill: &str) -> u64 {
        self.skill_gaps
            .get(&skill.trim().to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Most frequent gaps, highest count first.
    pub fn top_skill_gaps(&self, n: usize) -> Vec<(String, u64)> {
        let mut gaps = self
            .skill_gaps
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect::<Vec<_>>();
        gaps.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        gaps.truncate(n);
        gaps
    }

    pub fn salary(&self, role: &str, location: &str) -> Option<&str> {
        self.salaries
            .get(role)
            .and_then(|by_location| by_location.get(location))
            .map(String::as_str)
    }

    pub fn company_insight(&self, company: &str) -> Option<&CompanyInsight> {
        self.companies.get(company)
    }

    /// Merge everything learned from one parsed evaluation.
    pub fn record_evaluation(&mut self, job: &JobRecord, result: &EvaluationResult) {
        self.record_sponsorship(&job.company, &result.h1b_status);

        for skill in &result.missing_skills {
            if let Some(token) = clean_token(skill) {
                *self.skill_gaps.entry(token.to_lowercase()).or_default() += 1;
                self.dirty = true;
            }
        }

        if let (Some(role), Some(range)) = (
            clean_token(&result.recommended_role),
            clean_token(&result.salary_range),
        ) {
            let location = job.location.trim();
            if !location.is_empty() {
                let slot = self.salaries.entry(role).or_default();
                if slot.get(location) != Some(&range) {
                    slot.insert(location.to_string(), range);
                    self.dirty = true;
                }
            }
        }

        let company = job.company.trim();
        if !company.is_empty() {
            let tokens = result
                .tech_stack
                .iter()
                .filter_map(|t| clean_token(t))
                .collect::<Vec<_>>();
            if !tokens.is_empty() {
                let insight = self.companies.entry(company.to_string()).or_default();
                for token in tokens {
                    self.dirty |= insight.tech_stack.insert(token);
                }
            }
        }
    }

    /// Write all four caches if anything changed during the run.
    pub async fn flush(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let Some(paths) = &self.paths else {
            self.dirty = false;
            return Ok(false);
        };
        write_yaml(&paths.sponsors, &self.sponsors).await?;
        write_yaml(&paths.skill_gaps, &self.skill_gaps).await?;
        write_yaml(&paths.salary_benchmarks, &self.salaries).await?;
        write_yaml(&paths.company_insights, &self.companies).await?;
        self.dirty = false;
        info!(
            sponsors = self.sponsors.len(),
            skills = self.skill_gaps.len(),
            companies = self.companies.len(),
            "intel caches flushed"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use jobsift_core::RawJob;
    use tempfile::tempdir;

    fn job(company: &str, location: &str) -> JobRecord {
        let raw = RawJob {
            title: Some("Product Manager".into()),
            company: Some(company.into()),
            location: Some(location.into()),
            url: Some("https://x.com/1".into()),
            ..Default::default()
        };
        let added = Local.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        JobRecord::from_raw(&raw, added).unwrap()
    }

    fn evaluation() -> EvaluationResult {
        EvaluationResult {
            h1b_status: "Likely: Sponsor".into(),
            missing_skills: vec!["Kubernetes".into(), "Go".into(), "GCP".into()],
            salary_range: "$140k - $180k".into(),
            tech_stack: vec!["Python".into(), "AWS".into(), "React".into()],
            recommended_role: "Product Manager (TPM)".into(),
            ..EvaluationResult::unparsed()
        }
    }

    #[test]
    fn sponsorship_language_must_be_unambiguous() {
        let mut cache = IntelCache::in_memory();
        assert!(cache.record_sponsorship("TestCo", "Likely: Found in JD"));
        assert!(cache.record_sponsorship("NoSponsorCorp", "Unlikely: No visa support mentioned"));
        assert!(!cache.record_sponsorship("Vague Inc", "Unknown"));

        assert_eq!(
            cache.sponsorship("TestCo").map(|f| f.label()),
            Some("Sponsors (Learned from JD)".to_string())
        );
        assert_eq!(
            cache.sponsorship("NoSponsorCorp").map(|f| f.label()),
            Some("Does Not Sponsor (Learned from JD)".to_string())
        );
        assert!(cache.sponsorship("Vague Inc").is_none());
    }

    #[test]
    fn negated_sponsorship_language_reads_as_refusal() {
        for text in [
            "Not likely",
            "not likely to sponsor",
            "no sponsorship likely",
            "Doesn't sponsor visas",
            "Does not sponsor",
            "Unlikely: No visa support mentioned",
        ] {
            assert_eq!(
                classify_sponsorship_text(text),
                Some(SponsorshipStatus::DoesNotSponsor),
                "{text}"
            );
        }
        for text in ["Likely: Found in JD", "Likely: no restrictions on visa type", "likely"] {
            assert_eq!(
                classify_sponsorship_text(text),
                Some(SponsorshipStatus::Sponsors),
                "{text}"
            );
        }
        assert_eq!(classify_sponsorship_text("Unknown"), None);
        assert_eq!(classify_sponsorship_text("Sponsorship not mentioned"), None);

        let mut cache = IntelCache::in_memory();
        assert!(cache.record_sponsorship("Harbor Health", "Not likely to sponsor"));
        assert_eq!(
            cache.sponsorship("Harbor Health").map(|f| f.status),
            Some(SponsorshipStatus::DoesNotSponsor)
        );
    }

    #[test]
    fn verified_facts_are_never_overwritten() {
        let mut cache = IntelCache::in_memory();
        cache.sponsors.insert(
            "Google".into(),
            SponsorshipFact {
                status: SponsorshipStatus::Sponsors,
                provenance: Provenance::Verified,
            },
        );
        cache.rebuild_index();
        assert!(!cache.record_sponsorship("Google LLC", "Unlikely"));
        assert_eq!(
            cache.sponsorship("google").map(|f| f.status),
            Some(SponsorshipStatus::Sponsors)
        );
        assert!(!cache.is_dirty());
    }

    #[test]
    fn company_lookup_tolerates_suffixes_and_typos() {
        let mut cache = IntelCache::in_memory();
        cache.record_sponsorship("Harbor Health, Inc.", "Likely");
        assert!(cache.sponsorship("harbor health").is_some());
        assert!(cache.sponsorship("Harbor Healthh LLC").is_some());
        assert!(cache.sponsorship("Harvest Foods").is_none());
    }

    #[test]
    fn evaluation_updates_all_caches() {
        let mut cache = IntelCache::in_memory();
        cache.record_evaluation(&job("TechFlow AI", "Austin, TX"), &evaluation());

        assert_eq!(cache.skill_gap_count("kubernetes"), 1);
        assert_eq!(cache.skill_gap_count("Go"), 1);
        assert_eq!(
            cache.salary("Product Manager (TPM)", "Austin, TX"),
            Some("$140k - $180k")
        );
        assert!(cache
            .company_insight("TechFlow AI")
            .is_some_and(|i| i.tech_stack.contains("Python")));
        assert!(cache.sponsorship("TechFlow AI").is_some());

        cache.record_evaluation(&job("TechFlow AI", "Austin, TX"), &evaluation());
        assert_eq!(cache.top_skill_gaps(1), vec![("gcp".to_string(), 2)]);
    }

    #[tokio::test]
    async fn flush_writes_only_when_dirty_and_reloads() {
        let dir = tempdir().expect("tempdir");
        let paths = IntelPaths::in_dir(dir.path());
        std::fs::write(&paths.sponsors, "Siemens: Sponsors (Verified)\n").unwrap();

        let mut cache = IntelCache::load(paths.clone()).await;
        assert_eq!(
            cache.sponsorship("siemens").map(|f| f.provenance),
            Some(Provenance::Verified)
        );
        assert!(!cache.flush().await.unwrap());
        assert!(!paths.skill_gaps.exists());

        cache.record_evaluation(&job("TechFlow AI", "Austin, TX"), &evaluation());
        assert!(cache.flush().await.unwrap());
        assert!(paths.company_insights.exists());

        let reloaded = IntelCache::load(paths).await;
        assert_eq!(reloaded.skill_gap_count("kubernetes"), 1);
        assert_eq!(
            reloaded.sponsorship("Siemens").map(|f| f.provenance),
            Some(Provenance::Verified)
        );
        assert_eq!(
            reloaded.sponsorship("TechFlow AI").map(|f| f.provenance),
            Some(Provenance::LearnedFromText)
        );
    }
}
