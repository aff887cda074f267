//! Rule-based job filters: the sourcing policy applied before a job is stored and the lighter
//! prefilter applied before inference.

use std::fmt;

use jobsift_core::{JobRecord, RawJob};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Keyword tables shared by both policies. All entries are matched case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterTables {
    pub title_inclusions: Vec<String>,
    pub seniority: Vec<String>,
    pub level: Vec<String>,
    pub clearance: Vec<String>,
    pub unrelated: Vec<String>,
    pub allowed_regions: Vec<String>,
    pub forbidden_regions: Vec<String>,
    pub non_target_markers: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for FilterTables {
    fn default() -> Self {
        Self {
            title_inclusions: strings(&[
                "product manager",
                "project manager",
                "program manager",
                "business analyst",
                "product owner",
                "scrum master",
                "agile coach",
                "gtm",
                "go-to market",
                "strategy",
                "operations analyst",
            ]),
            seniority: strings(&[
                "senior",
                "sr",
                "sr.",
                "staff",
                "principal",
                "director",
                "vp",
                "head of",
                "lead",
                "manager ii",
            ]),
            level: strings(&[
                "intern",
                "internship",
                "co-op",
                "graduate intern",
                "student intern",
            ]),
            clearance: strings(&["clearance", "ts/sci", "secret clearance", "top secret"]),
            unrelated: strings(&[
                "nurse",
                "registered nurse",
                "rn",
                "physician",
                "driver",
                "cdl",
                "warehouse",
                "mechanic",
                "cashier",
                "architect",
                "software engineer",
                "backend",
                "frontend",
                "fullstack",
                "full stack",
                "account executive",
                "recruiter",
                "firmware",
                "hardware",
                "validation",
                "characterization",
                "testing engineer",
                "product engineer",
                "data analyst",
            ]),
            allowed_regions: strings(&["usa", "united states", "dubai", "uae", "remote", "us"]),
            forbidden_regions: strings(&[
                "india",
                "uk",
                "london",
                "canada",
                "australia",
                "germany",
                "france",
                "singapore",
                "bangalore",
                "hyderabad",
                "toronto",
                "munich",
                "berlin",
                "dresden",
                "frankfurt",
                "europe",
            ]),
            non_target_markers: strings(&["(m/w/d)", "(all genders)"]),
        }
    }
}

/// Phrases of three characters or fewer only match on word boundaries.
const SHORT_PHRASE_MAX: usize = 3;

#[derive(Debug, Clone)]
struct Keyword {
    phrase: String,
    bounded: Option<Regex>,
}

impl Keyword {
    fn new(phrase: &str, force_bounded: bool) -> Option<Self> {
        let phrase = phrase.trim().to_lowercase();
        if phrase.is_empty() {
            return None;
        }
        let bounded = if force_bounded || phrase.chars().count() <= SHORT_PHRASE_MAX {
            Regex::new(&format!(r"\b{}\b", regex::escape(&phrase))).ok()
        } else {
            None
        };
        Some(Self { phrase, bounded })
    }

    /// `text` must already be lower-cased.
    fn is_in(&self, text: &str) -> bool {
        match &self.bounded {
            Some(re) => re.is_match(text),
            None => text.contains(&self.phrase),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct KeywordSet(Vec<Keyword>);

impl KeywordSet {
    pub(crate) fn new(phrases: &[String], force_bounded: bool) -> Self {
        Self(
            phrases
                .iter()
                .filter_map(|p| Keyword::new(p, force_bounded))
                .collect(),
        )
    }

    /// First phrase found in `text`, which must already be lower-cased.
    pub(crate) fn first_in(&self, text: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|k| k.is_in(text))
            .map(|k| k.phrase.as_str())
    }
}

/// The rule that rejected a job, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRule {
    TitleInclusion,
    NonTargetMarker(String),
    Seniority(String),
    Level(String),
    RegionNotAllowed,
    ForbiddenRegion(String),
    Clearance(String),
    UnrelatedField(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPolicy {
    Sourcing,
    EvaluationPrefilter,
}

/// Outcome of one policy check. A rejection carries the first failed rule and its reason text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    pub rule: Option<FilterRule>,
    pub reason: String,
}

impl FilterDecision {
    fn pass() -> Self {
        Self {
            rule: None,
            reason: String::new(),
        }
    }

    fn reject(policy: FilterPolicy, rule: FilterRule) -> Self {
        let reason = rule.reason(policy);
        Self {
            rule: Some(rule),
            reason,
        }
    }

    pub fn passed(&self) -> bool {
        self.rule.is_none()
    }
}

impl FilterRule {
    pub fn reason(&self, policy: FilterPolicy) -> String {
        match (policy, self) {
            (FilterPolicy::EvaluationPrefilter, Self::Seniority(_)) => {
                "Skip: Senior/Lead Role".to_string()
            }
            (FilterPolicy::EvaluationPrefilter, Self::Clearance(_)) => {
                "Skip: Requires Security Clearance".to_string()
            }
            (FilterPolicy::EvaluationPrefilter, Self::UnrelatedField(kw)) => {
                format!("Skip: Unrelated Field ({kw})")
            }
            (_, Self::TitleInclusion) => "Title match fail".to_string(),
            (_, Self::NonTargetMarker(_)) => "Non-US marker in title".to_string(),
            (_, Self::Seniority(_)) => "Seniority exclusion".to_string(),
            (_, Self::Level(_)) => "Intern/level exclusion".to_string(),
            (_, Self::RegionNotAllowed) => "Location region mismatch".to_string(),
            (_, Self::ForbiddenRegion(region)) => format!("Location exclusion ({region})"),
            (_, Self::Clearance(_)) => "Requires security clearance".to_string(),
            (_, Self::UnrelatedField(kw)) => format!("Unrelated field ({kw})"),
        }
    }
}

impl fmt::Display for FilterDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            f.write_str("passed")
        } else {
            f.write_str(&self.reason)
        }
    }
}

/// Text fields a policy looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterInput<'a> {
    pub title: &'a str,
    pub location: &'a str,
    pub description: &'a str,
    pub url: &'a str,
}

impl<'a> From<&'a RawJob> for FilterInput<'a> {
    fn from(job: &'a RawJob) -> Self {
        Self {
            title: job.title(),
            location: job.location(),
            description: job.description(),
            url: job.url(),
        }
    }
}

impl<'a> From<&'a JobRecord> for FilterInput<'a> {
    fn from(job: &'a JobRecord) -> Self {
        Self {
            title: &job.title,
            location: &job.location,
            description: &job.description,
            url: &job.url,
        }
    }
}

/// Keyword tables compiled once and shared by both policies.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    inclusions: KeywordSet,
    markers: KeywordSet,
    seniority: KeywordSet,
    level: KeywordSet,
    clearance: KeywordSet,
    unrelated: KeywordSet,
    allowed_regions: KeywordSet,
    forbidden_regions: KeywordSet,
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new(&FilterTables::default())
    }
}

impl FilterEngine {
    pub fn new(tables: &FilterTables) -> Self {
        Self {
            inclusions: KeywordSet::new(&tables.title_inclusions, false),
            markers: KeywordSet::new(&tables.non_target_markers, false),
            seniority: KeywordSet::new(&tables.seniority, true),
            level: KeywordSet::new(&tables.level, true),
            clearance: KeywordSet::new(&tables.clearance, false),
            unrelated: KeywordSet::new(&tables.unrelated, true),
            allowed_regions: KeywordSet::new(&tables.allowed_regions, false),
            forbidden_regions: KeywordSet::new(&tables.forbidden_regions, false),
        }
    }

    pub fn check(&self, policy: FilterPolicy, input: FilterInput<'_>) -> FilterDecision {
        let outcome = match policy {
            FilterPolicy::Sourcing => self.sourcing_rule(input),
            FilterPolicy::EvaluationPrefilter => self.prefilter_rule(input),
        };
        match outcome {
            Some(rule) => FilterDecision::reject(policy, rule),
            None => FilterDecision::pass(),
        }
    }

    pub fn sourcing<'a>(&self, input: impl Into<FilterInput<'a>>) -> FilterDecision {
        self.check(FilterPolicy::Sourcing, input.into())
    }

    pub fn prefilter<'a>(&self, input: impl Into<FilterInput<'a>>) -> FilterDecision {
        self.check(FilterPolicy::EvaluationPrefilter, input.into())
    }

    fn sourcing_rule(&self, input: FilterInput<'_>) -> Option<FilterRule> {
        let title = input.title.to_lowercase();
        let location = input.location.to_lowercase();

        if self.inclusions.first_in(&title).is_none() {
            return Some(FilterRule::TitleInclusion);
        }
        if let Some(marker) = self.markers.first_in(&title) {
            return Some(FilterRule::NonTargetMarker(marker.to_string()));
        }
        if let Some(kw) = self.seniority.first_in(&title) {
            return Some(FilterRule::Seniority(kw.to_string()));
        }
        if let Some(kw) = self.level.first_in(&title) {
            return Some(FilterRule::Level(kw.to_string()));
        }
        if self.allowed_regions.first_in(&location).is_none() {
            return Some(FilterRule::RegionNotAllowed);
        }
        let forbidden = self
            .forbidden_regions
            .0
            .iter()
            .find(|k| k.is_in(&location) || k.is_in(&title));
        if let Some(region) = forbidden {
            return Some(FilterRule::ForbiddenRegion(region.phrase.clone()));
        }
        if let Some(kw) = self.clearance_in(&title, input) {
            return Some(FilterRule::Clearance(kw));
        }
        self.unrelated
            .first_in(&title)
            .map(|kw| FilterRule::UnrelatedField(kw.to_string()))
    }

    fn prefilter_rule(&self, input: FilterInput<'_>) -> Option<FilterRule> {
        let title = input.title.to_lowercase();

        if let Some(kw) = self.seniority.first_in(&title) {
            return Some(FilterRule::Seniority(kw.to_string()));
        }
        if let Some(kw) = self.clearance_in(&title, input) {
            return Some(FilterRule::Clearance(kw));
        }
        self.unrelated
            .first_in(&title)
            .map(|kw| FilterRule::UnrelatedField(kw.to_string()))
    }

    fn clearance_in(&self, title: &str, input: FilterInput<'_>) -> Option<String> {
        let text = format!("{title} {} {}", input.description, input.url).to_lowercase();
        self.clearance.first_in(&text).map(ToString::to_string)
    }
}
