//! Core domain model for jobsift: job records, verdict tiers and evaluation outcomes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub mod canonical;

pub use canonical::canonicalize;

/// One table row addressed by column header.
pub type Cells = BTreeMap<String, String>;

/// Column headers of the persisted job table.
pub mod columns {
    pub const STATUS: &str = "Status";
    pub const ROLE_TITLE: &str = "Role Title";
    pub const COMPANY: &str = "Company";
    pub const LOCATION: &str = "Location";
    pub const JOB_LINK: &str = "Job Link";
    pub const SOURCE: &str = "Source";
    pub const DATE_ADDED: &str = "Date Added";
    pub const APPLY_SCORE: &str = "Apply Score";
    pub const MATCH_TYPE: &str = "Match Type";
    pub const RECOMMENDED_RESUME: &str = "Recommended Resume";
    pub const H1B_SPONSORSHIP: &str = "H1B Sponsorship";
    pub const LOCATION_VERIFICATION: &str = "Location Verification";
    pub const MISSING_SKILLS: &str = "Missing Skills";
    pub const APPLIED: &str = "Applied? (Y/N)";
    pub const REASONING: &str = "Reasoning";
    pub const SALARY_RANGE: &str = "Salary Range";
    pub const TECH_STACK: &str = "Tech Stack";

    /// Header row written when a tab is created.
    pub const BASE: [&str; 14] = [
        STATUS,
        ROLE_TITLE,
        COMPANY,
        LOCATION,
        JOB_LINK,
        SOURCE,
        DATE_ADDED,
        APPLY_SCORE,
        MATCH_TYPE,
        RECOMMENDED_RESUME,
        H1B_SPONSORSHIP,
        LOCATION_VERIFICATION,
        MISSING_SKILLS,
        APPLIED,
    ];

    /// Header lookup tolerant to spacing differences such as `Applied?(Y/N)`.
    pub fn is_applied_header(header: &str) -> bool {
        header.to_ascii_lowercase().contains("applied")
    }
}

pub const ALREADY_SEEN_LABEL: &str = "Already seen";

/// Lifecycle of a row. `New -> Evaluated` and `New -> Skipped` are the only transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    New,
    Evaluated,
    /// Terminal state of a duplicate whose canonical link was already evaluated or applied to.
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Evaluated => "EVALUATED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NEW" => Some(Self::New),
            "EVALUATED" => Some(Self::Evaluated),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four ordered outcome tiers, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Verdict {
    AutoApply,
    StrongMatch,
    WorthConsidering,
    No,
}

impl Verdict {
    pub const ALL: [Verdict; 4] = [
        Verdict::AutoApply,
        Verdict::StrongMatch,
        Verdict::WorthConsidering,
        Verdict::No,
    ];

    /// Label stored in the `Match Type` column.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AutoApply => "🔥 Auto-Apply",
            Self::StrongMatch => "✅ Strong Match",
            Self::WorthConsidering => "⚖️ Worth Considering",
            Self::No => "❌ No",
        }
    }

    /// Plain name without the decoration, used for matching model output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AutoApply => "Auto-Apply",
            Self::StrongMatch => "Strong Match",
            Self::WorthConsidering => "Worth Considering",
            Self::No => "No",
        }
    }

    /// 1 for the best tier, 4 for the worst.
    pub fn rank(&self) -> u8 {
        match self {
            Self::AutoApply => 1,
            Self::StrongMatch => 2,
            Self::WorthConsidering => 3,
            Self::No => 4,
        }
    }

    pub fn is_high_tier(&self) -> bool {
        matches!(self, Self::AutoApply | Self::StrongMatch)
    }

    /// Decode a stored or model-declared label. Decoration (emoji, asterisks, brackets) is
    /// ignored, and the older five-level vocabulary maps onto the nearest tier.
    pub fn from_label(value: &str) -> Option<Self> {
        let cleaned = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-')
            .collect::<String>()
            .to_ascii_lowercase();
        let cleaned = cleaned.trim().trim_matches('-').trim();
        match cleaned {
            "auto-apply" | "auto apply" | "for sure" => Some(Self::AutoApply),
            "strong match" | "worth trying" => Some(Self::StrongMatch),
            "worth considering" | "ambitious" | "maybe" => Some(Self::WorthConsidering),
            "no" | "not at all" => Some(Self::No),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Value of the `Match Type` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    Verdict(Verdict),
    AlreadySeen,
    Other(String),
}

impl MatchType {
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.replace('*', "").trim().eq_ignore_ascii_case(ALREADY_SEEN_LABEL) {
            return Some(Self::AlreadySeen);
        }
        Some(
            Verdict::from_label(trimmed)
                .map(Self::Verdict)
                .unwrap_or_else(|| Self::Other(trimmed.to_string())),
        )
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Verdict(v) => v.label(),
            Self::AlreadySeen => ALREADY_SEEN_LABEL,
            Self::Other(s) => s,
        }
    }

    /// Sort priority, lower first. Unknown labels sort last.
    pub fn sort_priority(&self) -> u8 {
        match self {
            Self::Verdict(Verdict::No) => 5,
            Self::Verdict(v) => v.rank(),
            Self::AlreadySeen => 6,
            Self::Other(_) => 99,
        }
    }
}

/// Posting as handed over by a scraper adapter. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawJob {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "job_url")]
    pub url: Option<String>,
    #[serde(default, alias = "site")]
    pub source: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RawJob {
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or_default()
    }

    pub fn location(&self) -> &str {
        self.location.as_deref().unwrap_or_default()
    }

    pub fn url(&self) -> &str {
        self.url.as_deref().unwrap_or_default()
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or_default()
    }
}

/// Typed decode of one inference response, before it is merged into a [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub location_verification: String,
    pub h1b_status: String,
    pub recommended_role: String,
    pub reasoning: String,
    pub salary_range: String,
    pub tech_stack: Vec<String>,
    pub missing_skills: Vec<String>,
    /// `0` means no score could be parsed; see [`EvaluationResult::UNSCORED`].
    pub score: u8,
    /// Verdict string as the model wrote it. Never trusted for the stored verdict.
    pub declared_verdict: Option<String>,
}

impl EvaluationResult {
    pub const UNSCORED: u8 = 0;

    /// Safe defaults used when nothing usable was decoded.
    pub fn unparsed() -> Self {
        Self {
            location_verification: "Unknown".to_string(),
            h1b_status: "Unknown".to_string(),
            recommended_role: "Unknown".to_string(),
            reasoning: "N/A".to_string(),
            salary_range: "Not mentioned".to_string(),
            tech_stack: Vec::new(),
            missing_skills: Vec::new(),
            score: Self::UNSCORED,
            declared_verdict: None,
        }
    }

    pub fn has_score(&self) -> bool {
        self.score != Self::UNSCORED
    }
}

/// Evaluation fields of a record whose status is `Evaluated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvaluation {
    /// Missing for rule-based rejections, which never reach the scorer.
    pub score: Option<u8>,
    pub verdict: Verdict,
    pub recommended_role: String,
    pub h1b_status: String,
    pub location_verification: String,
    pub missing_skills: Vec<String>,
    pub reasoning: String,
    pub salary_range: String,
    pub tech_stack: Vec<String>,
}

impl JobEvaluation {
    /// Terminal rejection written by the rule-based prefilter.
    pub fn rejected(reason: &str) -> Self {
        Self {
            score: None,
            verdict: Verdict::No,
            recommended_role: "None (Filtered)".to_string(),
            h1b_status: "N/A".to_string(),
            location_verification: "N/A".to_string(),
            missing_skills: Vec::new(),
            reasoning: reason.to_string(),
            salary_range: String::new(),
            tech_stack: Vec::new(),
        }
    }

    pub fn cells(&self) -> Cells {
        let mut cells = Cells::new();
        cells.insert(
            columns::APPLY_SCORE.to_string(),
            self.score.map(|s| s.to_string()).unwrap_or_default(),
        );
        cells.insert(columns::MATCH_TYPE.to_string(), self.verdict.label().to_string());
        cells.insert(columns::RECOMMENDED_RESUME.to_string(), self.recommended_role.clone());
        cells.insert(columns::H1B_SPONSORSHIP.to_string(), self.h1b_status.clone());
        cells.insert(
            columns::LOCATION_VERIFICATION.to_string(),
            self.location_verification.clone(),
        );
        cells.insert(columns::MISSING_SKILLS.to_string(), self.missing_skills.join(", "));
        cells.insert(columns::REASONING.to_string(), self.reasoning.clone());
        cells.insert(columns::SALARY_RANGE.to_string(), self.salary_range.clone());
        cells.insert(columns::TECH_STACK.to_string(), self.tech_stack.join(", "));
        cells
    }
}

/// Location of a row inside the store: tab name plus zero-based data row index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRef {
    pub tab: String,
    pub index: usize,
}

/// One posting under evaluation, decoded once at the store boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub row: Option<RowRef>,
    pub url: String,
    pub canonical_url: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub source: String,
    pub description: String,
    pub date_added: String,
    pub status: JobStatus,
    pub match_type: Option<MatchType>,
    pub evaluation: Option<JobEvaluation>,
    pub applied: bool,
}

fn non_empty_or(value: Option<&String>, default: &str) -> String {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl JobRecord {
    /// Build a `NEW` record from adapter output. Postings without a link are unusable.
    pub fn from_raw(raw: &RawJob, added_at: DateTime<Local>) -> Option<Self> {
        let url = raw.url().trim().to_string();
        if url.is_empty() {
            return None;
        }
        Some(Self {
            row: None,
            canonical_url: canonicalize(&url),
            url,
            title: raw.title().trim().to_string(),
            company: raw.company.as_deref().unwrap_or_default().trim().to_string(),
            location: raw.location().trim().to_string(),
            source: non_empty_or(raw.source.as_ref(), "Unknown"),
            description: raw.description().trim().to_string(),
            date_added: added_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            status: JobStatus::New,
            match_type: None,
            evaluation: None,
            applied: false,
        })
    }

    /// Decode a stored row. Descriptions are not part of the table and start empty.
    pub fn from_cells(row: RowRef, cells: &Cells) -> Self {
        let get = |key: &str| cells.get(key).map(|v| v.trim().to_string()).unwrap_or_default();
        let url = get(columns::JOB_LINK);
        let status = JobStatus::parse(&get(columns::STATUS)).unwrap_or(JobStatus::New);
        let match_type = MatchType::parse(&get(columns::MATCH_TYPE));
        let applied = cells
            .iter()
            .find(|(k, _)| columns::is_applied_header(k))
            .map(|(_, v)| v.trim().to_ascii_uppercase().starts_with('Y'))
            .unwrap_or(false);

        let evaluation = match (&status, &match_type) {
            (JobStatus::Evaluated, Some(MatchType::Verdict(verdict))) => Some(JobEvaluation {
                score: get(columns::APPLY_SCORE).parse::<u8>().ok(),
                verdict: *verdict,
                recommended_role: get(columns::RECOMMENDED_RESUME),
                h1b_status: get(columns::H1B_SPONSORSHIP),
                location_verification: get(columns::LOCATION_VERIFICATION),
                missing_skills: split_list(&get(columns::MISSING_SKILLS)),
                reasoning: get(columns::REASONING),
                salary_range: get(columns::SALARY_RANGE),
                tech_stack: split_list(&get(columns::TECH_STACK)),
            }),
            _ => None,
        };

        Self {
            row: Some(row),
            canonical_url: canonicalize(&url),
            url,
            title: get(columns::ROLE_TITLE),
            company: get(columns::COMPANY),
            location: get(columns::LOCATION),
            source: get(columns::SOURCE),
            description: String::new(),
            date_added: get(columns::DATE_ADDED),
            status,
            match_type,
            evaluation,
            applied,
        }
    }

    /// Full row as it is written on append.
    pub fn to_cells(&self) -> Cells {
        let mut cells = Cells::new();
        cells.insert(columns::STATUS.to_string(), self.status.as_str().to_string());
        cells.insert(columns::ROLE_TITLE.to_string(), self.title.clone());
        cells.insert(columns::COMPANY.to_string(), self.company.clone());
        cells.insert(columns::LOCATION.to_string(), self.location.clone());
        cells.insert(columns::JOB_LINK.to_string(), self.url.clone());
        cells.insert(columns::SOURCE.to_string(), self.source.clone());
        cells.insert(columns::DATE_ADDED.to_string(), self.date_added.clone());
        cells.insert(
            columns::APPLIED.to_string(),
            if self.applied { "Y" } else { "" }.to_string(),
        );
        if let Some(evaluation) = &self.evaluation {
            cells.extend(evaluation.cells());
        } else if let Some(match_type) = &self.match_type {
            cells.insert(columns::MATCH_TYPE.to_string(), match_type.label().to_string());
        }
        cells
    }

    /// Records that anchor the global dedup guarantee.
    pub fn is_dedup_anchor(&self) -> bool {
        self.status == JobStatus::Evaluated || self.applied
    }

    /// Transition to `Evaluated`. Only `New` rows (or re-evaluated rows) may be written.
    pub fn mark_evaluated(&mut self, evaluation: JobEvaluation) {
        self.match_type = Some(MatchType::Verdict(evaluation.verdict));
        self.evaluation = Some(evaluation);
        self.status = JobStatus::Evaluated;
    }

    /// Cells written when a duplicate is skipped.
    pub fn already_seen_cells() -> Cells {
        let mut cells = Cells::new();
        cells.insert(columns::STATUS.to_string(), JobStatus::Skipped.as_str().to_string());
        cells.insert(columns::MATCH_TYPE.to_string(), ALREADY_SEEN_LABEL.to_string());
        cells.insert(columns::RECOMMENDED_RESUME.to_string(), "—".to_string());
        cells.insert(
            columns::REASONING.to_string(),
            "Duplicate of previously evaluated or applied job; not re-evaluated.".to_string(),
        );
        cells
    }

    /// Cells written when a record becomes `Evaluated`.
    pub fn evaluated_cells(evaluation: &JobEvaluation) -> Cells {
        let mut cells = evaluation.cells();
        cells.insert(columns::STATUS.to_string(), JobStatus::Evaluated.as_str().to_string());
        cells
    }
}
