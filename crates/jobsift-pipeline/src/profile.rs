//! Candidate profile: the Markdown summary injected into prompts and the keyword set used by the
//! fallback scorer and the overlap nudge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

/// Roles the model may recommend a resume for.
pub const TARGET_ROLES: [&str; 6] = ["TPM", "PO", "Business Analyst", "Scrum Master", "Manager", "GTM"];

const SUMMARY_EXPERIENCE: usize = 5;
const SUMMARY_BULLETS: usize = 3;
const SUMMARY_PROJECTS: usize = 5;
const KEYWORD_EXPERIENCE: usize = 8;
const KEYWORD_BULLETS: usize = 5;
const KEYWORD_PROJECTS: usize = 5;

static SKILL_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;/]").expect("skill split regex"));
static PHRASE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;.]").expect("phrase split regex"));

/// YAML scalars (dates are often bare numbers) rendered as text.
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_yaml::Value::String(s)) => Some(s),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        Some(serde_yaml::Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Experience {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub start_date: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub bullet_points: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SkillList {
    Text(String),
    Items(Vec<String>),
}

impl SkillList {
    fn joined(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Items(items) => items.join(", "),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillCategory {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "skills")]
    pub skill_list: Option<SkillList>,
}

/// Either a list of `{category, skill_list}` entries or a `category -> [skills]` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Skills {
    Categories(Vec<SkillCategory>),
    Map(BTreeMap<String, Vec<String>>),
}

impl Default for Skills {
    fn default() -> Self {
        Self::Categories(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateProfile {
    #[serde(default)]
    pub experience: Vec<Experience>,
    #[serde(default)]
    pub skills: Skills,
    #[serde(default)]
    pub projects: Vec<Project>,
}

fn or_blank(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn phrase_tokens(text: &str, out: &mut BTreeSet<String>) {
    for part in PHRASE_SPLIT.split(text) {
        let token = part.trim().to_lowercase();
        if (3..=40).contains(&token.chars().count()) {
            out.insert(token);
        }
    }
}

impl CandidateProfile {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// High-density Markdown summary for the prompt.
    pub fn summary(&self) -> String {
        let mut out = String::from("## USER PROFESSIONAL SUMMARY\n\n### TOP EXPERIENCE\n");
        for exp in self.experience.iter().take(SUMMARY_EXPERIENCE) {
            let _ = writeln!(
                out,
                "- **{}** at {} ({} - {})",
                or_blank(&exp.role),
                or_blank(&exp.company),
                or_blank(&exp.start_date),
                or_blank(&exp.end_date)
            );
            let bullets = exp
                .bullet_points
                .iter()
                .take(SUMMARY_BULLETS)
                .map(String::as_str)
                .collect::<Vec<_>>();
            let _ = writeln!(out, "  * Key: {}", bullets.join(", "));
        }

        out.push_str("\n### SKILLS INVENTORY\n");
        match &self.skills {
            Skills::Categories(categories) => {
                for entry in categories {
                    let _ = writeln!(
                        out,
                        "- **{}**: {}",
                        entry.category.as_deref().unwrap_or("General"),
                        entry.skill_list.as_ref().map(SkillList::joined).unwrap_or_default()
                    );
                }
            }
            Skills::Map(map) => {
                for (category, skills) in map {
                    let _ = writeln!(out, "- **{category}**: {}", skills.join(", "));
                }
            }
        }

        out.push_str("\n### PROJECTS\n");
        for project in self.projects.iter().take(SUMMARY_PROJECTS) {
            let _ = writeln!(
                out,
                "- **{}**: {}",
                or_blank(&project.name),
                or_blank(&project.description)
            );
            if !project.technologies.is_empty() {
                let _ = writeln!(out, "  * Tech: {}", project.technologies.join(", "));
            }
        }
        out
    }

    /// Lower-cased skill phrases searched for in job descriptions.
    pub fn keywords(&self) -> BTreeSet<String> {
        let mut keywords = BTreeSet::new();
        match &self.skills {
            Skills::Categories(categories) => {
                for entry in categories {
                    let Some(list) = &entry.skill_list else {
                        continue;
                    };
                    for part in SKILL_SPLIT.split(&list.joined()) {
                        let token = part.trim().to_lowercase();
                        if token.chars().count() > 2 {
                            keywords.insert(token);
                        }
                    }
                }
            }
            Skills::Map(map) => {
                for skill in map.values().flatten() {
                    let token = skill.trim().to_lowercase();
                    if token.chars().count() > 2 {
                        keywords.insert(token);
                    }
                }
            }
        }
        for exp in self.experience.iter().take(KEYWORD_EXPERIENCE) {
            for bullet in exp.bullet_points.iter().take(KEYWORD_BULLETS) {
                phrase_tokens(bullet, &mut keywords);
            }
        }
        for project in self.projects.iter().take(KEYWORD_PROJECTS) {
            if let Some(description) = &project.description {
                phrase_tokens(description, &mut keywords);
            }
        }
        keywords
    }
}

/// Loaded once per run and shared by every batch.
#[derive(Debug, Clone, Default)]
pub struct ProfileContext {
    pub summary: String,
    pub keywords: BTreeSet<String>,
}

impl ProfileContext {
    pub fn from_profile(profile: &CandidateProfile) -> Self {
        Self {
            summary: format!(
                "{}\n\n### TARGET ROLES AVAILABLE\n{}",
                profile.summary(),
                TARGET_ROLES.join(", ")
            ),
            keywords: profile.keywords(),
        }
    }

    /// Placeholder used when no profile is available; the keyword set stays empty.
    pub fn missing(path: &Path) -> Self {
        Self {
            summary: format!(
                "Candidate profile not available (expected at {}). Judge fit from the posting alone.",
                path.display()
            ),
            keywords: BTreeSet::new(),
        }
    }

    pub fn load(path: &Path) -> Self {
        if !path.is_file() {
            warn!(path = %path.display(), "candidate profile not found; keyword overlap disabled");
            return Self::missing(path);
        }
        match CandidateProfile::from_file(path) {
            Ok(profile) => {
                let context = Self::from_profile(&profile);
                info!(keywords = context.keywords.len(), "candidate profile loaded");
                context
            }
            Err(err) => {
                warn!(error = %err, "candidate profile unusable; keyword overlap disabled");
                Self::missing(path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PROFILE: &str = r#"
experience:
  - role: Business Analyst
    company: Harbor Health
    start_date: 2021
    end_date: Present
    bullet_points:
      - Built SQL dashboards in Tableau, cut reporting time 40%.
      - Ran stakeholder workshops; wrote user stories
      - Owned Jira backlog
      - Fourth bullet
skills:
  - category: Analytics
    skill_list: SQL, Tableau; Power BI / Excel
  - category: Delivery
    skills: [Jira, Confluence, Go]
projects:
  - name: Churn model
    description: Predicted churn with Python. Presented to execs
    technologies: [Python, scikit-learn]
"#;

    #[test]
    fn summary_has_every_section() {
        let profile = CandidateProfile::from_yaml(PROFILE).expect("parse");
        let summary = profile.summary();
        assert!(summary.contains("- **Business Analyst** at Harbor Health (2021 - Present)"));
        assert!(summary.contains("  * Key: Built SQL dashboards in Tableau, cut reporting time 40%., Ran stakeholder workshops; wrote user stories, Owned Jira backlog\n"));
        assert!(!summary.contains("Fourth bullet"));
        assert!(summary.contains("- **Analytics**: SQL, Tableau; Power BI / Excel"));
        assert!(summary.contains("- **Delivery**: Jira, Confluence, Go"));
        assert!(summary.contains("  * Tech: Python, scikit-learn"));
    }

    #[test]
    fn keywords_follow_split_and_length_rules() {
        let keywords = CandidateProfile::from_yaml(PROFILE).expect("parse").keywords();
        for expected in ["sql", "tableau", "power bi", "excel", "jira", "confluence"] {
            assert!(keywords.contains(expected), "missing {expected}");
        }
        assert!(!keywords.contains("go"), "two-letter skills are dropped");
        assert!(keywords.contains("ran stakeholder workshops"));
        assert!(keywords.contains("predicted churn with python"));
        assert!(keywords.contains("fourth bullet"));
        assert!(keywords.contains("built sql dashboards in tableau"));
        assert!(keywords.contains("cut reporting time 40%"));
    }

    #[test]
    fn map_shaped_skills_are_accepted() {
        let profile = CandidateProfile::from_yaml("skills:\n  Data: [SQL, dbt, R]\n").expect("parse");
        let keywords = profile.keywords();
        assert!(keywords.contains("sql"));
        assert!(keywords.contains("dbt"));
        assert!(!keywords.contains("r"));
        assert!(profile.summary().contains("- **Data**: SQL, dbt, R"));
    }

    #[test]
    fn missing_profile_yields_placeholder_and_no_keywords() {
        let dir = tempdir().expect("tempdir");
        let context = ProfileContext::load(&dir.path().join("profile.yaml"));
        assert!(context.keywords.is_empty());
        assert!(context.summary.contains("not available"));

        let path = dir.path().join("profile.yaml");
        std::fs::write(&path, PROFILE).unwrap();
        let loaded = ProfileContext::load(&path);
        assert!(loaded.summary.ends_with("### TARGET ROLES AVAILABLE\nTPM, PO, Business Analyst, Scrum Master, Manager, GTM"));
        assert!(loaded.keywords.contains("sql"));
    }
}
