//! Prompt assembly for batched evaluation calls.

use std::path::Path;

use tracing::warn;

use crate::parser::{BATCH_ARRAY_KEY, BATCH_SEPARATOR};
use crate::router::FormatHint;
use crate::scoring::LocationPriority;

/// Used when no system prompt file is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a job-fit analyst. For each job posting, compare the posting with the
candidate profile and return ONE JSON object with these keys:

- "location_verification": where the role is actually based and whether it matches the listed location
- "h1b_sponsorship": start with "Likely:" or "Unlikely:" when the posting says so, otherwise "Unknown"
- "recommended_resume": one of the target roles listed in the profile
- "reasoning": two or three sentences on fit
- "salary_range": the range stated in the posting, or "Not mentioned"
- "tech_stack": list of tools and technologies named in the posting
- "skill_gaps": list of required skills the candidate lacks
- "apply_conviction_score": integer 0-100
- "verdict": one of "🔥 Auto-Apply" (85+), "✅ Strong Match" (70-84), "⚖️ Worth Considering" (50-69), "❌ No" (<50)

Hints marked "Known Sponsorship" and "Location Priority" come from earlier runs. Treat them as
context, not as rules."#;

/// Read the system prompt, falling back to [`DEFAULT_SYSTEM_PROMPT`].
pub fn load_system_prompt(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            warn!(path = %path.display(), "system prompt file is empty; using built-in prompt");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "system prompt unavailable; using built-in prompt");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

/// Everything the prompt says about one posting.
#[derive(Debug, Clone)]
pub struct JobContext<'a> {
    pub title: &'a str,
    pub company: &'a str,
    pub location: &'a str,
    pub url: &'a str,
    pub description: &'a str,
    pub sponsorship_hint: Option<String>,
    pub location_priority: LocationPriority,
    /// Profile keyword count at or above the nudge threshold.
    pub nudge_threshold: Option<usize>,
}

impl JobContext<'_> {
    pub fn render(&self, position: usize) -> String {
        let description = if self.description.trim().is_empty() {
            format!(
                "[No description available.] Estimate fit from title/location only. Job Link: {}",
                self.url
            )
        } else {
            self.description.trim().to_string()
        };
        let mut out = format!(
            "### JOB POSTING {position}\nJob Title: {}\nCompany: {}\nLocation: {}\n",
            self.title, self.company, self.location
        );
        if let Some(hint) = &self.sponsorship_hint {
            out.push_str(&format!("Known Sponsorship: {hint}\n"));
        }
        out.push_str(&format!(
            "Location Priority: {}\nJob Description: {description}",
            self.location_priority.label()
        ));
        if let Some(threshold) = self.nudge_threshold {
            out.push_str(&format!(
                "\n[Pre-check: This JD contains {threshold}+ skills from the profile. \
                 Rate it at least ✅ Strong Match (score 70 or higher).]"
            ));
        }
        out
    }
}

/// User prompt for one batch: profile block first, then one section per posting. With a JSON
/// format hint the batch is requested as one object wrapping an array, since JSON-mode
/// providers return a single value.
pub fn build_user_prompt(
    profile_summary: &str,
    jobs: &[JobContext<'_>],
    format: Option<FormatHint>,
) -> String {
    let postings = jobs
        .iter()
        .enumerate()
        .map(|(i, job)| job.render(i + 1))
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut prompt = format!("### USER PROFILES\n{profile_summary}\n\n{postings}");
    if jobs.len() > 1 {
        let layout = match format {
            Some(FormatHint::Json) => format!(
                "Return one JSON object of the form {{\"{BATCH_ARRAY_KEY}\": [...]}} whose array holds \
                 exactly {} objects, one per job, in posting order.",
                jobs.len()
            ),
            None => format!("Separate each job's evaluation with exactly: {BATCH_SEPARATOR}"),
        };
        prompt.push_str(&format!(
            "\n\n---\nEvaluate each job above in order. For each job output one JSON object with the keys \
             listed in the instructions. {layout}"
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::compact_prompt;
    use tempfile::tempdir;

    fn context<'a>(title: &'a str, description: &'a str) -> JobContext<'a> {
        JobContext {
            title,
            company: "Acme",
            location: "Austin, TX",
            url: "https://x.com/jobs/1",
            description,
            sponsorship_hint: None,
            location_priority: LocationPriority::Top,
            nudge_threshold: None,
        }
    }

    #[test]
    fn single_job_prompt_has_no_separator_instruction() {
        let prompt = build_user_prompt("SUMMARY", &[context("Business Analyst", "SQL")], None);
        assert!(prompt.starts_with("### USER PROFILES\nSUMMARY\n\n### JOB POSTING 1\nJob Title: Business Analyst\n"));
        assert!(prompt.contains("Location Priority: Top priority region\nJob Description: SQL"));
        assert!(!prompt.contains(BATCH_SEPARATOR));
    }

    #[test]
    fn batch_prompt_numbers_postings_and_names_separator() {
        let prompt = build_user_prompt("S", &[context("BA", "a"), context("PO", "b")], None);
        assert!(prompt.contains("### JOB POSTING 2\nJob Title: PO"));
        assert!(prompt.ends_with("Separate each job's evaluation with exactly: ---EVAL---"));
        assert!(compact_prompt(&prompt).starts_with("### JOB POSTING 1\n"));
    }

    #[test]
    fn json_mode_batch_prompt_asks_for_wrapped_array() {
        let jobs = [context("BA", "a"), context("PO", "b"), context("TPM", "c")];
        let prompt = build_user_prompt("S", &jobs, Some(FormatHint::Json));
        assert!(!prompt.contains(BATCH_SEPARATOR));
        assert!(prompt.ends_with(
            "Return one JSON object of the form {\"evaluations\": [...]} whose array holds exactly 3 objects, one per job, in posting order."
        ));

        let single = build_user_prompt("S", &jobs[..1], Some(FormatHint::Json));
        assert!(!single.contains("evaluations"));
    }

    #[test]
    fn hints_nudge_and_empty_description() {
        let mut job = context("BA", "  ");
        job.sponsorship_hint = Some("Sponsors (Learned from JD)".into());
        job.nudge_threshold = Some(5);
        let text = job.render(3);
        assert!(text.starts_with("### JOB POSTING 3\n"));
        assert!(text.contains("Known Sponsorship: Sponsors (Learned from JD)\n"));
        assert!(text.contains(
            "Job Description: [No description available.] Estimate fit from title/location only. Job Link: https://x.com/jobs/1"
        ));
        assert!(text.contains("[Pre-check: This JD contains 5+ skills from the profile."));
    }

    #[test]
    fn system_prompt_falls_back_to_built_in() {
        let dir = tempdir().expect("tempdir");
        let missing = load_system_prompt(&dir.path().join("none.md"));
        assert_eq!(missing, DEFAULT_SYSTEM_PROMPT);

        let path = dir.path().join("prompt.md");
        std::fs::write(&path, "Custom rubric").unwrap();
        assert_eq!(load_system_prompt(&path), "Custom rubric");
    }
}
