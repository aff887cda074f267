//! Two-stage decoder for model responses: a healed JSON decode, then heading regexes.

use jobsift_core::EvaluationResult;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Separator between per-job blocks of a batched response.
pub const BATCH_SEPARATOR: &str = "---EVAL---";

/// Key holding the per-job array when a batch is answered as a single JSON object.
pub const BATCH_ARRAY_KEY: &str = "evaluations";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no JSON object in response")]
    NoObject,
    #[error("malformed JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JSON value is not an object")]
    NotAnObject,
    #[error("no recognizable headings in response")]
    NoHeadings,
}

static SCORE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:apply\s+conviction\s+)?score\**\s*[:=]\s*\**\s*\[?\s*(\d{1,3})")
        .expect("score regex")
});

static VERDICT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)verdict\**\s*[:=]\s*\**\s*(.+?)\s*$").expect("verdict regex")
});

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("digits regex"));

fn heading_regex(heading: &str) -> Regex {
    Regex::new(&format!(
        r"(?is)\*\*{}\*\*:?\s*\n*(.*?)(?:\n\n|\n\*\*|$)",
        regex::escape(heading)
    ))
    .expect("heading regex")
}

static LOCATION_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex("Location Verification"));
static H1B_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex("H1B Sponsorship"));
static RESUME_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex("Recommended Resume"));
static REASONING_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex("Reasoning"));
static SALARY_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex("Salary Range"));
static TECH_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex("Tech Stack"));
static SKILLS_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex("Skill Gap Summary"));

fn strip_padding(value: &str) -> String {
    value
        .trim()
        .trim_matches(|c: char| c == '[' || c == ']' || c == '*' || c == '"' || c.is_whitespace())
        .to_string()
}

/// A scalar delivered as a one-element list is unwrapped.
fn unwrap_singleton(value: &Value) -> &Value {
    match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    }
}

fn healed_text(value: Option<&Value>) -> Option<String> {
    let text = match unwrap_singleton(value?) {
        Value::String(s) => strip_padding(s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(strip_padding))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn healed_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(strip_padding(s)),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => split_list_text(s),
        _ => Vec::new(),
    }
}

/// Integer score in `0..=100`, cleaned of stray characters.
fn healed_score(value: Option<&Value>) -> Option<u8> {
    let raw = match unwrap_singleton(value?) {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => DIGITS.find(s)?.as_str().parse::<f64>().ok()?,
        _ => return None,
    };
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

fn field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

/// Structured decode of the text between the first `{` and the last `}`.
pub fn decode_structured(text: &str) -> Result<EvaluationResult, DecodeError> {
    let start = text.find('{').ok_or(DecodeError::NoObject)?;
    let end = text.rfind('}').ok_or(DecodeError::NoObject)?;
    if end < start {
        return Err(DecodeError::NoObject);
    }
    match serde_json::from_str::<Value>(&text[start..=end])? {
        Value::Object(object) => Ok(decode_object(&object)),
        _ => Err(DecodeError::NotAnObject),
    }
}

fn decode_object(object: &Map<String, Value>) -> EvaluationResult {
    let defaults = EvaluationResult::unparsed();
    EvaluationResult {
        location_verification: healed_text(field(object, &["location_verification"]))
            .unwrap_or(defaults.location_verification),
        h1b_status: healed_text(field(object, &["h1b_sponsorship", "h1b_status"]))
            .unwrap_or(defaults.h1b_status),
        recommended_role: healed_text(field(object, &["recommended_resume", "recommended_role"]))
            .unwrap_or(defaults.recommended_role),
        reasoning: healed_text(field(object, &["reasoning"])).unwrap_or(defaults.reasoning),
        salary_range: healed_text(field(object, &["salary_range"]))
            .unwrap_or(defaults.salary_range),
        tech_stack: healed_list(field(object, &["tech_stack"])),
        missing_skills: healed_list(field(object, &["skill_gaps", "missing_skills"])),
        score: healed_score(field(object, &["apply_conviction_score", "score"]))
            .unwrap_or(EvaluationResult::UNSCORED),
        declared_verdict: healed_text(field(object, &["verdict"])),
    }
}

/// Per-job values of a JSON-mode batch reply: a top-level array, or an object wrapping one
/// under `evaluations`.
fn json_batch_items(text: &str) -> Option<Vec<Value>> {
    let start = text.find(['[', '{'])?;
    let end = text.rfind([']', '}'])?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]).ok()? {
        Value::Array(items) => Some(items),
        Value::Object(mut object) => match object.remove(BATCH_ARRAY_KEY) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn split_list_text(text: &str) -> Vec<String> {
    text.split([',', '\n'])
        .map(|item| {
            strip_padding(item)
                .trim_start_matches(['-', '\''])
                .trim_end_matches('\'')
                .trim()
                .to_string()
        })
        .filter(|item| !item.is_empty())
        .collect()
}

fn capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| strip_padding(m.as_str()))
        .filter(|s| !s.is_empty())
}

/// Fallback decode of Markdown headings such as `**Reasoning**` and `Score: 78` lines.
pub fn decode_headings(text: &str) -> Result<EvaluationResult, DecodeError> {
    let location = capture(&LOCATION_HEADING, text);
    let h1b = capture(&H1B_HEADING, text);
    let resume = capture(&RESUME_HEADING, text);
    let reasoning = capture(&REASONING_HEADING, text);
    let salary = capture(&SALARY_HEADING, text);
    let tech = capture(&TECH_HEADING, text);
    let skills = capture(&SKILLS_HEADING, text);
    let score = SCORE_LINE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .map(|s| s.min(100) as u8);
    let verdict = capture(&VERDICT_LINE, text);

    let found = [&location, &h1b, &resume, &reasoning, &salary, &tech, &skills, &verdict]
        .iter()
        .any(|f| f.is_some())
        || score.is_some();
    if !found {
        return Err(DecodeError::NoHeadings);
    }

    let defaults = EvaluationResult::unparsed();
    Ok(EvaluationResult {
        location_verification: location.unwrap_or(defaults.location_verification),
        h1b_status: h1b.unwrap_or(defaults.h1b_status),
        recommended_role: resume.unwrap_or(defaults.recommended_role),
        reasoning: reasoning.unwrap_or(defaults.reasoning),
        salary_range: salary.unwrap_or(defaults.salary_range),
        tech_stack: tech.as_deref().map(split_list_text).unwrap_or_default(),
        missing_skills: skills.as_deref().map(split_list_text).unwrap_or_default(),
        score: score.unwrap_or(EvaluationResult::UNSCORED),
        declared_verdict: verdict,
    })
}

/// Decode one job's response. Never fails: unusable text yields [`EvaluationResult::unparsed`].
pub fn parse(text: &str) -> EvaluationResult {
    let structured_err = match decode_structured(text) {
        Ok(result) => return result,
        Err(err) => err,
    };
    debug!(error = %structured_err, "structured decode failed; trying headings");
    match decode_headings(text) {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, chars = text.len(), "response could not be decoded");
            EvaluationResult::unparsed()
        }
    }
}

/// Split a batched response into exactly `expected` results, padding missing blocks.
/// JSON-mode replies (an array, or `{"evaluations": [...]}`) are split by element; anything
/// else is split on [`BATCH_SEPARATOR`].
pub fn split_batch_response(text: &str, expected: usize) -> Vec<EvaluationResult> {
    if expected <= 1 {
        return (0..expected).map(|_| parse(text)).collect();
    }
    let mut results = match json_batch_items(text) {
        Some(items) => {
            debug!(items = items.len(), "batched response decoded as a JSON array");
            items
                .iter()
                .map(|item| match item {
                    Value::Object(object) => decode_object(object),
                    _ => EvaluationResult::unparsed(),
                })
                .collect::<Vec<_>>()
        }
        None => text
            .split(BATCH_SEPARATOR)
            .map(str::trim)
            .filter(|block| !block.is_empty())
            .map(parse)
            .collect::<Vec<_>>(),
    };
    if results.len() != expected {
        warn!(expected, got = results.len(), "batched response block count mismatch");
    }
    results.resize_with(expected, EvaluationResult::unparsed);
    results
}
