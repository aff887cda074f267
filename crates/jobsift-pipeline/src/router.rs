//! Ordered inference tiers with retry on transient failures and fallback on everything else.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BackoffConfig;

/// Reminder appended to the user prompt for tiers that drift from the requested format.
pub const STRICT_FORMAT_REMINDER: &str = "\n\nIMPORTANT: Respond with ONE valid JSON object per job and nothing else. \
Use exactly these keys: location_verification, h1b_sponsorship, recommended_resume, reasoning, \
salary_range, tech_stack, skill_gaps, apply_conviction_score, verdict. \
apply_conviction_score must be an integer from 0 to 100.";

static PROFILE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)### USER PROFILES.*?### JOB POSTING").expect("profile block regex")
});

/// Drop the profile block so smaller context windows only see the job postings.
pub fn compact_prompt(user_prompt: &str) -> String {
    PROFILE_BLOCK
        .replace(user_prompt, "### JOB POSTING")
        .into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    Json,
}

#[derive(Debug, Clone, Copy)]
pub struct InferenceRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub format: Option<FormatHint>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limits, timeouts and server errors. Retried inside the tier.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Auth failures, malformed requests and empty bodies. The tier is abandoned.
    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn id(&self) -> &str;
    async fn generate(&self, request: &InferenceRequest<'_>) -> Result<String, ProviderError>;
}

pub struct Tier {
    provider: Box<dyn InferenceProvider>,
    max_retries: usize,
    compact_prompt: bool,
    strict_format_reminder: bool,
}

impl Tier {
    pub fn new(provider: Box<dyn InferenceProvider>) -> Self {
        Self {
            provider,
            max_retries: 3,
            compact_prompt: false,
            strict_format_reminder: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_compact_prompt(mut self, compact: bool) -> Self {
        self.compact_prompt = compact;
        self
    }

    pub fn with_format_reminder(mut self, reminder: bool) -> Self {
        self.strict_format_reminder = reminder;
        self
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }

    fn attempts(&self) -> usize {
        self.max_retries.max(1)
    }

    fn user_prompt(&self, user_prompt: &str) -> String {
        let mut prompt = if self.compact_prompt {
            compact_prompt(user_prompt)
        } else {
            user_prompt.to_string()
        };
        if self.strict_format_reminder {
            prompt.push_str(STRICT_FORMAT_REMINDER);
        }
        prompt
    }
}

impl fmt::Debug for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tier")
            .field("provider", &self.provider.id())
            .field("max_retries", &self.max_retries)
            .field("compact_prompt", &self.compact_prompt)
            .field("strict_format_reminder", &self.strict_format_reminder)
            .finish()
    }
}

/// Delay before retry `attempt` (1-based) is `base^attempt` seconds, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: f64,
    pub max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        BackoffConfig::default().into()
    }
}

impl From<BackoffConfig> for ExponentialBackoff {
    fn from(config: BackoffConfig) -> Self {
        Self {
            base: config.base,
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }
}

impl ExponentialBackoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = self.base.max(0.0).powi(attempt as i32);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderId {
    Tier(String),
    /// Every tier was exhausted.
    Failed,
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tier(id) => f.write_str(id),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceOutcome {
    pub text: String,
    pub provider: ProviderId,
}

impl InferenceOutcome {
    pub fn failed() -> Self {
        Self {
            text: String::new(),
            provider: ProviderId::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.provider == ProviderId::Failed
    }
}

#[derive(Debug)]
pub struct InferenceRouter {
    tiers: Vec<Tier>,
    backoff: ExponentialBackoff,
}

impl InferenceRouter {
    pub fn new(tiers: Vec<Tier>, backoff: ExponentialBackoff) -> Self {
        Self { tiers, backoff }
    }

    pub fn tier_ids(&self) -> Vec<&str> {
        self.tiers.iter().map(Tier::id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Try each tier in order. Never errors: exhaustion is reported as [`ProviderId::Failed`].
    pub async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        format: Option<FormatHint>,
    ) -> InferenceOutcome {
        for tier in &self.tiers {
            let prompt = tier.user_prompt(user_prompt);
            let request = InferenceRequest {
                system_prompt,
                user_prompt: &prompt,
                format,
            };
            if let Some(text) = self.try_tier(tier, &request).await {
                info!(provider = tier.id(), chars = text.len(), "inference succeeded");
                return InferenceOutcome {
                    text,
                    provider: ProviderId::Tier(tier.id().to_string()),
                };
            }
            warn!(provider = tier.id(), "inference tier exhausted; falling back");
        }
        warn!(tiers = self.tiers.len(), "all inference tiers failed");
        InferenceOutcome::failed()
    }

    async fn try_tier(&self, tier: &Tier, request: &InferenceRequest<'_>) -> Option<String> {
        let attempts = tier.attempts();
        for attempt in 1..=attempts {
            match tier.provider.generate(request).await {
                Ok(text) if !text.trim().is_empty() => return Some(text),
                Ok(_) => {
                    warn!(provider = tier.id(), "empty inference response");
                    return None;
                }
                Err(ProviderError::Permanent(reason)) => {
                    warn!(provider = tier.id(), %reason, "permanent provider failure");
                    return None;
                }
                Err(ProviderError::Transient(reason)) if attempt < attempts => {
                    let delay = self.backoff.delay(attempt as u32);
                    warn!(
                        provider = tier.id(),
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient provider failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ProviderError::Transient(reason)) => {
                    debug!(provider = tier.id(), attempt, %reason, "retries exhausted");
                }
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Provider that replays a fixed script and records the prompts it saw.
    pub(crate) struct ScriptedProvider {
        id: String,
        script: Mutex<VecDeque<Result<String, ProviderError>>>,
        pub(crate) prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(id: &str, script: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                id: id.to_string(),
                script: Mutex::new(script.into()),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl InferenceProvider for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate(&self, request: &InferenceRequest<'_>) -> Result<String, ProviderError> {
            self.prompts
                .lock()
                .unwrap()
                .push(request.user_prompt.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Permanent("script exhausted".into())))
        }
    }

    fn no_wait() -> ExponentialBackoff {
        ExponentialBackoff {
            base: 2.0,
            max_delay: Duration::ZERO,
        }
    }

    fn transient() -> Result<String, ProviderError> {
        Err(ProviderError::Transient("429".into()))
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let backoff = ExponentialBackoff {
            base: 2.0,
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(200), Duration::from_secs(10));
    }

    #[test]
    fn compact_prompt_drops_profile_block() {
        let prompt = "### USER PROFILES\nskills...\n### TARGET ROLES\nTPM\n\n### JOB POSTING 1\nJob Title: BA";
        assert_eq!(compact_prompt(prompt), "### JOB POSTING 1\nJob Title: BA");
        assert_eq!(compact_prompt("no profile here"), "no profile here");
    }

    #[tokio::test]
    async fn first_success_wins() {
        let first = ScriptedProvider::new("A", vec![Ok("{\"apply_conviction_score\": 80}".into())]);
        let second = ScriptedProvider::new("B", vec![Ok("unused".into())]);
        let second_prompts = second.prompts.clone();
        let router = InferenceRouter::new(
            vec![Tier::new(Box::new(first)), Tier::new(Box::new(second))],
            no_wait(),
        );

        let outcome = router.generate("sys", "user", Some(FormatHint::Json)).await;
        assert_eq!(outcome.provider, ProviderId::Tier("A".into()));
        assert!(second_prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_retry_within_tier() {
        let provider = ScriptedProvider::new("A", vec![transient(), transient(), Ok("ok".into())]);
        let prompts = provider.prompts.clone();
        let router = InferenceRouter::new(
            vec![Tier::new(Box::new(provider)).with_max_retries(3)],
            no_wait(),
        );

        let outcome = router.generate("sys", "user", None).await;
        assert_eq!(outcome.text, "ok");
        assert_eq!(prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_skips_to_next_tier_without_retry() {
        let first = ScriptedProvider::new(
            "A",
            vec![Err(ProviderError::Permanent("401".into())), Ok("never".into())],
        );
        let first_prompts = first.prompts.clone();
        let second = ScriptedProvider::new("B", vec![Ok("from b".into())]);
        let router = InferenceRouter::new(
            vec![
                Tier::new(Box::new(first)).with_max_retries(3),
                Tier::new(Box::new(second)),
            ],
            no_wait(),
        );

        let outcome = router.generate("sys", "user", None).await;
        assert_eq!(outcome.provider.to_string(), "B");
        assert_eq!(outcome.text, "from b");
        assert_eq!(first_prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_body_counts_as_permanent() {
        let first = ScriptedProvider::new("A", vec![Ok("   ".into()), Ok("later".into())]);
        let first_prompts = first.prompts.clone();
        let second = ScriptedProvider::new("B", vec![Ok("from b".into())]);
        let router = InferenceRouter::new(
            vec![Tier::new(Box::new(first)), Tier::new(Box::new(second))],
            no_wait(),
        );

        assert_eq!(router.generate("s", "u", None).await.text, "from b");
        assert_eq!(first_prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausting_every_tier_reports_failed() {
        let first = ScriptedProvider::new("A", vec![transient(), transient()]);
        let second = ScriptedProvider::new("B", vec![Err(ProviderError::Permanent("400".into()))]);
        let router = InferenceRouter::new(
            vec![
                Tier::new(Box::new(first)).with_max_retries(2),
                Tier::new(Box::new(second)),
            ],
            no_wait(),
        );

        let outcome = router.generate("s", "u", None).await;
        assert!(outcome.is_failed());
        assert_eq!(outcome.text, "");
        assert_eq!(outcome.provider.to_string(), "FAILED");

        let empty = InferenceRouter::new(Vec::new(), no_wait());
        assert!(empty.generate("s", "u", None).await.is_failed());
    }

    #[tokio::test]
    async fn compact_tiers_receive_trimmed_prompt_with_reminder() {
        let first = ScriptedProvider::new("A", vec![Err(ProviderError::Permanent("quota".into()))]);
        let local = ScriptedProvider::new("LOCAL", vec![Ok("{}".into())]);
        let local_prompts = local.prompts.clone();
        let router = InferenceRouter::new(
            vec![
                Tier::new(Box::new(first)),
                Tier::new(Box::new(local))
                    .with_compact_prompt(true)
                    .with_format_reminder(true),
            ],
            no_wait(),
        );

        router
            .generate("s", "### USER PROFILES\nlong\n### JOB POSTING 1\nBA", None)
            .await;
        let seen = local_prompts.lock().unwrap();
        assert!(seen[0].starts_with("### JOB POSTING 1\nBA"));
        assert!(!seen[0].contains("USER PROFILES"));
        assert!(seen[0].ends_with(STRICT_FORMAT_REMINDER));
    }
}
