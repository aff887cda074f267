//! HTTP inference transports. Each one normalizes a provider-specific JSON envelope into text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobsift_storage::is_transient_status;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, ProviderConfig, ProviderKind};
use crate::router::{
    ExponentialBackoff, FormatHint, InferenceProvider, InferenceRequest, InferenceRouter,
    ProviderError, Tier,
};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";

pub fn default_base_url(kind: ProviderKind) -> String {
    match kind {
        ProviderKind::Gemini => GEMINI_BASE_URL.to_string(),
        ProviderKind::Openai => OPENAI_BASE_URL.to_string(),
        ProviderKind::Ollama => std::env::var(OLLAMA_HOST_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
    }
}

pub fn endpoint(kind: ProviderKind, base_url: &str, model: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match kind {
        ProviderKind::Gemini => format!("{base}/v1beta/models/{model}:generateContent"),
        ProviderKind::Openai => format!("{base}/v1/chat/completions"),
        ProviderKind::Ollama => format!("{base}/api/generate"),
    }
}

/// Provider-specific request envelope.
pub fn request_body(kind: ProviderKind, model: &str, request: &InferenceRequest<'_>) -> Value {
    let json_mode = request.format == Some(FormatHint::Json);
    match kind {
        ProviderKind::Gemini => {
            let mut body = json!({
                "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
                "contents": [{ "role": "user", "parts": [{ "text": request.user_prompt }] }],
            });
            if json_mode {
                body["generationConfig"] = json!({ "responseMimeType": "application/json" });
            }
            body
        }
        ProviderKind::Openai => {
            let mut body = json!({
                "model": model,
                "messages": [
                    { "role": "system", "content": request.system_prompt },
                    { "role": "user", "content": request.user_prompt },
                ],
            });
            if json_mode {
                body["response_format"] = json!({ "type": "json_object" });
            }
            body
        }
        ProviderKind::Ollama => {
            let mut body = json!({
                "model": model,
                "system": request.system_prompt,
                "prompt": request.user_prompt,
                "stream": false,
            });
            if json_mode {
                body["format"] = json!("json");
            }
            body
        }
    }
}

/// Pull the generated text out of a response envelope.
pub fn extract_text(kind: ProviderKind, body: &Value) -> Option<String> {
    let text = match kind {
        ProviderKind::Gemini => body["candidates"][0]["content"]["parts"]
            .as_array()?
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<String>(),
        ProviderKind::Openai => body["choices"][0]["message"]["content"].as_str()?.to_string(),
        ProviderKind::Ollama => body["response"].as_str()?.to_string(),
    };
    (!text.trim().is_empty()).then_some(text)
}

/// Rate limits, request timeouts and server errors are worth retrying.
pub fn classify_provider_status(status: StatusCode) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }
    let reason = format!("HTTP {status}");
    if status == StatusCode::REQUEST_TIMEOUT || is_transient_status(status) {
        Some(ProviderError::Transient(reason))
    } else {
        Some(ProviderError::Permanent(reason))
    }
}

fn classify_transport_error(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Transient(format!("timed out: {err}"))
    } else {
        ProviderError::Permanent(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpProvider {
    id: String,
    kind: ProviderKind,
    model: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("jobsift/", env!("CARGO_PKG_VERSION")))
            .build()
            .with_context(|| format!("building HTTP client for provider {}", config.id))?;
        Ok(Self {
            id: config.id.clone(),
            kind: config.kind,
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| default_base_url(config.kind)),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl InferenceProvider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: &InferenceRequest<'_>) -> Result<String, ProviderError> {
        let url = endpoint(self.kind, &self.base_url, &self.model);
        let mut builder = self
            .client
            .post(&url)
            .json(&request_body(self.kind, &self.model, request));
        builder = match (self.kind, &self.api_key) {
            (ProviderKind::Gemini, Some(key)) => builder.query(&[("key", key.as_str())]),
            (_, Some(key)) => builder.bearer_auth(key),
            (_, None) => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|err| classify_transport_error(&err))?;
        let status = response.status();
        if let Some(err) = classify_provider_status(status) {
            let body = response.text().await.unwrap_or_default();
            debug!(provider = %self.id, %status, body = %body.chars().take(300).collect::<String>(), "provider error body");
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::Permanent(format!("decoding envelope: {err}")))?;
        extract_text(self.kind, &body)
            .ok_or_else(|| ProviderError::Permanent("empty response body".to_string()))
    }
}

/// Build the router from configured tiers. Disabled tiers and tiers without credentials are skipped.
pub fn build_router(config: &PipelineConfig) -> Result<InferenceRouter> {
    let mut tiers = Vec::new();
    for tier in &config.providers.tiers {
        if !tier.enabled {
            debug!(provider = %tier.id, "provider disabled");
            continue;
        }
        let api_key = match &tier.api_key_env {
            Some(var) => match std::env::var(var).ok().filter(|v| !v.trim().is_empty()) {
                Some(key) => Some(key),
                None => {
                    warn!(provider = %tier.id, env = %var, "credential not set; skipping tier");
                    continue;
                }
            },
            None => None,
        };
        let provider = HttpProvider::new(tier, api_key)?;
        tiers.push(
            Tier::new(Box::new(provider))
                .with_max_retries(tier.max_retries)
                .with_compact_prompt(tier.compact_prompt)
                .with_format_reminder(tier.strict_format_reminder),
        );
    }
    let router = InferenceRouter::new(tiers, ExponentialBackoff::from(config.backoff));
    info!(tiers = ?router.tier_ids(), "inference router ready");
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(format: Option<FormatHint>) -> InferenceRequest<'static> {
        InferenceRequest {
            system_prompt: "You are a recruiter.",
            user_prompt: "### JOB POSTING 1",
            format,
        }
    }

    #[test]
    fn json_hint_maps_to_each_provider_mode() {
        let hint = request(Some(FormatHint::Json));
        let gemini = request_body(ProviderKind::Gemini, "gemini-2.0-flash", &hint);
        assert_eq!(
            gemini["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(gemini["systemInstruction"]["parts"][0]["text"], "You are a recruiter.");

        let openai = request_body(ProviderKind::Openai, "gpt-4o-mini", &hint);
        assert_eq!(openai["response_format"]["type"], "json_object");
        assert_eq!(openai["messages"][1]["content"], "### JOB POSTING 1");

        let ollama = request_body(ProviderKind::Ollama, "llama3.2", &hint);
        assert_eq!(ollama["format"], "json");
        assert_eq!(ollama["stream"], false);

        let plain = request_body(ProviderKind::Ollama, "llama3.2", &request(None));
        assert!(plain.get("format").is_none());
    }

    #[test]
    fn endpoints_follow_provider_conventions() {
        assert_eq!(
            endpoint(ProviderKind::Gemini, "https://g.example/", "gemini-2.0-flash"),
            "https://g.example/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            endpoint(ProviderKind::Openai, "https://api.openai.com", "gpt-4o-mini"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            endpoint(ProviderKind::Ollama, "http://localhost:11434", "llama3.2"),
            "http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn envelopes_decode_to_text() {
        let gemini = json!({"candidates": [{"content": {"parts": [{"text": "{\"a\":"}, {"text": "1}"}]}}]});
        assert_eq!(extract_text(ProviderKind::Gemini, &gemini).as_deref(), Some("{\"a\":1}"));

        let openai = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_text(ProviderKind::Openai, &openai).as_deref(), Some("hello"));

        let ollama = json!({"response": "  "});
        assert_eq!(extract_text(ProviderKind::Ollama, &ollama), None);
        assert_eq!(extract_text(ProviderKind::Openai, &json!({})), None);
    }

    #[test]
    fn statuses_split_into_transient_and_permanent() {
        assert!(matches!(
            classify_provider_status(StatusCode::TOO_MANY_REQUESTS),
            Some(ProviderError::Transient(_))
        ));
        assert!(matches!(
            classify_provider_status(StatusCode::REQUEST_TIMEOUT),
            Some(ProviderError::Transient(_))
        ));
        assert!(matches!(
            classify_provider_status(StatusCode::BAD_GATEWAY),
            Some(ProviderError::Transient(_))
        ));
        assert!(matches!(
            classify_provider_status(StatusCode::UNAUTHORIZED),
            Some(ProviderError::Permanent(_))
        ));
        assert!(matches!(
            classify_provider_status(StatusCode::BAD_REQUEST),
            Some(ProviderError::Permanent(_))
        ));
        assert_eq!(classify_provider_status(StatusCode::OK), None);
    }

    #[test]
    fn tiers_without_credentials_are_skipped() {
        let mut config = PipelineConfig::default();
        for tier in &mut config.providers.tiers {
            tier.api_key_env = Some("JOBSIFT_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        }
        config.providers.tiers[2].api_key_env = None;

        let router = build_router(&config).expect("router");
        assert_eq!(router.tier_ids(), vec!["OLLAMA"]);
    }
}
