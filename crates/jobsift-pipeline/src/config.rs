//! Pipeline configuration. Every section and field has a built-in default, so a missing file
//! or a partial file is never an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::filter::FilterTables;
use crate::scoring::ScoringConfig;

pub const CONFIG_PATH_ENV: &str = "JOBSIFT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sourcing: SourcingConfig,
    pub evaluation: EvaluationConfig,
    pub providers: ProvidersConfig,
    pub backoff: BackoffConfig,
    pub filters: FilterTables,
    pub scoring: ScoringConfig,
    pub paths: PathsConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcingConfig {
    pub queries: Vec<String>,
    /// Location searched -> results wanted per query.
    pub locations: BTreeMap<String, usize>,
    pub max_workers: usize,
    /// Adapter ids, see `jobsift_adapters::adapter_for_source`.
    pub adapters: Vec<String>,
}

impl Default for SourcingConfig {
    fn default() -> Self {
        Self {
            queries: [
                "Product Manager",
                "Project Manager",
                "Program Manager",
                "Business Analyst",
                "Product Owner",
                "Scrum Master",
                "Strategy Operations",
                "GTM Manager",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            locations: [("United States", 80), ("Dubai", 20), ("Remote", 50)]
                .into_iter()
                .map(|(loc, n)| (loc.to_string(), n))
                .collect(),
            max_workers: 4,
            adapters: vec!["remotive".to_string(), "arbeitnow".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Jobs carried by one inference call.
    pub batch_size: usize,
    /// Processed jobs between partial writes to the store.
    pub checkpoint_interval: usize,
    /// Maximum `NEW` rows pulled per run.
    pub limit: usize,
    /// Goal for `run_until_target`: high-tier verdicts to collect. `0` disables the loop.
    pub target_high_tier: usize,
    pub max_iterations: usize,
    /// Ask providers for their JSON output mode.
    pub json_mode: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            checkpoint_interval: 25,
            limit: 300,
            target_high_tier: 0,
            max_iterations: 5,
            json_mode: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    Openai,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Label reported as the provider id of a successful call.
    pub id: String,
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the credential. Tiers whose key is unset are skipped.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Drop the profile block from the user prompt for this tier.
    #[serde(default)]
    pub compact_prompt: bool,
    /// Append the strict output-format reminder for this tier.
    #[serde(default)]
    pub strict_format_reminder: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_max_retries() -> usize {
    3
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Tried in order; the first success wins.
    pub tiers: Vec<ProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                ProviderConfig {
                    id: "GEMINI".to_string(),
                    kind: ProviderKind::Gemini,
                    model: "gemini-2.0-flash".to_string(),
                    base_url: None,
                    api_key_env: Some("GEMINI_API_KEY".to_string()),
                    max_retries: 3,
                    timeout_secs: 120,
                    compact_prompt: false,
                    strict_format_reminder: false,
                    enabled: true,
                },
                ProviderConfig {
                    id: "OPENAI".to_string(),
                    kind: ProviderKind::Openai,
                    model: "gpt-4o-mini".to_string(),
                    base_url: None,
                    api_key_env: Some("OPENAI_API_KEY".to_string()),
                    max_retries: 3,
                    timeout_secs: 120,
                    compact_prompt: true,
                    strict_format_reminder: false,
                    enabled: true,
                },
                ProviderConfig {
                    id: "OLLAMA".to_string(),
                    kind: ProviderKind::Ollama,
                    model: "llama3.2".to_string(),
                    base_url: None,
                    api_key_env: None,
                    max_retries: 1,
                    timeout_secs: 300,
                    compact_prompt: true,
                    strict_format_reminder: true,
                    enabled: true,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Retry delay is `base^attempt` seconds.
    pub base: f64,
    pub max_delay_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: 2.0,
            max_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory of daily CSV tabs.
    pub store_dir: PathBuf,
    /// Directory of the intelligence caches.
    pub data_dir: PathBuf,
    pub jd_cache: PathBuf,
    pub profile: PathBuf,
    pub system_prompt: PathBuf,
    pub reports_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("data/jobs"),
            data_dir: PathBuf::from("data"),
            jd_cache: PathBuf::from("data/jd_cache.json"),
            profile: PathBuf::from("config/profile.yaml"),
            system_prompt: PathBuf::from("config/system_prompt.md"),
            reports_dir: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub crons: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            crons: vec!["0 6 * * *".to_string(), "0 18 * * *".to_string()],
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Load from `path`, falling back to defaults when the file is missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.is_file() {
            info!(path = %path.display(), "no pipeline config file; using built-in defaults");
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "pipeline config unusable; using built-in defaults");
                Self::default()
            }
        }
    }

    /// Resolve the config path from `JOBSIFT_CONFIG`, load it and apply environment overrides.
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load_or_default(&path);
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut PathBuf); 4] = [
            ("JOBSIFT_STORE_DIR", &mut self.paths.store_dir),
            ("JOBSIFT_DATA_DIR", &mut self.paths.data_dir),
            ("JOBSIFT_PROFILE", &mut self.paths.profile),
            ("JOBSIFT_REPORTS_DIR", &mut self.paths.reports_dir),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    *slot = PathBuf::from(value);
                }
            }
        }
        if let Ok(value) = std::env::var("JOBSIFT_SCHEDULER_ENABLED") {
            self.schedule.enabled = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
    }
}
