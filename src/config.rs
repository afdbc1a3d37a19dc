//! Configuration for thinktank.
//!
//! Settings live in `thinktank.toml` inside the data directory
//! (`./.thinktank/` unless `--data-dir` says otherwise) and are layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [provider]
//! base_url = "https://openrouter.ai/api/v1"
//! api_key = "sk-..."          # or THINKTANK_API_KEY / OPENROUTER_API_KEY
//!
//! [models]
//! agents = ["openai/gpt-4o-mini", "anthropic/claude-haiku-4.5"]
//! synthesis = "openai/gpt-4o"
//! review = "anthropic/claude-sonnet-4.5"
//!
//! [models.labels]
//! "acme/x-1" = "Acme X"
//!
//! [retry]
//! enabled = true
//! threshold = 3
//!
//! [history]
//! max_runs = 20
//! fallback_runs = 5
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::gateway::ModelCatalog;
use crate::pipeline::{DEFAULT_RETRY_THRESHOLD, RetryPolicy};
use crate::run::{MAX_RUNS, ModelSelection};
use crate::storage::FALLBACK_RUNS_LIMIT;

pub const CONFIG_FILE: &str = "thinktank.toml";
pub const DEFAULT_DATA_DIR: &str = ".thinktank";
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_AGENT_MODEL_IDS: &[&str] = &[
    "openai/gpt-4o-mini",
    "anthropic/claude-haiku-4.5",
    "google/gemini-3-flash-preview",
];
pub const DEFAULT_SYNTHESIS_MODEL_ID: &str = "openai/gpt-4o";
pub const DEFAULT_REVIEW_MODEL_ID: &str = "anthropic/claude-sonnet-4.5";

/// Environment variables checked for the provider key, in order.
pub const API_KEY_ENV_VARS: &[&str] = &["THINKTANK_API_KEY", "OPENROUTER_API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsSection {
    /// Agent pool, in fan-out order
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,
    #[serde(default = "default_synthesis")]
    pub synthesis: String,
    #[serde(default = "default_review")]
    pub review: String,
    /// Extra display labels for the agent resolver
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn default_agents() -> Vec<String> {
    DEFAULT_AGENT_MODEL_IDS.iter().map(|m| m.to_string()).collect()
}

fn default_synthesis() -> String {
    DEFAULT_SYNTHESIS_MODEL_ID.to_string()
}

fn default_review() -> String {
    DEFAULT_REVIEW_MODEL_ID.to_string()
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            agents: default_agents(),
            synthesis: default_synthesis(),
            review: default_review(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> u32 {
    DEFAULT_RETRY_THRESHOLD
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_RETRY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySection {
    /// Runs kept in history
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,
    /// Runs kept when a snapshot does not fit in storage
    #[serde(default = "default_fallback_runs")]
    pub fallback_runs: usize,
    /// Byte limit for the stored snapshot; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_bytes: Option<usize>,
}

fn default_max_runs() -> usize {
    MAX_RUNS
}

fn default_fallback_runs() -> usize {
    FALLBACK_RUNS_LIMIT
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            max_runs: MAX_RUNS,
            fallback_runs: FALLBACK_RUNS_LIMIT,
            capacity_bytes: None,
        }
    }
}

/// The complete thinktank.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinktankToml {
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub history: HistorySection,
}

impl ThinktankToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse thinktank.toml")
    }

    /// Load `thinktank.toml` from the data directory, or defaults if absent.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize thinktank.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Provider key: file, then the environment.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_with(|name| std::env::var(name).ok())
    }

    fn api_key_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.provider
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                API_KEY_ENV_VARS
                    .iter()
                    .filter_map(|name| env(name))
                    .find(|k| !k.trim().is_empty())
            })
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.retry.enabled && self.retry.threshold == 0 {
            warnings.push(
                "retry.threshold is 0: each unit still gets exactly one attempt".to_string(),
            );
        }

        if self.models.agents.is_empty() {
            warnings.push("models.agents is empty: agent stages cannot run".to_string());
        }

        let mut seen = HashSet::new();
        for agent in &self.models.agents {
            if !seen.insert(agent.as_str()) {
                warnings.push(format!("Duplicate agent model '{}' in models.agents", agent));
            }
        }

        if self.models.synthesis.trim().is_empty() {
            warnings.push("models.synthesis is empty: synthesis stages cannot run".to_string());
        }
        if self.models.review.trim().is_empty() {
            warnings.push("models.review is empty: review stages cannot run".to_string());
        }

        if self.history.max_runs == 0 {
            warnings.push("history.max_runs is 0: one run is always kept".to_string());
        }
        if self.history.fallback_runs > self.history.max_runs {
            warnings.push(format!(
                "history.fallback_runs ({}) exceeds history.max_runs ({})",
                self.history.fallback_runs, self.history.max_runs
            ));
        }

        warnings
    }
}

/// Resolved configuration.
///
/// Merges settings from:
/// 1. thinktank.toml
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct ThinktankConfig {
    pub data_dir: PathBuf,
    pub toml: ThinktankToml,
    pub verbose: bool,
    /// CLI override for the agent pool
    pub cli_agents: Option<Vec<String>>,
    /// CLI override for the retry threshold
    pub cli_retry_threshold: Option<u32>,
    /// CLI switch disabling retries
    pub cli_no_retry: bool,
}

impl ThinktankConfig {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        let toml = ThinktankToml::load_or_default(&data_dir)?;
        Ok(Self {
            data_dir,
            toml,
            verbose: false,
            cli_agents: None,
            cli_retry_threshold: None,
            cli_no_retry: false,
        })
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn api_key(&self) -> Option<String> {
        self.toml.api_key()
    }

    pub fn base_url(&self) -> String {
        std::env::var("THINKTANK_BASE_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.toml.provider.base_url.clone())
    }

    /// Model selection (CLI → file).
    pub fn models(&self) -> ModelSelection {
        ModelSelection {
            agent_model_ids: self
                .cli_agents
                .clone()
                .unwrap_or_else(|| self.toml.models.agents.clone()),
            synthesis_model_id: self.toml.models.synthesis.clone(),
            review_model_id: self.toml.models.review.clone(),
        }
    }

    /// Retry policy (CLI → file).
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.toml.retry.enabled && !self.cli_no_retry,
            threshold: self.cli_retry_threshold.unwrap_or(self.toml.retry.threshold),
        }
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::builtin().with_labels(&self.toml.models.labels)
    }

    pub fn max_runs(&self) -> usize {
        self.toml.history.max_runs.max(1)
    }

    pub fn fallback_runs(&self) -> usize {
        self.toml.history.fallback_runs
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
