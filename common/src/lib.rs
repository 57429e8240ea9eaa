/*!
common/src/lib.rs

Shared configuration types for newsbrief.

This file provides:
- Config data structures (deserialized from TOML)
- Loaders for a single TOML file or a default + override pair (deep merged)
- Typed accessors that resolve the documented defaults
*/

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;
pub const DEFAULT_SELECTION_CAP: usize = 6;
pub const DEFAULT_DAILY_TOKENS: usize = 4000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Top-level tables an override file replaces wholesale instead of merging key by key
const REPLACED_TABLES: [&str; 1] = ["topics"];

/// Where artifacts and rendered pages are written
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding `raw_{date}.json`, `dedup_{date}.json`, ... (default ".")
    pub artifact_dir: Option<String>,
    /// Root of the rendered markdown tree (default "content/news")
    pub content_dir: Option<String>,
}

/// Near-duplicate detection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Cosine similarity at or above which two titles are duplicates
    pub threshold: Option<f64>,
}

/// Selection stage options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub cap: Option<usize>,
    /// Fixed seed for the fallback sampler. When unset the seed is derived from the run date.
    pub seed: Option<u64>,
    /// Set to false to skip the ranking oracle and always use the fallback sampler
    pub use_oracle: Option<bool>,
}

/// Daily LLM token budget
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_tokens: Option<usize>,
    /// Abort further LLM calls once the budget is spent instead of only warning
    pub hard_limit: Option<bool>,
}

/// Retry/backoff for calls to external services
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
}

/// Remote LLM endpoint (OpenAI-compatible)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

/// LLM top-level config grouping task-specific endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote", "none"
    /// Language the summaries are written in (default "Chinese")
    pub summary_language: Option<String>,
    // Fallback: single remote config
    pub remote: Option<RemoteLlmConfig>,
    // Task-specific configs
    pub summarization: Option<RemoteLlmConfig>,
    pub selection: Option<RemoteLlmConfig>,
}

/// Title embedding model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub adapter: Option<String>, // "local", "remote", "hashing"
    /// Vector size for the hashing model
    pub dimensions: Option<usize>,
    /// Where the local model files are downloaded and cached
    pub cache_dir: Option<String>,
    pub remote: Option<RemoteLlmConfig>,
}

/// Simple feed descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewsApiConfig {
    pub enabled: Option<bool>,
    pub api_key_env: Option<String>,
    pub query: Option<String>,
    pub domains: Option<Vec<String>>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardianConfig {
    pub enabled: Option<bool>,
    pub api_key_env: Option<String>,
    pub query: Option<String>,
    pub section: Option<String>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RssConfig {
    pub enabled: Option<bool>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    pub per_feed_limit: Option<usize>,
    pub date_tolerance_days: Option<i64>,
}

/// Fetch sources
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub fetch_timeout_seconds: Option<u64>,
    pub newsapi: Option<NewsApiConfig>,
    pub guardian: Option<GuardianConfig>,
    pub rss: Option<RssConfig>,
}

/// Git publishing of the rendered page
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub repo_path: Option<String>,
    pub remote: Option<String>,
    pub branch: Option<String>,
    pub auto_push: Option<bool>,
    /// Commit message; `{date}` is replaced with the run date
    pub commit_message: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub pipeline: Option<PipelineConfig>,
    pub dedup: Option<DedupConfig>,
    pub selection: Option<SelectionConfig>,
    /// Topic label -> positive weight
    #[serde(default)]
    pub topics: BTreeMap<String, u32>,
    pub budget: Option<BudgetConfig>,
    pub retry: Option<RetryConfig>,
    pub llm: Option<LlmConfig>,
    pub embedding: Option<EmbeddingConfig>,
    pub sources: Option<SourcesConfig>,
    pub publisher: Option<PublisherConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence). A `[topics]` table in
    /// the override replaces the default weights entirely.
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            if let (toml::Value::Table(merged), toml::Value::Table(incoming)) = (&mut config_value, &val) {
                for key in REPLACED_TABLES.iter().filter(|k| incoming.contains_key(**k)) {
                    merged.remove(*key);
                }
            }
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.similarity_threshold();
        if !(threshold > 0.0 && threshold <= 1.0) {
            bail!("dedup.threshold must be in (0, 1], got {}", threshold);
        }
        if self.selection_cap() == 0 {
            bail!("selection.cap must be at least 1");
        }
        if self.retry_attempts() == 0 {
            bail!("retry.attempts must be at least 1");
        }
        if let Some((topic, _)) = self.topics.iter().find(|(_, w)| **w == 0) {
            bail!("topic weight for '{}' must be a positive integer", topic);
        }
        Ok(())
    }

    pub fn artifact_dir(&self) -> &str {
        self.pipeline
            .as_ref()
            .and_then(|p| p.artifact_dir.as_deref())
            .unwrap_or(".")
    }

    pub fn content_dir(&self) -> &str {
        self.pipeline
            .as_ref()
            .and_then(|p| p.content_dir.as_deref())
            .unwrap_or("content/news")
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.dedup
            .as_ref()
            .and_then(|d| d.threshold)
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD)
    }

    pub fn selection_cap(&self) -> usize {
        self.selection
            .as_ref()
            .and_then(|s| s.cap)
            .unwrap_or(DEFAULT_SELECTION_CAP)
    }

    pub fn selection_seed(&self) -> Option<u64> {
        self.selection.as_ref().and_then(|s| s.seed)
    }

    pub fn use_oracle(&self) -> bool {
        self.selection
            .as_ref()
            .and_then(|s| s.use_oracle)
            .unwrap_or(true)
    }

    pub fn daily_tokens(&self) -> usize {
        self.budget
            .as_ref()
            .and_then(|b| b.daily_tokens)
            .unwrap_or(DEFAULT_DAILY_TOKENS)
    }

    pub fn budget_hard_limit(&self) -> bool {
        self.budget
            .as_ref()
            .and_then(|b| b.hard_limit)
            .unwrap_or(false)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry
            .as_ref()
            .and_then(|r| r.attempts)
            .unwrap_or(DEFAULT_RETRY_ATTEMPTS)
    }

    pub fn backoff_base_ms(&self) -> u64 {
        self.retry
            .as_ref()
            .and_then(|r| r.backoff_base_ms)
            .unwrap_or(DEFAULT_BACKOFF_BASE_MS)
    }

    pub fn backoff_max_ms(&self) -> u64 {
        self.retry
            .as_ref()
            .and_then(|r| r.backoff_max_ms)
            .unwrap_or(DEFAULT_BACKOFF_MAX_MS)
    }

    pub fn summary_language(&self) -> &str {
        self.llm
            .as_ref()
            .and_then(|l| l.summary_language.as_deref())
            .unwrap_or("Chinese")
    }

    pub fn fetch_timeout_seconds(&self) -> u64 {
        self.sources
            .as_ref()
            .and_then(|s| s.fetch_timeout_seconds)
            .unwrap_or(30)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}
