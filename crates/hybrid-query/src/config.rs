//! TOML configuration.
//!
//! Every section except `[database]` and `[generation]` has defaults, so a
//! minimal config names the target database and the generation backend.
//! [`load_config`] parses and validates; validation failures are reported
//! through `anyhow` with the offending key in the message.

use anyhow::{Context, Result};
use hybrid_query_core::embedding::Similarity;
use hybrid_query_core::fusion::FusionWeights;
use hybrid_query_core::history::{HistoryConfig as CoreHistoryConfig, HistoryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Vector store location (SQLite file owned by this tool).
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub similarity: Similarity,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            similarity: Similarity::Cosine,
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/vectors.sqlite")
}

/// The relational database questions are asked against. Opened read-only.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_rows")]
    pub max_rows: i64,
    #[serde(default = "default_schema_refresh_secs")]
    pub schema_refresh_secs: u64,
    /// Tables exposed to the engine; empty means all user tables.
    #[serde(default)]
    pub tables: Vec<String>,
}

fn default_max_rows() -> i64 {
    50
}
fn default_schema_refresh_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_weight")]
    pub w_sql: f64,
    #[serde(default = "default_weight")]
    pub w_vector: f64,
    #[serde(default = "default_sql_row_score")]
    pub sql_row_score: f64,
    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: usize,
    #[serde(default = "default_branch_timeout_ms")]
    pub branch_timeout_ms: u64,
    #[serde(default = "default_retrieval_retries")]
    pub max_retries: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            w_sql: default_weight(),
            w_vector: default_weight(),
            sql_row_score: default_sql_row_score(),
            context_budget_tokens: default_context_budget_tokens(),
            branch_timeout_ms: default_branch_timeout_ms(),
            max_retries: default_retrieval_retries(),
        }
    }
}

fn default_top_k() -> i64 {
    3
}
fn default_weight() -> f64 {
    0.5
}
fn default_sql_row_score() -> f64 {
    1.0
}
fn default_context_budget_tokens() -> usize {
    1500
}
fn default_branch_timeout_ms() -> u64 {
    5000
}
fn default_retrieval_retries() -> u32 {
    1
}

impl RetrievalConfig {
    pub fn weights(&self) -> FusionWeights {
        FusionWeights {
            w_sql: self.w_sql,
            w_vector: self.w_vector,
            sql_row_score: self.sql_row_score,
        }
    }

    pub fn branch_timeout(&self) -> Duration {
        Duration::from_millis(self.branch_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_history_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_window_turns")]
    pub window_turns: usize,
    #[serde(default)]
    pub policy: HistoryPolicy,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_tokens: default_history_tokens(),
            window_turns: default_window_turns(),
            policy: HistoryPolicy::Drop,
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

fn default_max_turns() -> usize {
    20
}
fn default_history_tokens() -> usize {
    2000
}
fn default_window_turns() -> usize {
    6
}
fn default_summary_max_chars() -> usize {
    600
}

impl HistoryConfig {
    pub fn to_core(&self) -> CoreHistoryConfig {
        CoreHistoryConfig {
            max_turns: self.max_turns,
            max_tokens: self.max_tokens,
            window_turns: self.window_turns,
            policy: self.policy,
            summary_max_chars: self.summary_max_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible or Ollama endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retries inside the HTTP provider for `hq populate`. Turns use
    /// `retrieval.max_retries` instead, see [`EmbeddingConfig::for_turns`].
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Settings for the provider used inside turns: no provider-level
    /// retries, so the engine's retry cap and branch timeout apply.
    pub fn for_turns(&self) -> Self {
        Self {
            max_retries: 0,
            ..self.clone()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `openai` (any OpenAI-compatible chat endpoint) or `ollama`.
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay before the single synthesis retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.0
}
fn default_generation_max_tokens() -> u32 {
    1024
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate database
    if config.database.max_rows < 1 {
        anyhow::bail!("database.max_rows must be >= 1");
    }
    if config.database.schema_refresh_secs == 0 {
        anyhow::bail!("database.schema_refresh_secs must be > 0");
    }

    // Validate retrieval
    let r = &config.retrieval;
    if r.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if r.w_sql < 0.0 || r.w_vector < 0.0 || (r.w_sql == 0.0 && r.w_vector == 0.0) {
        anyhow::bail!("retrieval.w_sql and retrieval.w_vector must be >= 0 and not both 0");
    }
    if !(0.0..=1.0).contains(&r.sql_row_score) {
        anyhow::bail!("retrieval.sql_row_score must be in [0.0, 1.0]");
    }
    if r.context_budget_tokens == 0 {
        anyhow::bail!("retrieval.context_budget_tokens must be > 0");
    }
    if r.branch_timeout_ms == 0 {
        anyhow::bail!("retrieval.branch_timeout_ms must be > 0");
    }

    // Validate history
    if config.history.max_turns == 0 {
        anyhow::bail!("history.max_turns must be > 0");
    }
    if config.history.max_tokens == 0 {
        anyhow::bail!("history.max_tokens must be > 0");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "hash" {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if config.generation.model.trim().is_empty() {
        anyhow::bail!("generation.model must not be empty");
    }

    Ok(config)
}
