//! Configuration parsing and validation.
//!
//! Live Context is configured with a TOML file (conventionally
//! `config/lctx.toml`). Every section is optional; a missing file or an empty
//! file yields [`Config::default()`].
//!
//! # Example
//!
//! ```toml
//! [chunking]
//! max_tokens = 400
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [retrieval]
//! default_k = 5
//! context_token_budget = 2000
//!
//! [watch]
//! root = "./my-repo"
//! debounce_ms = 300
//!
//! [webhook]
//! secret = "s3cr3t"
//! branch = "main"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use live_context_core::chunk::DEFAULT_MAX_TOKENS;
use live_context_core::embedding::DEFAULT_HASH_DIMS;
use live_context_core::index::DEFAULT_SHARDS;
use live_context_core::version::DEFAULT_RETENTION;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

/// Embedding provider settings.
///
/// `provider` is one of `hash` (deterministic, offline), `openai`, `ollama`.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL override for the `openai` and `ollama` providers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Chunks embedded concurrently per document.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            concurrency: default_concurrency(),
        }
    }
}

impl EmbeddingConfig {
    /// Model identifier, falling back to the provider's default.
    pub fn model_name(&self) -> String {
        match (&self.model, self.provider.as_str()) {
            (Some(m), _) => m.clone(),
            (None, "openai") => "text-embedding-3-small".to_string(),
            (None, "ollama") => "nomic-embed-text".to_string(),
            (None, _) => "hash-v1".to_string(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    DEFAULT_HASH_DIMS
}
fn default_max_retries() -> u32 {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    200
}
fn default_backoff_cap_ms() -> u64 {
    5_000
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default)]
    pub min_score: f32,
    /// Per-query deadline, and the ceiling for a caller-supplied one.
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            min_score: 0.0,
            timeout_ms: default_query_timeout_ms(),
            context_token_budget: default_context_token_budget(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_k() -> usize {
    5
}
fn default_query_timeout_ms() -> u64 {
    2_000
}
fn default_context_token_budget() -> usize {
    2_000
}

/// Local directory watcher settings. No local source runs without `root`.
#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Capacity of each bounded channel between pipeline stages.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// How long a watcher waits for queue capacity before dropping an event.
    #[serde(default = "default_emit_timeout_ms")]
    pub emit_timeout_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: None,
            debounce_ms: default_debounce_ms(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            queue_capacity: default_queue_capacity(),
            follow_symlinks: false,
            emit_timeout_ms: default_emit_timeout_ms(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }
}

fn default_debounce_ms() -> u64 {
    300
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}
fn default_queue_capacity() -> usize {
    256
}
fn default_emit_timeout_ms() -> u64 {
    5_000
}

/// Remote repository webhook settings.
#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// HMAC-SHA256 key checked against `X-Hub-Signature-256`.
    #[serde(default)]
    pub secret: Option<String>,
    /// Only pushes to this branch are indexed.
    #[serde(default)]
    pub branch: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secret: None,
            branch: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_version_retention")]
    pub version_retention: usize,
    /// Interval of the background integrity sweep; 0 disables it.
    #[serde(default = "default_integrity_interval_secs")]
    pub integrity_interval_secs: u64,
    /// Deleted paths remembered per engine before the oldest tombstones
    /// are dropped.
    #[serde(default = "default_max_tombstones")]
    pub max_tombstones: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            version_retention: default_version_retention(),
            integrity_interval_secs: default_integrity_interval_secs(),
            max_tombstones: default_max_tombstones(),
        }
    }
}

fn default_shards() -> usize {
    DEFAULT_SHARDS
}
fn default_version_retention() -> usize {
    DEFAULT_RETENTION
}
fn default_integrity_interval_secs() -> u64 {
    60
}
fn default_max_tombstones() -> usize {
    10_000
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

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Load `path` if it exists, otherwise fall back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be > 0");
    }
    if config.embedding.timeout_secs == 0 {
        anyhow::bail!("embedding.timeout_secs must be > 0");
    }

    if config.retrieval.default_k == 0 {
        anyhow::bail!("retrieval.default_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0]");
    }
    if config.retrieval.timeout_ms == 0 {
        anyhow::bail!("retrieval.timeout_ms must be > 0");
    }

    if config.watch.queue_capacity == 0 {
        anyhow::bail!("watch.queue_capacity must be > 0");
    }
    if config.watch.include_globs.is_empty() {
        anyhow::bail!("watch.include_globs must not be empty");
    }

    if config.index.shards == 0 {
        anyhow::bail!("index.shards must be > 0");
    }

    Ok(())
}
