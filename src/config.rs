//! TOML configuration for the bot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub secret: SecretConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub fix: FixConfig,
    #[serde(default)]
    pub related: RelatedConfig,
    #[serde(default)]
    pub bot: BotConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecretConfig {
    /// Path to a netrc-format secrets file. Defaults to `$NETRC` or
    /// `$HOME/.netrc`.
    #[serde(default)]
    pub netrc: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GithubConfig {
    /// Projects to mirror and act on, as `"owner/repo"`.
    #[serde(default)]
    pub projects: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"`, `"quote"` (deterministic, offline, for trials), or
    /// `"disabled"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Expected vector dimensionality; when set, responses with any
    /// other length are rejected.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Documents per embeddings API call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Retries per API call on rate limits and server errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    100
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
}

/// One auto-link rule: text matching `pattern` becomes a link to `url`
/// (with `$1`-style substitutions).
#[derive(Debug, Deserialize, Clone)]
pub struct AutoLinkRule {
    pub pattern: String,
    pub url: String,
}

/// One replacement rule, for text or URLs depending on the list it
/// appears in.
#[derive(Debug, Deserialize, Clone)]
pub struct ReplaceRule {
    pub pattern: String,
    pub with: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixConfig {
    /// Watcher name for the rewriter; change it when the rule set
    /// changes meaning.
    #[serde(default = "default_fix_name")]
    pub name: String,
    /// Apply edits to the tracker. Off by default: dry runs print
    /// diffs only.
    #[serde(default)]
    pub edit: bool,
    #[serde(default)]
    pub autolinks: Vec<AutoLinkRule>,
    #[serde(default)]
    pub replacements: Vec<ReplaceRule>,
    #[serde(default)]
    pub url_replacements: Vec<ReplaceRule>,
}

impl Default for FixConfig {
    fn default() -> Self {
        FixConfig {
            name: default_fix_name(),
            edit: false,
            autolinks: Vec::new(),
            replacements: Vec::new(),
            url_replacements: Vec::new(),
        }
    }
}

fn default_fix_name() -> String {
    "fix".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelatedConfig {
    /// Watcher name for the poster.
    #[serde(default = "default_related_name")]
    pub name: String,
    /// Post comments to the tracker. Off by default: dry runs log the
    /// comments only.
    #[serde(default)]
    pub post: bool,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default)]
    pub skip_body_contains: Vec<String>,
    #[serde(default)]
    pub skip_title_prefixes: Vec<String>,
    #[serde(default)]
    pub skip_title_suffixes: Vec<String>,
}

impl Default for RelatedConfig {
    fn default() -> Self {
        RelatedConfig {
            name: default_related_name(),
            post: false,
            max_results: default_max_results(),
            min_score: default_min_score(),
            skip_body_contains: Vec::new(),
            skip_title_prefixes: Vec::new(),
            skip_title_suffixes: Vec::new(),
        }
    }
}

fn default_related_name() -> String {
    "related".to_string()
}
fn default_max_results() -> usize {
    10
}
fn default_min_score() -> f64 {
    0.82
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    /// Seconds between driver-loop rounds.
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        BotConfig {
            poll_seconds: default_poll_seconds(),
        }
    }
}

fn default_poll_seconds() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content).context("failed to parse config file")?;

    match config.embedding.provider.as_str() {
        "disabled" | "quote" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be set when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "unknown embedding provider: '{other}'. Must be disabled, quote, or openai."
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    if config.embedding.timeout_secs == 0 {
        anyhow::bail!("embedding.timeout_secs must be >= 1");
    }

    if config.bot.poll_seconds == 0 {
        anyhow::bail!("bot.poll_seconds must be > 0");
    }
    if !(0.0..=1.0).contains(&config.related.min_score) {
        anyhow::bail!("related.min_score must be in [0.0, 1.0]");
    }
    if config.related.max_results == 0 {
        anyhow::bail!("related.max_results must be >= 1");
    }

    Ok(config)
}
