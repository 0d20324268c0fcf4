//! Layered configuration: defaults, optional TOML file, `RESEARCH__*` environment

use crate::error::{ResearchError, Result};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub research: ResearchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from `RESEARCH_CONFIG` (or `config.toml`) plus environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var("RESEARCH_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        Self::from_file(&path)
    }

    /// Load from a TOML file (missing file falls back to defaults) plus environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(Self::environment())
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("RESEARCH")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Reject budgets and caps that would make the pipeline unusable
    pub fn validate(&self) -> Result<()> {
        if self.context.max_tokens == 0 {
            return Err(ResearchError::Configuration(
                "context.max_tokens must be greater than zero".to_string(),
            ));
        }
        if self.research.max_parallel_steps == 0 {
            return Err(ResearchError::Configuration(
                "research.max_parallel_steps must be greater than zero".to_string(),
            ));
        }
        if self.research.agent_max_iterations == 0 {
            return Err(ResearchError::Configuration(
                "research.agent_max_iterations must be greater than zero".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ResearchError::Configuration("llm.model must not be empty".to_string()));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Chat model configuration (OpenAI-compatible endpoint)
#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    /// Base URL, `/chat/completions` is appended
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Inline API key; takes precedence over `api_key_env`
    #[serde(default)]
    pub api_key: Option<Secret<String>>,

    /// Environment variable holding the API key
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_llm_retries")]
    pub max_retries: usize,

    #[serde(default = "default_llm_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Consecutive failures before the breaker opens
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: usize,

    #[serde(default = "default_breaker_reset")]
    pub breaker_reset_secs: u64,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_llm_retries() -> usize {
    2
}

fn default_llm_backoff() -> u64 {
    500
}

fn default_temperature() -> f32 {
    0.2
}

fn default_breaker_failures() -> usize {
    5
}

fn default_breaker_reset() -> u64 {
    30
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: None,
            api_key_env: default_llm_api_key_env(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            retry_backoff_ms: default_llm_backoff(),
            temperature: default_temperature(),
            breaker_failures: default_breaker_failures(),
            breaker_reset_secs: default_breaker_reset(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn breaker_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker_reset_secs)
    }

    /// Resolve the API key from config or the configured environment variable
    pub fn resolve_api_key(&self) -> Option<Secret<String>> {
        resolve_secret(self.api_key.as_ref(), &self.api_key_env)
    }
}

/// Web search configuration (Tavily)
#[derive(Debug, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<Secret<String>>,

    #[serde(default = "default_search_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_search_max_results")]
    pub max_results: usize,

    /// `basic` or `advanced`
    #[serde(default = "default_search_depth")]
    pub search_depth: String,

    #[serde(default = "default_true")]
    pub include_images: bool,

    /// Pages scoring below this are dropped
    #[serde(default)]
    pub min_score_threshold: Option<f64>,

    /// Page content is cut to this many characters
    #[serde(default = "default_max_content_length")]
    pub max_content_length_per_page: usize,

    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

fn default_search_base_url() -> String {
    "https://api.tavily.com".to_string()
}

fn default_search_api_key_env() -> String {
    "TAVILY_API_KEY".to_string()
}

fn default_search_max_results() -> usize {
    5
}

fn default_search_depth() -> String {
    "advanced".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_content_length() -> usize {
    4000
}

fn default_search_timeout() -> u64 {
    30
}

fn default_cache_ttl() -> u64 {
    600
}

fn default_cache_capacity() -> u64 {
    1000
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_search_base_url(),
            api_key: None,
            api_key_env: default_search_api_key_env(),
            max_results: default_search_max_results(),
            search_depth: default_search_depth(),
            include_images: default_true(),
            min_score_threshold: None,
            max_content_length_per_page: default_max_content_length(),
            timeout_secs: default_search_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn resolve_api_key(&self) -> Option<Secret<String>> {
        resolve_secret(self.api_key.as_ref(), &self.api_key_env)
    }
}

/// Context budget configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Budget in estimated tokens before compression kicks in
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Leading messages kept verbatim while they fit
    #[serde(default = "default_prestore_count")]
    pub prestore_count: usize,

    #[serde(default = "default_summarize_timeout")]
    pub summarize_timeout_secs: u64,
}

fn default_max_tokens() -> usize {
    32768
}

fn default_prestore_count() -> usize {
    2
}

fn default_summarize_timeout() -> u64 {
    60
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            prestore_count: default_prestore_count(),
            summarize_timeout_secs: default_summarize_timeout(),
        }
    }
}

impl ContextConfig {
    pub fn summarize_timeout(&self) -> Duration {
        Duration::from_secs(self.summarize_timeout_secs)
    }
}

/// Research pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchConfig {
    /// Plan steps researched per session
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Upper bound on steps the planner is asked to produce
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,

    /// Model turns a research agent may spend calling tools
    #[serde(default = "default_agent_iterations")]
    pub agent_max_iterations: usize,

    /// Timeout for any single model or search call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Timeout for one research step end to end
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_locale")]
    pub default_locale: String,
}

fn default_max_parallel_steps() -> usize {
    2
}

fn default_max_plan_steps() -> usize {
    3
}

fn default_agent_iterations() -> usize {
    5
}

fn default_call_timeout() -> u64 {
    120
}

fn default_step_timeout() -> u64 {
    600
}

fn default_locale() -> String {
    "zh-CN".to_string()
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            max_plan_steps: default_max_plan_steps(),
            agent_max_iterations: default_agent_iterations(),
            call_timeout_secs: default_call_timeout(),
            step_timeout_secs: default_step_timeout(),
            default_locale: default_locale(),
        }
    }
}

impl ResearchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn resolve_secret(inline: Option<&Secret<String>>, env_var: &str) -> Option<Secret<String>> {
    if let Some(secret) = inline {
        if !secret.expose_secret().is_empty() {
            return Some(Secret::new(secret.expose_secret().clone()));
        }
    }

    std::env::var(env_var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(Secret::new)
}
