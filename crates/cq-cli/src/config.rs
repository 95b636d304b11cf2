use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use cq_core::{ConversationConfig, DEFAULT_MAX_TOOL_ROUNDS};
use cq_providers::{RateLimiter, RetryPolicy, TransportContext};
use cq_tools::PollPolicy;

/// Environment prefix for overrides, e.g. `CQ_BACKEND__DEFAULT_MODEL`.
pub const ENV_PREFIX: &str = "CQ_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub conversation: ConversationSection,

    #[serde(default)]
    pub tools: ToolsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default)]
    pub default_model: Option<String>,

    /// Extra parameters passed through on every request (e.g. search_parameters).
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Minimum spacing between requests, in milliseconds.
    #[serde(default)]
    pub min_request_interval_ms: u64,
}

fn default_base_url() -> String {
    "https://api.x.ai/v1".to_string()
}

fn default_api_key_env() -> String {
    "XAI_API_KEY".to_string()
}

fn default_max_retries() -> u32 {
    RetryPolicy::default().max_retries
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_model: None,
            parameters: HashMap::new(),
            max_retries: default_max_retries(),
            min_request_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSection {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Per-capability timeout in seconds. Zero disables it.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// System instruction added before the first question.
    #[serde(default)]
    pub system: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_max_tool_rounds() -> usize {
    DEFAULT_MAX_TOOL_ROUNDS
}

fn default_tool_timeout_secs() -> u64 {
    cq_core::DEFAULT_TOOL_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            streaming: true,
            tool_timeout_secs: default_tool_timeout_secs(),
            system: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_true")]
    pub enable_calculate: bool,

    #[serde(default = "default_true")]
    pub enable_web: bool,

    /// Video generation talks to the backend's video endpoints.
    #[serde(default)]
    pub enable_video: bool,

    #[serde(default = "default_video_poll_interval_ms")]
    pub video_poll_interval_ms: u64,

    #[serde(default = "default_video_timeout_secs")]
    pub video_timeout_secs: u64,
}

fn default_video_poll_interval_ms() -> u64 {
    PollPolicy::default().interval.as_millis() as u64
}

fn default_video_timeout_secs() -> u64 {
    PollPolicy::default().timeout.as_secs()
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            enable_calculate: true,
            enable_web: true,
            enable_video: false,
            video_poll_interval_ms: default_video_poll_interval_ms(),
            video_timeout_secs: default_video_timeout_secs(),
        }
    }
}

impl Config {
    /// Load from the default config file (if present) and the environment.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let path = path.exists().then_some(path);
        Self::load_from(path.as_deref())
    }

    /// Load from `path` and the environment. A missing file is an error.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        Self::load_from(Some(path))
    }

    fn load_from(path: Option<&Path>) -> Result<Self> {
        Self::figment(path)
            .extract()
            .context("Failed to load configuration")
    }

    /// Defaults, then the TOML file, then `CQ_`-prefixed variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("cq"))
    }

    pub fn conversation_config(&self) -> ConversationConfig {
        let section = &self.conversation;
        let tool_timeout = (section.tool_timeout_secs > 0).then(|| Duration::from_secs(section.tool_timeout_secs));

        let mut config = ConversationConfig::new()
            .with_max_tool_rounds(section.max_tool_rounds)
            .with_streaming(section.streaming)
            .with_tool_timeout(tool_timeout)
            .with_extra(self.backend.parameters.clone());
        if let Some(model) = &self.backend.default_model {
            config = config.with_default_model(model.as_str());
        }
        if let Some(temperature) = section.temperature {
            config = config.with_temperature(temperature);
        }
        if let Some(max_tokens) = section.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        config
    }

    pub fn transport_context(&self) -> TransportContext {
        let retry = RetryPolicy {
            max_retries: self.backend.max_retries,
            ..RetryPolicy::default()
        };
        let limiter = RateLimiter::new(Duration::from_millis(self.backend.min_request_interval_ms));
        TransportContext::new(retry, limiter)
    }

    /// Video polling, clamped so it finishes before the tool timeout cuts it off.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.tools.video_poll_interval_ms),
            timeout: Duration::from_secs(self.tools.video_timeout_secs),
        }
        .within(self.conversation_config().tool_timeout)
    }
}
