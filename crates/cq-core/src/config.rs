use std::collections::HashMap;
use std::time::Duration;

/// Default cap on tool-calling rounds per question.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 10;

/// Default bound on a single capability execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Settings applied to every question asked on a [`crate::Conversation`].
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Maximum tool-calling rounds per question before failing.
    pub max_tool_rounds: usize,
    /// Use the streaming transport path.
    pub streaming: bool,
    /// Model used when a question does not name one.
    pub default_model: Option<String>,
    /// Upper bound on each capability execution. `None` disables the bound.
    pub tool_timeout: Option<Duration>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Extra request parameters passed through to the backend.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            streaming: true,
            default_model: None,
            tool_timeout: Some(DEFAULT_TOOL_TIMEOUT),
            temperature: None,
            max_tokens: None,
            extra: HashMap::new(),
        }
    }
}

impl ConversationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tool_rounds(mut self, max: usize) -> Self {
        self.max_tool_rounds = max;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_extra(mut self, extra: HashMap<String, serde_json::Value>) -> Self {
        self.extra = extra;
        self
    }
}
