//! Events emitted to the caller while a question is being answered.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::Citation;

/// Phase of the orchestrator for the question in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Thinking,
    Streaming,
    CallingTool,
    Done,
    Error,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Thinking => write!(f, "thinking"),
            StreamState::Streaming => write!(f, "streaming"),
            StreamState::CallingTool => write!(f, "calling_tool"),
            StreamState::Done => write!(f, "done"),
            StreamState::Error => write!(f, "error"),
        }
    }
}

/// Why a question ended in [`StreamState::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureKind {
    /// The transport failed: non-success status, network error, malformed response.
    Transport { status: Option<u16> },
    /// The backend rate-limited the request and the transport gave up retrying.
    RateLimited,
    /// The model kept requesting tools past the configured number of rounds.
    RoundLimitExceeded { max_rounds: usize },
    /// The caller cancelled the question.
    Cancelled,
}

impl FailureKind {
    /// Transient failures may succeed if the same question is asked again.
    pub fn is_transient(&self) -> bool {
        match self {
            FailureKind::RateLimited => true,
            FailureKind::Transport { status } => matches!(status, None | Some(408) | Some(500..)),
            _ => false,
        }
    }
}

impl From<&Error> for FailureKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::RateLimit(_) => FailureKind::RateLimited,
            Error::Cancelled => FailureKind::Cancelled,
            other => FailureKind::Transport {
                status: other.status(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    StateChange(StreamState),
    TextDelta(String),
    ToolResult {
        tool_name: String,
        tool_call_id: String,
        result: String,
        is_error: bool,
    },
    Citation(Citation),
    ServiceNotice(String),
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl Event {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Event::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Event::TextDelta(text) => Some(text),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<StreamState> {
        match self {
            Event::StateChange(state) => Some(*state),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_from_error() {
        assert_eq!(FailureKind::from(&Error::rate_limit("slow")), FailureKind::RateLimited);
        assert_eq!(FailureKind::from(&Error::Cancelled), FailureKind::Cancelled);
        assert_eq!(
            FailureKind::from(&Error::api(503, "down")),
            FailureKind::Transport { status: Some(503) }
        );
        assert_eq!(
            FailureKind::from(&Error::network("reset")),
            FailureKind::Transport { status: None }
        );
    }

    #[test]
    fn test_transient() {
        assert!(FailureKind::RateLimited.is_transient());
        assert!(FailureKind::Transport { status: Some(502) }.is_transient());
        assert!(!FailureKind::Transport { status: Some(400) }.is_transient());
        assert!(!FailureKind::Cancelled.is_transient());
        assert!(!FailureKind::RoundLimitExceeded { max_rounds: 3 }.is_transient());
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(Event::StateChange(StreamState::CallingTool)).unwrap();
        assert_eq!(json, serde_json::json!({"event": "state_change", "data": "calling_tool"}));

        let json = serde_json::to_value(Event::TextDelta("hi".into())).unwrap();
        assert_eq!(json, serde_json::json!({"event": "text_delta", "data": "hi"}));
        assert_eq!(StreamState::CallingTool.to_string(), "calling_tool");
    }
}
