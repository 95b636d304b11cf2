//! cq-core: Core types and the conversation orchestrator for colloquy
//!
//! This crate owns the message model, the capability registry, the transport
//! abstraction and the [`Conversation`] loop that ties them together. Concrete
//! transports live in `cq-providers` and reference capabilities in `cq-tools`.

pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod message;
pub mod round;
pub mod tool;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ConversationConfig, DEFAULT_MAX_TOOL_ROUNDS, DEFAULT_TOOL_TIMEOUT};
pub use conversation::{Conversation, EventStream, Question};
pub use dispatch::{execute_tool_calls, ToolExecution};
pub use error::Error;
pub use event::{Event, FailureKind, StreamState};
pub use message::{Citation, Message, Role, StreamChunk, ToolCall, Usage};
pub use tool::{
    error_payload, parse_arguments, Capability, CapabilityRegistry, PropertySchema,
    ToolDefinition, ToolParameters,
};
pub use transport::{CompletionRequest, CompletionResponse, FinishReason, StreamResult, Transport};

pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;
