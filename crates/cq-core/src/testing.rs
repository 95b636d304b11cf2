//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::Error;
use crate::message::{Message, StreamChunk, ToolCall};
use crate::tool::{Capability, PropertySchema, ToolParameters};
use crate::transport::{CompletionRequest, CompletionResponse, StreamResult, Transport};

/// A plain-text assistant response.
pub fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse::new(Message::assistant(text), "mock-model")
}

/// An assistant response requesting the given tool calls.
pub fn tool_call_response(calls: Vec<ToolCall>) -> CompletionResponse {
    CompletionResponse::new(Message::assistant_with_tool_calls("", calls), "mock-model")
}

/// Break a complete response into the chunks a streaming backend would send.
pub fn response_chunks(response: &CompletionResponse) -> Vec<StreamChunk> {
    let mut chunks = vec![StreamChunk::Start {
        model: response.model.clone(),
    }];
    if !response.message.content.is_empty() {
        chunks.push(StreamChunk::Delta {
            content: response.message.content.clone(),
        });
    }
    for (index, call) in response.message.tool_calls.iter().enumerate() {
        chunks.push(StreamChunk::ToolCallStart {
            index,
            id: call.id.clone(),
            name: call.name.clone(),
        });
        chunks.push(StreamChunk::ToolCallDelta {
            index,
            arguments: call.arguments.clone(),
        });
    }
    chunks.extend(response.citations.iter().cloned().map(StreamChunk::Citation));
    chunks.extend(
        response
            .notices
            .iter()
            .map(|text| StreamChunk::Notice { text: text.clone() }),
    );
    chunks.push(StreamChunk::Done {
        usage: Some(response.usage.clone()),
    });
    chunks
}

type Fallback = Box<dyn Fn(usize) -> CompletionResponse + Send + Sync>;

struct ScriptedStream {
    chunks: Vec<Result<StreamChunk, Error>>,
    hang: bool,
}

/// A transport that replays pre-configured responses.
///
/// Responses are returned in FIFO order. Scripted streams take priority over
/// queued responses on the streaming path; a queued response is otherwise
/// replayed as chunks, so one script drives both paths.
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<CompletionResponse, Error>>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    fallback: Mutex<Option<Fallback>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
    pub default_model: Option<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            captured_requests: Mutex::new(Vec::new()),
            name: "mock".to_string(),
            default_model: None,
        }
    }

    /// Queue a plain-text response.
    pub fn queue_response(&self, content: &str) {
        self.queue_raw_response(text_response(content));
    }

    /// Queue a raw CompletionResponse.
    pub fn queue_raw_response(&self, response: CompletionResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a transport failure.
    pub fn queue_error(&self, error: Error) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Queue an explicit chunk script for the next `stream()` call.
    pub fn queue_stream(&self, chunks: Vec<Result<StreamChunk, Error>>) {
        self.streams.lock().unwrap().push_back(ScriptedStream {
            chunks,
            hang: false,
        });
    }

    /// Queue a chunk script that never completes after its last chunk.
    pub fn queue_stream_then_hang(&self, chunks: Vec<Result<StreamChunk, Error>>) {
        self.streams.lock().unwrap().push_back(ScriptedStream { chunks, hang: true });
    }

    /// Response produced once every queue is empty; receives the request count.
    pub fn set_fallback(&self, fallback: impl Fn(usize) -> CompletionResponse + Send + Sync + 'static) {
        *self.fallback.lock().unwrap() = Some(Box::new(fallback));
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    /// Get the last captured request.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }

    /// Get a captured request by position.
    pub fn request(&self, index: usize) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().get(index).cloned()
    }

    fn capture(&self, request: CompletionRequest) -> usize {
        let mut captured = self.captured_requests.lock().unwrap();
        captured.push(request);
        captured.len()
    }

    fn next_response(&self, count: usize) -> Result<CompletionResponse, Error> {
        if let Some(response) = self.responses.lock().unwrap().pop_front() {
            return response;
        }
        match self.fallback.lock().unwrap().as_ref() {
            Some(fallback) => Ok(fallback(count)),
            None => Err(Error::invalid_request("No mock response queued")),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let count = self.capture(request);
        self.next_response(count)
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        let count = self.capture(request);
        let scripted = self.streams.lock().unwrap().pop_front();
        let scripted = match scripted {
            Some(scripted) => scripted,
            None => ScriptedStream {
                chunks: response_chunks(&self.next_response(count)?)
                    .into_iter()
                    .map(Ok)
                    .collect(),
                hang: false,
            },
        };

        let chunks = futures::stream::iter(scripted.chunks);
        if scripted.hang {
            let pending = futures::stream::pending::<Result<StreamChunk, Error>>();
            Ok(Box::pin(chunks.chain(pending)) as StreamResult)
        } else {
            Ok(Box::pin(chunks) as StreamResult)
        }
    }
}

/// What a [`MockCapability`] does when executed.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return this payload.
    Respond(String),
    /// Return `Err` with this message.
    Fail(String),
    /// Panic with this message.
    Panic(String),
    /// Sleep, then return the payload.
    Delay(Duration, String),
}

/// A capability with scripted behavior that records its arguments.
pub struct MockCapability {
    name: String,
    behavior: Behavior,
    /// Arguments of every execution, in call order.
    pub calls: Mutex<Vec<String>>,
}

impl MockCapability {
    pub fn new(name: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn responding(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(name, Behavior::Respond(payload.into()))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Capability for MockCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test capability"
    }

    fn parameters(&self) -> ToolParameters {
        ToolParameters::new().add_property("query", PropertySchema::string("Input"), false)
    }

    async fn execute(&self, arguments: &str) -> Result<String, Error> {
        self.calls.lock().unwrap().push(arguments.to_string());
        match &self.behavior {
            Behavior::Respond(payload) => Ok(payload.clone()),
            Behavior::Fail(message) => Err(Error::capability(&self.name, message.clone())),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::Delay(duration, payload) => {
                tokio::time::sleep(*duration).await;
                Ok(payload.clone())
            }
        }
    }
}
