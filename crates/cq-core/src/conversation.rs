//! The conversation orchestrator.
//!
//! A [`Conversation`] owns the history and drives one question at a time
//! through the request / tool-call loop:
//!
//! ```text
//! question → Thinking → transport ─┬─ text ──────→ Streaming → Done
//!                        ▲         └─ tool calls → CallingTool ─┐
//!                        └──────────── tool turns appended ◄────┘
//! ```
//!
//! Events are produced lazily: nothing happens until the returned stream is
//! polled, and the only suspension points are the transport call and the
//! capability barrier of a tool round.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConversationConfig;
use crate::dispatch::execute_tool_calls;
use crate::error::Error;
use crate::event::{Event, FailureKind, StreamState};
use crate::message::{Message, Role, Usage};
use crate::round::{Round, RoundBuilder};
use crate::tool::{Capability, CapabilityRegistry};
use crate::transport::{CompletionRequest, Transport};

/// Lazy sequence of events for one question.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Event> + Send + 'a>>;

/// A question to ask on a [`Conversation`].
#[derive(Debug, Clone)]
pub struct Question {
    text: String,
    model: Option<String>,
    cancellation: CancellationToken,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Use a specific backend model for this question only.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Tie the question to an external cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this question when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// A multi-turn conversation with a tool-calling backend.
///
/// `ask` borrows the conversation mutably for as long as its event stream is
/// alive, so only one question can be in flight at a time.
pub struct Conversation {
    transport: Arc<dyn Transport>,
    capabilities: CapabilityRegistry,
    config: ConversationConfig,
    history: Vec<Message>,
    usage: Usage,
}

impl Conversation {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            capabilities: CapabilityRegistry::new(),
            config: ConversationConfig::default(),
            history: Vec::new(),
            usage: Usage::default(),
        }
    }

    pub fn with_config(mut self, config: ConversationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityRegistry) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn register_capability(&mut self, capability: Arc<dyn Capability>) -> Result<(), Error> {
        self.capabilities.register(capability)
    }

    /// Add the system instruction. Only allowed once, before the first question.
    pub fn add_system_instruction(&mut self, text: impl Into<String>) -> Result<(), Error> {
        if !self.history.is_empty() {
            return Err(Error::invalid_request(
                "system instruction must be added once, before the first question",
            ));
        }
        self.history.push(Message::system(text));
        Ok(())
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Token usage accumulated over every round of every question.
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Forget every turn except the system instruction.
    pub fn clear_history(&mut self) {
        self.history.retain(|m| m.role == Role::System);
    }

    /// Ask a question, optionally on a specific model.
    pub fn ask_question(&mut self, text: impl Into<String>, model: Option<&str>) -> EventStream<'_> {
        let mut question = Question::new(text);
        if let Some(model) = model {
            question = question.with_model(model);
        }
        self.ask(question)
    }

    /// Ask a question and receive its events.
    ///
    /// The stream always terminates with `StateChange(Done)` or with
    /// `StateChange(Error)` followed by a `Failure`. History only ever gains
    /// complete turns; a failed or cancelled question keeps its user turn and
    /// any tool rounds that finished.
    pub fn ask(&mut self, question: Question) -> EventStream<'_> {
        let Question {
            text,
            model,
            cancellation,
        } = question;

        Box::pin(async_stream::stream! {
            let model = model.or_else(|| self.config.default_model.clone());
            let max_rounds = self.config.max_tool_rounds;

            self.history.push(Message::user(text));
            yield Event::StateChange(StreamState::Thinking);

            let mut tool_rounds = 0usize;
            let mut round_number = 1usize;

            loop {
                let request = self.build_request(model.as_deref());
                debug!(
                    round = round_number,
                    messages = request.messages.len(),
                    tools = request.tools.len(),
                    streaming = request.stream,
                    model = ?request.model,
                    "Sending round"
                );

                let round = if self.config.streaming {
                    let opened = tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => Err(Error::Cancelled),
                        opened = self.transport.stream(request) => opened,
                    };
                    let mut chunks = match opened {
                        Ok(chunks) => chunks,
                        Err(err) => {
                            for event in failure_events(&err) {
                                yield event;
                            }
                            return;
                        }
                    };

                    let mut builder = RoundBuilder::new(round_number);
                    let mut announced = false;
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancellation.cancelled() => Some(Err(Error::Cancelled)),
                            next = chunks.next() => next,
                        };
                        let applied = match next {
                            None => break,
                            Some(Ok(chunk)) => builder.apply(chunk),
                            Some(Err(err)) => Err(err),
                        };
                        match applied {
                            Ok(Some(delta)) => {
                                if !announced {
                                    announced = true;
                                    yield Event::StateChange(StreamState::Streaming);
                                }
                                yield Event::TextDelta(delta);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                for event in failure_events(&err) {
                                    yield event;
                                }
                                return;
                            }
                        }
                    }
                    builder.finish()
                } else {
                    let response = tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => Err(Error::Cancelled),
                        response = self.transport.complete(request) => response,
                    };
                    match response {
                        Ok(response) => {
                            let round = Round::from_response(response, round_number);
                            if !round.text.is_empty() {
                                yield Event::StateChange(StreamState::Streaming);
                                yield Event::TextDelta(round.text.clone());
                            }
                            round
                        }
                        Err(err) => {
                            for event in failure_events(&err) {
                                yield event;
                            }
                            return;
                        }
                    }
                };

                let Round {
                    text,
                    tool_calls,
                    citations,
                    notices,
                    usage,
                } = round;

                if let Some(usage) = &usage {
                    self.usage.accumulate(usage);
                }
                for citation in citations {
                    yield Event::Citation(citation);
                }
                for notice in notices {
                    yield Event::ServiceNotice(notice);
                }

                if tool_calls.is_empty() {
                    debug!(round = round_number, text_len = text.len(), "Question answered");
                    self.history.push(Message::assistant(text));
                    yield Event::StateChange(StreamState::Done);
                    return;
                }

                if tool_rounds >= max_rounds {
                    warn!(max_rounds, requested = tool_calls.len(), "Tool-call limit exceeded");
                    yield Event::StateChange(StreamState::Error);
                    yield Event::failure(
                        FailureKind::RoundLimitExceeded { max_rounds },
                        format!("tool-call limit exceeded ({} rounds)", max_rounds),
                    );
                    return;
                }
                tool_rounds += 1;

                yield Event::StateChange(StreamState::CallingTool);
                let executed = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => None,
                    results = execute_tool_calls(&self.capabilities, &tool_calls, self.config.tool_timeout) => Some(results),
                };
                let Some(results) = executed else {
                    for event in failure_events(&Error::Cancelled) {
                        yield event;
                    }
                    return;
                };

                // The assistant turn and its tool turns land together so the
                // history never holds calls without results.
                self.history.push(Message::assistant_with_tool_calls(text, tool_calls));
                for result in &results {
                    self.history.push(Message::tool_result(&result.tool_call_id, &result.content));
                }
                for result in results {
                    yield Event::ToolResult {
                        tool_name: result.tool_name,
                        tool_call_id: result.tool_call_id,
                        result: result.content,
                        is_error: result.is_error,
                    };
                }

                round_number += 1;
                yield Event::StateChange(StreamState::Thinking);
            }
        })
    }

    fn build_request(&self, model: Option<&str>) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.history.clone())
            .with_tools(self.capabilities.advertise())
            .with_stream(self.config.streaming)
            .with_extra(self.config.extra.clone());

        if let Some(model) = model {
            request = request.with_model(model);
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

fn failure_events(err: &Error) -> [Event; 2] {
    let kind = FailureKind::from(err);
    match &kind {
        FailureKind::Cancelled => debug!("Question cancelled"),
        _ => warn!(error = %err, "Question failed"),
    }
    [
        Event::StateChange(StreamState::Error),
        Event::failure(kind, err.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::message::{Citation, StreamChunk, ToolCall};
    use crate::testing::{tool_call_response, Behavior, MockCapability, MockTransport};
    use crate::transport::CompletionResponse;

    fn conversation(transport: &Arc<MockTransport>, streaming: bool) -> Conversation {
        Conversation::new(transport.clone())
            .with_config(ConversationConfig::new().with_streaming(streaming))
    }

    async fn collect(stream: EventStream<'_>) -> Vec<Event> {
        stream.collect().await
    }

    fn text_of(events: &[Event]) -> String {
        events.iter().filter_map(|e| e.text()).collect()
    }

    fn states(events: &[Event]) -> Vec<StreamState> {
        events.iter().filter_map(|e| e.state()).collect()
    }

    fn tool_results(events: &[Event]) -> Vec<(String, String, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::ToolResult {
                    tool_name,
                    result,
                    is_error,
                    ..
                } => Some((tool_name.clone(), result.clone(), *is_error)),
                _ => None,
            })
            .collect()
    }

    fn failure_kind(events: &[Event]) -> Option<FailureKind> {
        events.iter().find_map(|e| match e {
            Event::Failure { kind, .. } => Some(kind.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_streamed_text_concatenates() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_stream(vec![
            Ok(StreamChunk::Start { model: "m".into() }),
            Ok(StreamChunk::Delta { content: "The answer ".into() }),
            Ok(StreamChunk::Delta { content: "is ".into() }),
            Ok(StreamChunk::Delta { content: "4.".into() }),
            Ok(StreamChunk::Done { usage: None }),
        ]);
        let mut conv = conversation(&transport, true);

        let events = collect(conv.ask_question("What is 2+2?", None)).await;

        assert_eq!(text_of(&events), "The answer is 4.");
        assert_eq!(
            states(&events),
            vec![StreamState::Thinking, StreamState::Streaming, StreamState::Done]
        );
        assert_eq!(events.last(), Some(&Event::StateChange(StreamState::Done)));
        assert_eq!(conv.history().len(), 2);
        assert_eq!(conv.history()[1], Message::assistant("The answer is 4."));
    }

    #[tokio::test]
    async fn test_single_shot_text() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_response("Four.");
        let mut conv = conversation(&transport, false);

        let events = collect(conv.ask_question("What is 2+2?", None)).await;

        assert_eq!(
            events,
            vec![
                Event::StateChange(StreamState::Thinking),
                Event::StateChange(StreamState::Streaming),
                Event::TextDelta("Four.".into()),
                Event::StateChange(StreamState::Done),
            ]
        );
        assert!(!transport.last_request().unwrap().stream);
    }

    #[tokio::test]
    async fn test_tool_round_appends_turns_before_next_request() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_raw_response(tool_call_response(vec![
            ToolCall::new("call_a", "calculate", r#"{"query":"2+2"}"#),
            ToolCall::new("call_b", "search", r#"{"query":"two"}"#),
        ]));
        transport.queue_response("2+2 is 4.");

        let calculate = Arc::new(MockCapability::responding("calculate", r#"{"status":"completed","result":4}"#));
        let search = Arc::new(MockCapability::responding("search", r#"{"status":"completed","hits":[]}"#));
        let mut conv = conversation(&transport, true);
        conv.register_capability(calculate.clone()).unwrap();
        conv.register_capability(search.clone()).unwrap();

        let events = collect(conv.ask_question("What is 2+2?", None)).await;

        assert_eq!(
            states(&events),
            vec![
                StreamState::Thinking,
                StreamState::CallingTool,
                StreamState::Thinking,
                StreamState::Streaming,
                StreamState::Done,
            ]
        );
        assert_eq!(tool_results(&events).len(), 2);
        assert_eq!(calculate.calls.lock().unwrap().as_slice(), &[r#"{"query":"2+2"}"#.to_string()]);
        assert_eq!(search.call_count(), 1);

        let second = transport.request(1).unwrap();
        let roles: Vec<Role> = second.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Tool]);
        assert_eq!(second.messages[1].tool_calls.len(), 2);
        assert_eq!(second.messages[2].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(second.messages[3].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(second.tools.len(), 2);

        // Every tool turn follows an assistant turn carrying its id.
        for (i, turn) in conv.history().iter().enumerate() {
            if turn.role == Role::Tool {
                let id = turn.tool_call_id.as_deref().unwrap();
                assert!(conv.history()[..i]
                    .iter()
                    .any(|m| m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == id)));
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_contained() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_raw_response(tool_call_response(vec![ToolCall::new("c1", "teleport", "{}")]));
        transport.queue_response("I can't do that.");
        let mut conv = conversation(&transport, false);

        let events = collect(conv.ask_question("Beam me up", None)).await;

        let results = tool_results(&events);
        assert_eq!(results.len(), 1);
        let (name, payload, is_error) = &results[0];
        assert_eq!(name, "teleport");
        assert!(is_error);
        let payload: Value = serde_json::from_str(payload).unwrap();
        assert!(!payload["error"].as_str().unwrap().is_empty());
        assert_eq!(events.last(), Some(&Event::StateChange(StreamState::Done)));
    }

    #[tokio::test]
    async fn test_capability_failures_do_not_abort_the_question() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_raw_response(tool_call_response(vec![
            ToolCall::new("c1", "fails", "{}"),
            ToolCall::new("c2", "panics", "{}"),
        ]));
        transport.queue_response("Both tools broke.");
        let mut conv = conversation(&transport, true);
        conv.register_capability(Arc::new(MockCapability::new("fails", Behavior::Fail("bad input".into()))))
            .unwrap();
        conv.register_capability(Arc::new(MockCapability::new("panics", Behavior::Panic("oops".into()))))
            .unwrap();

        let events = collect(conv.ask_question("Try both", None)).await;

        let results = tool_results(&events);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, _, is_error)| *is_error));
        assert_eq!(text_of(&events), "Both tools broke.");
        assert_eq!(conv.history().len(), 5);
    }

    #[tokio::test]
    async fn test_round_limit_terminates() {
        let transport = Arc::new(MockTransport::new());
        transport.set_fallback(|n| {
            tool_call_response(vec![ToolCall::new(format!("call_{}", n), "calculate", r#"{"query":"1+1"}"#)])
        });
        let calculate = Arc::new(MockCapability::responding("calculate", r#"{"status":"completed","result":2}"#));
        let mut conv = Conversation::new(transport.clone())
            .with_config(ConversationConfig::new().with_max_tool_rounds(3));
        conv.register_capability(calculate.clone()).unwrap();

        let events = collect(conv.ask_question("Loop forever", None)).await;

        assert_eq!(calculate.call_count(), 3);
        assert_eq!(tool_results(&events).len(), 3);
        assert_eq!(transport.request_count(), 4);
        assert_eq!(
            failure_kind(&events),
            Some(FailureKind::RoundLimitExceeded { max_rounds: 3 })
        );
        assert!(matches!(events.last(), Some(Event::Failure { .. })));
        // user + three complete (assistant, tool) pairs; the refused round leaves nothing.
        assert_eq!(conv.history().len(), 7);
        assert_eq!(conv.history().last().unwrap().role, Role::Tool);
    }

    #[tokio::test]
    async fn test_conversation_continuity() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_response("4");
        transport.queue_response("40");
        let mut conv = conversation(&transport, true);
        conv.add_system_instruction("Be terse.").unwrap();

        let first = collect(conv.ask_question("What is 2+2?", None)).await;
        assert_eq!(text_of(&first), "4");
        let second = collect(conv.ask_question("And that times 10?", None)).await;
        assert_eq!(text_of(&second), "40");

        let request = transport.request(1).unwrap();
        let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Be terse.", "What is 2+2?", "4", "And that times 10?"]
        );
        assert_eq!(conv.history().len(), 5);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_conversation_usable() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_error(Error::api(500, r#"{"error":"internal"}"#));
        transport.queue_response("Recovered.");
        let mut conv = conversation(&transport, true);

        let events = collect(conv.ask_question("First", None)).await;
        assert_eq!(
            states(&events),
            vec![StreamState::Thinking, StreamState::Error]
        );
        assert_eq!(
            failure_kind(&events),
            Some(FailureKind::Transport { status: Some(500) })
        );
        assert_eq!(conv.history().len(), 1);

        let events = collect(conv.ask_question("Second", None)).await;
        assert_eq!(text_of(&events), "Recovered.");
        assert_eq!(conv.history().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_error(Error::rate_limit("slow down"));
        let mut conv = conversation(&transport, false);

        let events = collect(conv.ask_question("Hi", None)).await;
        let kind = failure_kind(&events).unwrap();
        assert_eq!(kind, FailureKind::RateLimited);
        assert!(kind.is_transient());
    }

    #[tokio::test]
    async fn test_mid_stream_error_commits_nothing() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_stream(vec![
            Ok(StreamChunk::Delta { content: "partial".into() }),
            Err(Error::stream("connection reset")),
        ]);
        let mut conv = conversation(&transport, true);

        let events = collect(conv.ask_question("Hi", None)).await;

        assert_eq!(text_of(&events), "partial");
        assert_eq!(states(&events).last(), Some(&StreamState::Error));
        assert_eq!(conv.history().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_stream_then_hang(vec![
            Ok(StreamChunk::Delta { content: "Once upon".into() }),
        ]);
        let mut conv = conversation(&transport, true);
        let question = Question::new("Tell me a story");
        let token = question.cancellation_token();

        {
            let mut events = conv.ask(question);
            while let Some(event) = events.next().await {
                if event.text().is_some() {
                    break;
                }
            }
            token.cancel();

            let rest: Vec<Event> = events.collect().await;
            assert_eq!(
                rest,
                vec![
                    Event::StateChange(StreamState::Error),
                    Event::failure(FailureKind::Cancelled, "Cancelled"),
                ]
            );
        }

        assert_eq!(conv.history().len(), 1);
        assert_eq!(conv.history()[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_cancellation_during_tool_round() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_raw_response(tool_call_response(vec![ToolCall::new("c1", "slow", "{}")]));
        let slow = Arc::new(MockCapability::new(
            "slow",
            Behavior::Delay(Duration::from_secs(30), "{}".into()),
        ));
        let mut conv = conversation(&transport, false);
        conv.register_capability(slow.clone()).unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let events = collect(conv.ask(Question::new("Go").with_cancellation(token))).await;

        assert_eq!(failure_kind(&events), Some(FailureKind::Cancelled));
        assert!(tool_results(&events).is_empty());
        assert_eq!(slow.call_count(), 1);
        // No assistant turn without its tool results.
        assert_eq!(conv.history().len(), 1);
    }

    #[tokio::test]
    async fn test_citations_and_notices_precede_done() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_raw_response(
            CompletionResponse::new(Message::assistant("Rust 1.0 shipped in 2015."), "m")
                .with_citations(vec![Citation::new("https://blog.rust-lang.org").with_title("Rust Blog")])
                .with_notices(vec!["model alias will be retired".into()]),
        );
        let mut conv = conversation(&transport, true);

        let events = collect(conv.ask_question("When did Rust 1.0 ship?", None)).await;
        let n = events.len();

        assert!(matches!(events[n - 3], Event::Citation(ref c) if c.url == "https://blog.rust-lang.org"));
        assert_eq!(events[n - 2], Event::ServiceNotice("model alias will be retired".into()));
        assert_eq!(events[n - 1], Event::StateChange(StreamState::Done));
    }

    #[tokio::test]
    async fn test_citations_precede_tool_results() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_raw_response(
            tool_call_response(vec![ToolCall::new("c1", "calculate", "{}")])
                .with_citations(vec![Citation::new("https://a.example")]),
        );
        transport.queue_response("done");
        let mut conv = conversation(&transport, false);
        conv.register_capability(Arc::new(MockCapability::responding("calculate", "{}")))
            .unwrap();

        let events = collect(conv.ask_question("q", None)).await;

        let citation = events.iter().position(|e| matches!(e, Event::Citation(_))).unwrap();
        let result = events.iter().position(|e| matches!(e, Event::ToolResult { .. })).unwrap();
        assert!(citation < result);
    }

    #[tokio::test]
    async fn test_model_is_per_question() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_response("a");
        transport.queue_response("b");
        let mut conv = Conversation::new(transport.clone()).with_config(
            ConversationConfig::new().with_default_model("grok-default"),
        );

        collect(conv.ask_question("one", Some("grok-fast"))).await;
        collect(conv.ask_question("two", None)).await;

        assert_eq!(transport.request(0).unwrap().model.as_deref(), Some("grok-fast"));
        assert_eq!(transport.request(1).unwrap().model.as_deref(), Some("grok-default"));
    }

    #[tokio::test]
    async fn test_streamed_tool_call_fragments() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_stream(vec![
            Ok(StreamChunk::Delta { content: "Let me check. ".into() }),
            Ok(StreamChunk::ToolCallStart { index: 0, id: "c1".into(), name: "calculate".into() }),
            Ok(StreamChunk::ToolCallDelta { index: 0, arguments: r#"{"query":"#.into() }),
            Ok(StreamChunk::ToolCallDelta { index: 0, arguments: r#""6*7"}"#.into() }),
            Ok(StreamChunk::Done { usage: Some(Usage::new(10, 4)) }),
        ]);
        transport.queue_response("42.");
        let calculate = Arc::new(MockCapability::responding("calculate", r#"{"result":42}"#));
        let mut conv = conversation(&transport, true);
        conv.register_capability(calculate.clone()).unwrap();

        let events = collect(conv.ask_question("6*7?", None)).await;

        assert_eq!(text_of(&events), "Let me check. 42.");
        assert_eq!(calculate.calls.lock().unwrap()[0], r#"{"query":"6*7"}"#);
        assert_eq!(conv.history()[1].content, "Let me check. ");
        assert_eq!(conv.history()[1].tool_calls[0].id, "c1");
        assert_eq!(conv.usage().prompt_tokens, 10);
    }

    #[test]
    fn test_system_instruction_only_before_first_question() {
        let transport = Arc::new(MockTransport::new());
        let mut conv = Conversation::new(transport);
        conv.add_system_instruction("You are helpful.").unwrap();
        assert!(conv.add_system_instruction("Again").is_err());
        assert_eq!(conv.history().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_history_keeps_system_instruction() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_response("hi");
        let mut conv = conversation(&transport, true);
        conv.add_system_instruction("sys").unwrap();
        collect(conv.ask_question("hello", None)).await;
        assert_eq!(conv.history().len(), 3);

        conv.clear_history();
        assert_eq!(conv.history(), &[Message::system("sys")]);
    }
}
