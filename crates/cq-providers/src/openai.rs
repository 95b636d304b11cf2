use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, trace};

use cq_core::{
    Citation, CompletionRequest, CompletionResponse, Error, FinishReason, Message, Role,
    StreamChunk, StreamResult, ToolCall, ToolDefinition, Transport, Usage,
};

use crate::context::TransportContext;

const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";

/// Transport for OpenAI-compatible `/chat/completions` backends.
pub struct ChatCompletionsTransport {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
    context: Arc<TransportContext>,
}

impl ChatCompletionsTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        // HTTP/1.1 without transparent decompression keeps SSE chunks unbuffered.
        let client = Client::builder()
            .http1_only()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
            context: Arc::new(TransportContext::default()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_context(mut self, context: Arc<TransportContext>) -> Self {
        self.context = context;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> ChatRequest {
        // Request model wins over the transport default; with neither, the
        // backend picks.
        let model = request.model.clone().or_else(|| self.default_model.clone());

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(convert_tool).collect())
        };

        ChatRequest {
            model,
            messages: request.messages.iter().map(convert_message).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            tools,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
            extra: request.extra.clone(),
        }
    }

    fn post(&self, body: &ChatRequest) -> RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        builder
    }

    async fn send(&self, body: &ChatRequest) -> Result<CompletionResponse, Error> {
        let response = self.post(body).send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %error_text, "Chat completion request failed");
            return Err(parse_error(status.as_u16(), &error_text));
        }

        let response_text = response.text().await.map_err(transport_error)?;
        trace!(response = %response_text, "Chat completion payload");

        let api_response: ChatResponse = serde_json::from_str(&response_text)
            .map_err(|e| Error::serialization(e.to_string()))?;
        parse_response(api_response, status.as_u16())
    }

    /// Open the event source and wait for the server to accept it, so that
    /// status errors surface before any chunk is handed out.
    async fn open_stream(&self, body: &ChatRequest) -> Result<EventSource, Error> {
        let builder = self
            .post(body)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");

        let mut es = EventSource::new(builder).map_err(|e| Error::stream(e.to_string()))?;
        es.set_retry_policy(Box::new(Never));

        match es.next().await {
            Some(Ok(Event::Open)) => {
                debug!("Chat completion SSE connection opened");
                Ok(es)
            }
            Some(Ok(Event::Message(_))) => {
                es.close();
                Err(Error::stream("received data before the stream opened"))
            }
            Some(Err(err)) => {
                es.close();
                Err(open_error(err).await)
            }
            None => Err(Error::stream("event stream closed before opening")),
        }
    }
}

#[async_trait]
impl Transport for ChatCompletionsTransport {
    fn name(&self) -> &str {
        "chat-completions"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let api_request = self.build_request(&request, false);
        debug!(
            model = ?api_request.model,
            message_count = api_request.messages.len(),
            tools = api_request.tools.as_ref().map_or(0, Vec::len),
            "Chat completion request"
        );
        trace!(request = %serde_json::to_string(&api_request).unwrap_or_default(), "Chat completion request payload");

        let parsed = self.context.run(|| self.send(&api_request)).await?;

        debug!(
            model = %parsed.model,
            finish_reason = ?parsed.finish_reason,
            content_len = parsed.message.content.len(),
            tool_calls = parsed.message.tool_calls.len(),
            citations = parsed.citations.len(),
            prompt_tokens = parsed.usage.prompt_tokens,
            completion_tokens = parsed.usage.completion_tokens,
            "Chat completion response"
        );
        Ok(parsed)
    }

    async fn stream(&self, request: CompletionRequest) -> Result<StreamResult, Error> {
        let api_request = self.build_request(&request, true);
        debug!(
            model = ?api_request.model,
            message_count = api_request.messages.len(),
            tools = api_request.tools.as_ref().map_or(0, Vec::len),
            "Chat completion stream request"
        );
        trace!(request = %serde_json::to_string(&api_request).unwrap_or_default(), "Chat completion stream payload");

        let es = self.context.run(|| self.open_stream(&api_request)).await?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, Error>>(100);

        tokio::spawn(async move {
            let mut es = es;
            let mut decoder = StreamDecoder::default();

            loop {
                let event = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Stream receiver dropped, closing connection");
                        es.close();
                        return;
                    }
                    event = es.next() => event,
                };

                let decoded = match event {
                    None | Some(Err(reqwest_eventsource::Error::StreamEnded)) => break,
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(msg))) if msg.data.trim() == "[DONE]" => break,
                    Some(Ok(Event::Message(msg))) => {
                        trace!(data = %msg.data, "SSE chunk");
                        decoder.decode(&msg.data)
                    }
                    Some(Err(e)) => Err(Error::stream(e.to_string())),
                };

                match decoded {
                    Ok(chunks) => {
                        for chunk in chunks {
                            if tx.send(Ok(chunk)).await.is_err() {
                                es.close();
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "SSE stream failed");
                        let _ = tx.send(Err(err)).await;
                        es.close();
                        return;
                    }
                }
            }

            es.close();
            let _ = tx.send(Ok(decoder.finish())).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as StreamResult)
    }
}

/// Turns SSE `data:` payloads into [`StreamChunk`]s.
#[derive(Debug, Default)]
struct StreamDecoder {
    started: bool,
    usage: Option<Usage>,
}

impl StreamDecoder {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamChunk>, Error> {
        let response: ChatStreamResponse = serde_json::from_str(data)
            .map_err(|e| Error::stream(format!("malformed SSE chunk: {}", e)))?;

        let mut chunks = Vec::new();
        if !self.started {
            self.started = true;
            chunks.push(StreamChunk::Start {
                model: response.model.clone().unwrap_or_default(),
            });
        }

        for choice in response.choices {
            let delta = choice.delta;
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    chunks.push(StreamChunk::Delta { content });
                }
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                if tc.id.is_some() || name.is_some() {
                    chunks.push(StreamChunk::ToolCallStart {
                        index: tc.index,
                        id: tc.id.unwrap_or_default(),
                        name: name.unwrap_or_default(),
                    });
                }
                if let Some(arguments) = arguments.filter(|a| !a.is_empty()) {
                    chunks.push(StreamChunk::ToolCallDelta {
                        index: tc.index,
                        arguments,
                    });
                }
            }
            chunks.extend(
                annotation_citations(&delta.annotations)
                    .into_iter()
                    .map(StreamChunk::Citation),
            );
        }

        chunks.extend(
            response
                .citations
                .into_iter()
                .map(|url| StreamChunk::Citation(Citation::new(url))),
        );
        chunks.extend(
            response
                .service_notices
                .into_iter()
                .map(|text| StreamChunk::Notice { text }),
        );
        if let Some(usage) = response.usage {
            self.usage = Some(Usage::new(usage.prompt_tokens, usage.completion_tokens));
        }

        Ok(chunks)
    }

    fn finish(self) -> StreamChunk {
        StreamChunk::Done { usage: self.usage }
    }
}

fn convert_message(message: &Message) -> WireMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    r#type: "function".to_string(),
                    function: WireFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
        )
    };

    // Assistant turns that only carry tool calls send a null content.
    let content = if message.content.is_empty() && tool_calls.is_some() {
        None
    } else {
        Some(message.content.clone())
    };

    WireMessage {
        role: role.to_string(),
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn convert_tool(tool: &ToolDefinition) -> WireTool {
    WireTool {
        r#type: "function".to_string(),
        function: WireFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: serde_json::to_value(&tool.parameters).unwrap_or_default(),
        },
    }
}

fn annotation_citations(annotations: &[Annotation]) -> Vec<Citation> {
    annotations
        .iter()
        .filter_map(|a| a.url_citation.as_ref())
        .map(|c| Citation {
            url: c.url.clone(),
            title: c.title.clone().filter(|t| !t.is_empty()),
        })
        .collect()
}

fn parse_response(response: ChatResponse, status: u16) -> Result<CompletionResponse, Error> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::api(status, "No choices in response"))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
        .collect();

    let content = choice.message.content.unwrap_or_default();
    let message = if tool_calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_with_tool_calls(content, tool_calls)
    };

    let mut citations: Vec<Citation> = response.citations.into_iter().map(Citation::new).collect();
    for citation in annotation_citations(&choice.message.annotations) {
        match citations.iter_mut().find(|c| c.url == citation.url) {
            Some(existing) if existing.title.is_none() => existing.title = citation.title,
            Some(_) => {}
            None => citations.push(citation),
        }
    }

    let usage = response
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    let mut parsed = CompletionResponse::new(message, response.model.unwrap_or_default())
        .with_citations(citations)
        .with_notices(response.service_notices)
        .with_usage(usage);
    if choice.finish_reason.is_some() {
        parsed.finish_reason = FinishReason::from_wire(choice.finish_reason.as_deref());
    }
    parsed.status = status;
    Ok(parsed)
}

fn parse_error(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorDetail {
        Object { message: String },
        Text(String),
    }

    let message = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            error: ErrorDetail::Object { message } | ErrorDetail::Text(message),
        }) => message,
        Err(_) => body.to_string(),
    };

    match status {
        401 | 403 => Error::auth(message),
        429 => Error::rate_limit(message),
        400 => Error::invalid_request(message),
        _ => Error::api(status, body.to_string()),
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout(err.to_string())
    } else {
        Error::network(err.to_string())
    }
}

async fn open_error(err: reqwest_eventsource::Error) -> Error {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Chat completion stream rejected");
            parse_error(status.as_u16(), &body)
        }
        reqwest_eventsource::Error::Transport(e) => transport_error(e),
        other => Error::stream(other.to_string()),
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct ChatRequest {
    /// Optional for servers that have a default model.
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    /// Backend-specific parameters (search_parameters, reasoning_effort, ...).
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    service_notices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize)]
struct Annotation {
    url_citation: Option<UrlCitation>,
}

#[derive(Debug, Deserialize)]
struct UrlCitation {
    url: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatStreamResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    service_notices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use cq_core::{PropertySchema, ToolParameters};

    #[test]
    fn test_transport_creation() {
        let transport = ChatCompletionsTransport::new("test-key");
        assert_eq!(transport.name(), "chat-completions");
        assert_eq!(transport.default_model(), None);
        assert_eq!(transport.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let transport = ChatCompletionsTransport::new("k").with_base_url("http://localhost:8080/v1/");
        assert_eq!(transport.base_url(), "http://localhost:8080/v1");
    }

    #[test]
    fn test_build_request_model_priority() {
        let transport = ChatCompletionsTransport::new("k").with_default_model("grok-default");

        let request = CompletionRequest::new(vec![Message::user("Hello")]);
        assert_eq!(transport.build_request(&request, false).model.as_deref(), Some("grok-default"));

        let request = request.with_model("grok-fast");
        assert_eq!(transport.build_request(&request, false).model.as_deref(), Some("grok-fast"));

        let bare = ChatCompletionsTransport::new("k");
        let request = CompletionRequest::new(vec![Message::user("Hello")]);
        let json = serde_json::to_value(bare.build_request(&request, false)).unwrap();
        assert!(json.get("model").is_none());
    }

    #[test]
    fn test_build_request_wire_shape() {
        let transport = ChatCompletionsTransport::new("k");
        let tool = ToolDefinition::new("calculate", "Evaluate arithmetic").with_parameters(
            ToolParameters::new().add_property("query", PropertySchema::string("Expression"), true),
        );
        let mut extra = HashMap::new();
        extra.insert("search_parameters".to_string(), json!({"mode": "auto"}));
        let request = CompletionRequest::new(vec![
            Message::system("Be terse."),
            Message::user("2+2?"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "calculate", r#"{"query":"2+2"}"#)]),
            Message::tool_result("c1", r#"{"result":4}"#),
        ])
        .with_tools(vec![tool])
        .with_extra(extra);

        let json = serde_json::to_value(transport.build_request(&request, true)).unwrap();

        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["search_parameters"]["mode"], "auto");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "calculate");
        assert_eq!(json["tools"][0]["function"]["parameters"]["required"][0], "query");

        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[2]["content"].is_null());
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"query":"2+2"}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
    }

    #[test]
    fn test_parse_response_text_and_citations() {
        let raw = json!({
            "model": "grok-4",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Rust 1.0 shipped in May 2015.",
                    "annotations": [
                        {"type": "url_citation", "url_citation": {"url": "https://blog.rust-lang.org/2015/05/15/Rust-1.0.html", "title": "Announcing Rust 1.0"}},
                        {"type": "url_citation", "url_citation": {"url": "https://en.wikipedia.org/wiki/Rust", "title": ""}}
                    ]
                },
                "finish_reason": "stop"
            }],
            "citations": ["https://blog.rust-lang.org/2015/05/15/Rust-1.0.html"],
            "service_notices": ["grok-3 is deprecated"],
            "usage": {"prompt_tokens": 12, "completion_tokens": 9, "total_tokens": 21}
        });
        let response: ChatResponse = serde_json::from_value(raw).unwrap();

        let parsed = parse_response(response, 200).unwrap();
        assert_eq!(parsed.message.content, "Rust 1.0 shipped in May 2015.");
        assert_eq!(parsed.finish_reason, FinishReason::Stop);
        assert_eq!(parsed.citations.len(), 2);
        assert_eq!(parsed.citations[0].title.as_deref(), Some("Announcing Rust 1.0"));
        assert_eq!(parsed.citations[1].title, None);
        assert_eq!(parsed.notices, vec!["grok-3 is deprecated".to_string()]);
        assert_eq!(parsed.usage.total_tokens, 21);
    }

    #[test]
    fn test_parse_response_tool_calls() {
        let raw = json!({
            "model": "grok-4",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "calculate", "arguments": "{\"query\":\"2+2\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let response: ChatResponse = serde_json::from_value(raw).unwrap();

        let parsed = parse_response(response, 200).unwrap();
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
        assert_eq!(
            parsed.message.tool_calls,
            vec![ToolCall::new("call_1", "calculate", r#"{"query":"2+2"}"#)]
        );
        assert!(parsed.message.content.is_empty());
    }

    #[test]
    fn test_parse_response_without_choices() {
        let response: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(parse_response(response, 200).is_err());
    }

    #[test]
    fn test_parse_error() {
        let body = r#"{"error":{"message":"Incorrect API key","type":"auth"}}"#;
        assert!(matches!(parse_error(401, body), Error::Auth(ref m) if m == "Incorrect API key"));
        assert!(matches!(parse_error(429, r#"{"error":"slow down"}"#), Error::RateLimit(ref m) if m == "slow down"));
        assert!(matches!(parse_error(400, "bad"), Error::InvalidRequest(_)));

        match parse_error(502, "<html>Bad Gateway</html>") {
            Error::Api { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "<html>Bad Gateway</html>");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_stream_decoder() {
        let mut decoder = StreamDecoder::default();

        let first = decoder
            .decode(r#"{"model":"grok-4","choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(
            first,
            vec![
                StreamChunk::Start { model: "grok-4".into() },
                StreamChunk::Delta { content: "Hel".into() },
            ]
        );

        let calls = decoder
            .decode(r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"c1","function":{"name":"calculate","arguments":""}},
                {"index":1,"id":"c2","function":{"name":"fetch_webpage","arguments":"{\"url\":"}}
            ]}}]}"#)
            .unwrap();
        assert_eq!(
            calls,
            vec![
                StreamChunk::ToolCallStart { index: 0, id: "c1".into(), name: "calculate".into() },
                StreamChunk::ToolCallStart { index: 1, id: "c2".into(), name: "fetch_webpage".into() },
                StreamChunk::ToolCallDelta { index: 1, arguments: r#"{"url":"#.into() },
            ]
        );

        let args = decoder
            .decode(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{}"}}]}}]}"#)
            .unwrap();
        assert_eq!(args, vec![StreamChunk::ToolCallDelta { index: 0, arguments: "{}".into() }]);

        let tail = decoder
            .decode(r#"{"choices":[],"citations":["https://x.ai"],"service_notices":["notice"],"usage":{"prompt_tokens":3,"completion_tokens":2}}"#)
            .unwrap();
        assert_eq!(
            tail,
            vec![
                StreamChunk::Citation(Citation::new("https://x.ai")),
                StreamChunk::Notice { text: "notice".into() },
            ]
        );
        assert_eq!(decoder.finish(), StreamChunk::Done { usage: Some(Usage::new(3, 2)) });
    }

    #[test]
    fn test_stream_decoder_rejects_malformed_chunk() {
        let mut decoder = StreamDecoder::default();
        assert!(matches!(decoder.decode("{not json"), Err(Error::Stream(_))));
    }
}
