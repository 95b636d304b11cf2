//! Reassembly of one backend round from streamed deltas or a complete response.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::message::{Citation, StreamChunk, ToolCall, Usage};
use crate::transport::CompletionResponse;

/// Everything the backend produced in one request/response cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Round {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub citations: Vec<Citation>,
    pub notices: Vec<String>,
    pub usage: Option<Usage>,
}

impl Round {
    pub fn from_response(response: CompletionResponse, round: usize) -> Self {
        let tool_calls = response
            .message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| normalize_call(call.id, call.name, call.arguments, round, index))
            .collect();

        Self {
            text: response.message.content,
            tool_calls,
            citations: response.citations,
            notices: response.notices,
            usage: Some(response.usage),
        }
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed chunks into a [`Round`].
///
/// Tool-call fragments are keyed by their index, so fragments belonging to
/// different calls may arrive interleaved.
#[derive(Debug)]
pub struct RoundBuilder {
    round: usize,
    text: String,
    calls: BTreeMap<usize, PartialCall>,
    citations: Vec<Citation>,
    notices: Vec<String>,
    usage: Option<Usage>,
}

impl RoundBuilder {
    pub fn new(round: usize) -> Self {
        Self {
            round,
            text: String::new(),
            calls: BTreeMap::new(),
            citations: Vec::new(),
            notices: Vec::new(),
            usage: None,
        }
    }

    /// Fold one chunk into the round.
    ///
    /// Returns the text delta to forward to the caller, if the chunk carried one.
    pub fn apply(&mut self, chunk: StreamChunk) -> Result<Option<String>, Error> {
        match chunk {
            StreamChunk::Start { model } => {
                tracing::trace!(model = %model, "Round started");
            }
            StreamChunk::Delta { content } => {
                if !content.is_empty() {
                    self.text.push_str(&content);
                    return Ok(Some(content));
                }
            }
            StreamChunk::ToolCallStart { index, id, name } => {
                let call = self.calls.entry(index).or_default();
                if !id.is_empty() {
                    call.id = id;
                }
                if !name.is_empty() {
                    call.name = name;
                }
            }
            StreamChunk::ToolCallDelta { index, arguments } => {
                self.calls.entry(index).or_default().arguments.push_str(&arguments);
            }
            StreamChunk::Citation(citation) => {
                if !self.citations.contains(&citation) {
                    self.citations.push(citation);
                }
            }
            StreamChunk::Notice { text } => self.notices.push(text),
            StreamChunk::Done { usage } => {
                if usage.is_some() {
                    self.usage = usage;
                }
            }
            StreamChunk::Error { message } => return Err(Error::stream(message)),
        }
        Ok(None)
    }

    pub fn finish(self) -> Round {
        let round = self.round;
        let tool_calls = self
            .calls
            .into_iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| normalize_call(call.id, call.name, call.arguments, round, index))
            .collect();

        Round {
            text: self.text,
            tool_calls,
            citations: self.citations,
            notices: self.notices,
            usage: self.usage,
        }
    }
}

fn normalize_call(id: String, name: String, arguments: String, round: usize, index: usize) -> ToolCall {
    let id = if id.is_empty() {
        format!("call_{}_{}", round, index)
    } else {
        id
    };
    let arguments = if arguments.trim().is_empty() {
        "{}".to_string()
    } else {
        arguments
    };
    ToolCall::new(id, name, arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn test_text_deltas_forwarded() {
        let mut builder = RoundBuilder::new(1);
        assert_eq!(
            builder.apply(StreamChunk::Delta { content: "Hel".into() }).unwrap(),
            Some("Hel".to_string())
        );
        assert_eq!(builder.apply(StreamChunk::Delta { content: String::new() }).unwrap(), None);
        builder.apply(StreamChunk::Delta { content: "lo".into() }).unwrap();

        let round = builder.finish();
        assert_eq!(round.text, "Hello");
        assert!(round.tool_calls.is_empty());
    }

    #[test]
    fn test_interleaved_tool_calls() {
        let mut builder = RoundBuilder::new(1);
        let chunks = vec![
            StreamChunk::ToolCallStart { index: 0, id: "a".into(), name: "calculate".into() },
            StreamChunk::ToolCallStart { index: 1, id: "b".into(), name: "fetch_webpage".into() },
            StreamChunk::ToolCallDelta { index: 0, arguments: r#"{"query":"#.into() },
            StreamChunk::ToolCallDelta { index: 1, arguments: r#"{"url":"https://x.ai"}"#.into() },
            StreamChunk::ToolCallDelta { index: 0, arguments: r#""2+2"}"#.into() },
            StreamChunk::Done { usage: Some(Usage::new(5, 7)) },
        ];
        for chunk in chunks {
            assert_eq!(builder.apply(chunk).unwrap(), None);
        }

        let round = builder.finish();
        assert_eq!(
            round.tool_calls,
            vec![
                ToolCall::new("a", "calculate", r#"{"query":"2+2"}"#),
                ToolCall::new("b", "fetch_webpage", r#"{"url":"https://x.ai"}"#),
            ]
        );
        assert_eq!(round.usage, Some(Usage::new(5, 7)));
    }

    #[test]
    fn test_missing_id_and_arguments_are_filled() {
        let mut builder = RoundBuilder::new(3);
        builder
            .apply(StreamChunk::ToolCallStart { index: 2, id: String::new(), name: "calculate".into() })
            .unwrap();

        let round = builder.finish();
        assert_eq!(round.tool_calls, vec![ToolCall::new("call_3_2", "calculate", "{}")]);
    }

    #[test]
    fn test_nameless_fragments_dropped() {
        let mut builder = RoundBuilder::new(1);
        builder
            .apply(StreamChunk::ToolCallDelta { index: 0, arguments: "{}".into() })
            .unwrap();
        assert!(builder.finish().tool_calls.is_empty());
    }

    #[test]
    fn test_citations_deduplicated_and_notices_kept() {
        let mut builder = RoundBuilder::new(1);
        let citation = Citation::new("https://example.com").with_title("Example");
        builder.apply(StreamChunk::Citation(citation.clone())).unwrap();
        builder.apply(StreamChunk::Citation(citation.clone())).unwrap();
        builder.apply(StreamChunk::Notice { text: "model deprecated".into() }).unwrap();

        let round = builder.finish();
        assert_eq!(round.citations, vec![citation]);
        assert_eq!(round.notices, vec!["model deprecated".to_string()]);
    }

    #[test]
    fn test_error_chunk() {
        let mut builder = RoundBuilder::new(1);
        let err = builder
            .apply(StreamChunk::Error { message: "overloaded".into() })
            .unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }

    #[test]
    fn test_from_response() {
        let response = CompletionResponse::new(
            Message::assistant_with_tool_calls("checking", vec![ToolCall::new("", "calculate", "")]),
            "m",
        )
        .with_citations(vec![Citation::new("https://a")]);

        let round = Round::from_response(response, 2);
        assert_eq!(round.text, "checking");
        assert_eq!(round.tool_calls, vec![ToolCall::new("call_2_0", "calculate", "{}")]);
        assert_eq!(round.citations.len(), 1);
    }
}
