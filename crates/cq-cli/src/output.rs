//! Terminal rendering of conversation events.
//!
//! Answer text goes to stdout so it can be piped; tool activity, notices and
//! failures go to stderr.

use std::io::{self, Write};

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;

use cq_core::{CancellationToken, Citation, Event, FailureKind, StreamState};

const TOOL_PREVIEW_CHARS: usize = 120;

/// What a finished question produced.
#[derive(Debug, Default)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub failure: Option<(FailureKind, String)>,
}

impl Answer {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct EventPrinter<O: Write, E: Write> {
    out: O,
    err: E,
    verbose: bool,
    answer: Answer,
}

impl EventPrinter<io::Stdout, io::Stderr> {
    pub fn terminal(verbose: bool) -> Self {
        Self::new(io::stdout(), io::stderr(), verbose)
    }
}

impl<O: Write, E: Write> EventPrinter<O, E> {
    pub fn new(out: O, err: E, verbose: bool) -> Self {
        Self {
            out,
            err,
            verbose,
            answer: Answer::default(),
        }
    }

    pub fn handle(&mut self, event: Event) -> io::Result<()> {
        match event {
            Event::StateChange(state) => {
                if self.verbose && state != StreamState::Streaming {
                    writeln!(self.err, "[{}]", state)?;
                }
            }
            Event::TextDelta(text) => {
                write!(self.out, "{}", text)?;
                self.out.flush()?;
                self.answer.text.push_str(&text);
            }
            Event::ToolResult {
                tool_name,
                result,
                is_error,
                ..
            } => {
                let marker = if is_error { "tool error" } else { "tool" };
                writeln!(self.err, "[{}] {}: {}", marker, tool_name, preview(&result, TOOL_PREVIEW_CHARS))?;
            }
            Event::Citation(citation) => {
                if !self.answer.citations.contains(&citation) {
                    self.answer.citations.push(citation);
                }
            }
            Event::ServiceNotice(text) => {
                writeln!(self.err, "[notice] {}", text)?;
            }
            Event::Failure { kind, message } => {
                self.answer.failure = Some((kind, message));
            }
        }
        Ok(())
    }

    /// Close the answer line and list the collected sources.
    pub fn finish(mut self) -> io::Result<Answer> {
        if !self.answer.text.is_empty() && !self.answer.text.ends_with('\n') {
            writeln!(self.out)?;
        }
        if !self.answer.citations.is_empty() {
            writeln!(self.out, "\nSources:")?;
            for (i, citation) in self.answer.citations.iter().enumerate() {
                match &citation.title {
                    Some(title) => writeln!(self.out, "  [{}] {} - {}", i + 1, title, citation.url)?,
                    None => writeln!(self.out, "  [{}] {}", i + 1, citation.url)?,
                }
            }
        }
        self.out.flush()?;
        Ok(self.answer)
    }
}

/// Print every event of `events` and return the collected answer.
pub async fn render<S, O, E>(mut events: S, mut printer: EventPrinter<O, E>) -> io::Result<Answer>
where
    S: Stream<Item = Event> + Unpin,
    O: Write,
    E: Write,
{
    while let Some(event) = events.next().await {
        printer.handle(event)?;
    }
    printer.finish()
}

/// Cancel `token` on Ctrl+C. Abort the handle once the question ends.
pub fn cancel_on_interrupt(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("Interrupt received, cancelling question");
            token.cancel();
        }
    })
}

fn preview(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    match single_line.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &single_line[..cut]),
        None => single_line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: Vec<Event>, verbose: bool) -> (String, String, Answer) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let answer = {
            let mut printer = EventPrinter::new(&mut out, &mut err, verbose);
            for event in events {
                printer.handle(event).unwrap();
            }
            printer.finish().unwrap()
        };
        (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap(), answer)
    }

    #[test]
    fn test_text_and_sources() {
        let (out, err, answer) = run(
            vec![
                Event::StateChange(StreamState::Thinking),
                Event::StateChange(StreamState::Streaming),
                Event::TextDelta("Rust 1.0 ".into()),
                Event::TextDelta("shipped in 2015.".into()),
                Event::Citation(Citation::new("https://blog.rust-lang.org").with_title("Rust Blog")),
                Event::Citation(Citation::new("https://blog.rust-lang.org").with_title("Rust Blog")),
                Event::ServiceNotice("search was used".into()),
                Event::StateChange(StreamState::Done),
            ],
            false,
        );

        assert_eq!(
            out,
            "Rust 1.0 shipped in 2015.\n\nSources:\n  [1] Rust Blog - https://blog.rust-lang.org\n"
        );
        assert_eq!(err, "[notice] search was used\n");
        assert!(answer.succeeded());
        assert_eq!(answer.citations.len(), 1);
    }

    #[test]
    fn test_tool_results_and_states_on_stderr() {
        let (out, err, _) = run(
            vec![
                Event::StateChange(StreamState::Thinking),
                Event::StateChange(StreamState::CallingTool),
                Event::ToolResult {
                    tool_name: "calculate".into(),
                    tool_call_id: "call_1".into(),
                    result: "{\"result\":4}".into(),
                    is_error: false,
                },
                Event::ToolResult {
                    tool_name: "nope".into(),
                    tool_call_id: "call_2".into(),
                    result: "unknown".into(),
                    is_error: true,
                },
            ],
            true,
        );

        assert!(out.is_empty());
        assert_eq!(
            err,
            "[thinking]\n[calling_tool]\n[tool] calculate: {\"result\":4}\n[tool error] nope: unknown\n"
        );
    }

    #[test]
    fn test_failure_is_recorded() {
        let (_, _, answer) = run(
            vec![
                Event::StateChange(StreamState::Error),
                Event::failure(FailureKind::RoundLimitExceeded { max_rounds: 3 }, "too many rounds"),
            ],
            false,
        );

        let (kind, message) = answer.failure.unwrap();
        assert_eq!(kind, FailureKind::RoundLimitExceeded { max_rounds: 3 });
        assert_eq!(message, "too many rounds");
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo\nworld", 3), "hél...");
        assert_eq!(preview("short", 10), "short");
    }

    #[tokio::test]
    async fn test_render_conversation_with_tool_round() {
        use std::sync::Arc;

        use cq_core::testing::{text_response, tool_call_response, MockCapability, MockTransport};
        use cq_core::{Conversation, ConversationConfig, Question, ToolCall};

        let transport = Arc::new(MockTransport::new());
        transport.queue_raw_response(tool_call_response(vec![ToolCall::new(
            "call_1",
            "calculate",
            r#"{"query":"6*7"}"#,
        )]));
        transport.queue_raw_response(
            text_response("It is 42.").with_citations(vec![Citation::new("https://example.com/math")]),
        );

        let mut conversation = Conversation::new(transport.clone())
            .with_config(ConversationConfig::new().with_streaming(false));
        conversation
            .register_capability(Arc::new(MockCapability::responding("calculate", r#"{"result":42}"#)))
            .unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        let answer = render(
            conversation.ask(Question::new("What is 6*7?")),
            EventPrinter::new(&mut out, &mut err, false),
        )
        .await
        .unwrap();

        assert!(answer.succeeded());
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "It is 42.\n\nSources:\n  [1] https://example.com/math\n"
        );
        assert_eq!(String::from_utf8(err).unwrap(), "[tool] calculate: {\"result\":42}\n");
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_render_drains_stream() {
        let events = futures::stream::iter(vec![
            Event::TextDelta("42".into()),
            Event::StateChange(StreamState::Done),
        ]);
        let mut out = Vec::new();
        let answer = render(events, EventPrinter::new(&mut out, io::sink(), false))
            .await
            .unwrap();
        assert_eq!(answer.text, "42");
        assert_eq!(String::from_utf8(out).unwrap(), "42\n");
    }
}
