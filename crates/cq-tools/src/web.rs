//! Webpage fetching capability.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tracing::{debug, warn};

use cq_core::{error_payload, parse_arguments, Capability, Error, PropertySchema, ToolParameters};

const DEFAULT_MAX_CHARS: usize = 50_000;

/// Elements whose text never counts as page content.
const SKIPPED_TAGS: &[&str] = &["script", "style", "nav", "footer", "header", "aside", "noscript"];

/// The `fetch_webpage` capability.
pub struct FetchWebpage {
    client: Client,
    max_chars: usize,
}

impl Default for FetchWebpage {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchWebpage {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .user_agent(concat!("colloquy/", env!("CARGO_PKG_VERSION")))
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            max_chars: DEFAULT_MAX_CHARS,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    async fn fetch(&self, url: &Url) -> Result<String, String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| format!("failed to fetch '{}': {}", url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP error {} fetching '{}'", status, url));
        }

        response
            .text()
            .await
            .map_err(|e| format!("failed to read response: {}", e))
    }
}

#[async_trait]
impl Capability for FetchWebpage {
    fn name(&self) -> &str {
        "fetch_webpage"
    }

    fn description(&self) -> &str {
        "Fetch a webpage and extract its text content. Optionally filter by CSS selector."
    }

    fn parameters(&self) -> ToolParameters {
        ToolParameters::new()
            .add_property("url", PropertySchema::string("URL of the webpage to fetch"), true)
            .add_property(
                "selector",
                PropertySchema::string(
                    "Optional CSS selector to extract specific content (e.g., 'main', 'article', '.content')",
                ),
                false,
            )
    }

    async fn execute(&self, arguments: &str) -> Result<String, Error> {
        let args = match parse_arguments(arguments) {
            Ok(args) => args,
            Err(message) => return Ok(error_payload(message)),
        };

        let Some(raw_url) = args.get("url").and_then(Value::as_str).filter(|u| !u.trim().is_empty()) else {
            return Ok(error_payload("missing url"));
        };
        let url = match Url::parse(raw_url.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => return Ok(error_payload(format!("unsupported URL scheme '{}'", url.scheme()))),
            Err(e) => return Ok(error_payload(format!("invalid URL '{}': {}", raw_url, e))),
        };
        let selector = args
            .get("selector")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty());

        debug!(url = %url, selector = ?selector, "Fetching webpage");

        let html = match self.fetch(&url).await {
            Ok(html) => html,
            Err(message) => {
                warn!(url = %url, error = %message, "Webpage fetch failed");
                return Ok(json!({"status": "error", "url": url.as_str(), "error": message}).to_string());
            }
        };

        let text = match extract_page_text(&html, selector) {
            Ok(text) => text,
            Err(message) => return Ok(error_payload(message)),
        };

        let total_chars = text.chars().count();
        let (content, truncated) = truncate_chars(&text, self.max_chars);

        Ok(json!({
            "status": "completed",
            "url": url.as_str(),
            "content": content,
            "truncated": truncated,
            "total_chars": total_chars,
        })
        .to_string())
    }
}

/// Extract readable text from a document, optionally restricted to a selector.
///
/// Without a selector the main content region is preferred, falling back to
/// the body.
pub fn extract_page_text(html: &str, selector: Option<&str>) -> Result<String, String> {
    let document = Html::parse_document(html);

    let text = match selector {
        Some(selector) => {
            let parsed = Selector::parse(selector).map_err(|_| format!("invalid selector: {}", selector))?;
            join_text(document.select(&parsed))
        }
        None => {
            let main = Selector::parse("main, article, .content, #content, .post, .entry")
                .map(|s| join_text(document.select(&s)))
                .unwrap_or_default();
            if !main.trim().is_empty() {
                main
            } else {
                match Selector::parse("body") {
                    Ok(body) => join_text(document.select(&body)),
                    Err(_) => extract_text(&document.root_element()),
                }
            }
        }
    };

    Ok(clean_text(&text))
}

fn join_text<'a>(elements: impl Iterator<Item = ElementRef<'a>>) -> String {
    elements
        .map(|el| extract_text(&el))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Text of an element, leaving out scripts, styles and page chrome.
fn extract_text(element: &ElementRef) -> String {
    let mut text = String::new();

    for node in element.descendants() {
        let Some(t) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .take_while(|a| a.id() != element.id())
            .any(|a| a.value().as_element().is_some_and(|el| SKIPPED_TAGS.contains(&el.name())));
        if hidden {
            continue;
        }

        let trimmed = t.trim();
        if !trimmed.is_empty() {
            if !text.is_empty() && !text.ends_with(' ') && !text.ends_with('\n') {
                text.push(' ');
            }
            text.push_str(trimmed);
        }
    }

    text
}

/// Collapse runs of spaces and keep at most two consecutive newlines.
fn clean_text(text: &str) -> String {
    let mut result = String::new();
    let mut prev_was_whitespace = false;
    let mut newline_count = 0;

    for ch in text.chars() {
        if ch == '\n' {
            newline_count += 1;
            if newline_count <= 2 {
                result.push('\n');
            }
            prev_was_whitespace = true;
        } else if ch.is_whitespace() {
            if !prev_was_whitespace {
                result.push(' ');
                prev_was_whitespace = true;
            }
        } else {
            result.push(ch);
            prev_was_whitespace = false;
            newline_count = 0;
        }
    }

    result.trim().to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (&text[..cut], true),
        None => (text, false),
    }
}
