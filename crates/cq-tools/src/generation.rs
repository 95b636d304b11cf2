//! Long-running media generation: submit a job, then poll it to a terminal status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cq_core::{
    error_payload, parse_arguments, Capability, Error, PropertySchema, ToolParameters, DEFAULT_TOOL_TIMEOUT,
};

const DEFAULT_VIDEO_MODEL: &str = "grok-imagine-video";
const MAX_DURATION_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// State of a submitted generation job as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Done { url: String },
    Expired,
}

/// Where generation jobs are submitted and polled.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submit a job and return its request id.
    async fn submit(&self, request: &GenerationRequest) -> Result<String, Error>;

    async fn poll(&self, request_id: &str) -> Result<JobStatus, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        // Finish before the conversation's default tool timeout so the job's
        // own status (and request id) reaches the model.
        Self {
            interval: Duration::from_secs(5),
            timeout: DEFAULT_TOOL_TIMEOUT.saturating_sub(Duration::from_secs(30)),
        }
    }
}

impl PollPolicy {
    /// Fit the polling deadline inside an outer execution limit, one interval short of it.
    pub fn within(mut self, limit: Option<Duration>) -> Self {
        if let Some(limit) = limit {
            self.timeout = self.timeout.min(limit.saturating_sub(self.interval));
        }
        self
    }
}

/// Terminal result of polling a job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Done { request_id: String, url: String },
    Expired { request_id: String },
    /// The deadline passed while the backend still reported the job pending.
    TimedOut { request_id: String },
    /// The deadline passed while polling was failing transiently.
    Pending { request_id: String, last_error: String },
    /// The backend rejected the poll outright.
    Failed { request_id: String, error: String },
}

impl PollOutcome {
    pub fn to_payload(&self) -> Value {
        match self {
            PollOutcome::Done { request_id, url } => {
                json!({"status": "done", "request_id": request_id, "url": url})
            }
            PollOutcome::Expired { request_id } => {
                json!({"status": "expired", "request_id": request_id})
            }
            PollOutcome::TimedOut { request_id } => {
                json!({"status": "timeout", "request_id": request_id})
            }
            PollOutcome::Pending { request_id, last_error } => {
                json!({"status": "pending", "request_id": request_id, "last_error": last_error})
            }
            PollOutcome::Failed { request_id, error } => {
                json!({"status": "error", "request_id": request_id, "error": error})
            }
        }
    }
}

/// Poll `request_id` every `policy.interval` until a terminal status or the deadline.
pub async fn poll_until_terminal(
    backend: &dyn GenerationBackend,
    request_id: &str,
    policy: PollPolicy,
) -> PollOutcome {
    let deadline = Instant::now() + policy.timeout;
    let mut last_error: Option<String>;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, backend.poll(request_id)).await {
            Ok(Ok(JobStatus::Done { url })) => {
                info!(request_id, attempts, "Generation job done");
                return PollOutcome::Done {
                    request_id: request_id.to_string(),
                    url,
                };
            }
            Ok(Ok(JobStatus::Expired)) => {
                warn!(request_id, attempts, "Generation job expired");
                return PollOutcome::Expired {
                    request_id: request_id.to_string(),
                };
            }
            Ok(Ok(JobStatus::Pending)) => {
                debug!(request_id, attempts, "Generation job pending");
                last_error = None;
            }
            Ok(Err(e)) if e.is_retryable() => {
                warn!(request_id, attempts, error = %e, "Generation poll failed, will retry");
                last_error = Some(e.to_string());
            }
            Ok(Err(e)) => {
                warn!(request_id, attempts, error = %e, "Generation poll rejected");
                return PollOutcome::Failed {
                    request_id: request_id.to_string(),
                    error: e.to_string(),
                };
            }
            Err(_) => {
                last_error = Some("poll did not answer before the deadline".to_string());
                break;
            }
        }

        if Instant::now() + policy.interval > deadline {
            break;
        }
        tokio::time::sleep(policy.interval).await;
    }

    let request_id = request_id.to_string();
    match last_error {
        Some(last_error) => PollOutcome::Pending { request_id, last_error },
        None => PollOutcome::TimedOut { request_id },
    }
}

/// [`GenerationBackend`] over the backend's HTTP video endpoints.
pub struct HttpGenerationBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpGenerationBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: DEFAULT_VIDEO_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => Error::auth(body),
            429 => Error::rate_limit(body),
            code => Error::api(code, body),
        })
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    request_id: String,
}

#[derive(Deserialize)]
struct PollResponse {
    status: String,
    #[serde(default)]
    video: Option<VideoInfo>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct VideoInfo {
    url: String,
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, Error> {
        let mut body = serde_json::to_value(request)?;
        body["model"] = json!(self.model);

        let response = self
            .client
            .post(format!("{}/videos/generations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;
        let submitted: SubmitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;
        Ok(submitted.request_id)
    }

    async fn poll(&self, request_id: &str) -> Result<JobStatus, Error> {
        let response = self
            .client
            .get(format!("{}/videos/{}", self.base_url, request_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| Error::network(e.to_string()))?;
        let polled: PollResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;

        match polled.status.as_str() {
            "done" | "completed" | "succeeded" => {
                let url = polled
                    .video
                    .map(|v| v.url)
                    .or(polled.url)
                    .ok_or_else(|| Error::serialization("finished job has no video url"))?;
                Ok(JobStatus::Done { url })
            }
            "expired" | "failed" => Ok(JobStatus::Expired),
            _ => Ok(JobStatus::Pending),
        }
    }
}

/// The `generate_video` capability.
pub struct GenerateVideo {
    backend: Arc<dyn GenerationBackend>,
    policy: PollPolicy,
}

impl GenerateVideo {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            policy: PollPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Capability for GenerateVideo {
    fn name(&self) -> &str {
        "generate_video"
    }

    fn description(&self) -> &str {
        "Generate a short video from a text prompt. Returns the video URL when the job finishes."
    }

    fn parameters(&self) -> ToolParameters {
        ToolParameters::new()
            .add_property("prompt", PropertySchema::string("Description of the video to generate"), true)
            .add_property(
                "duration",
                PropertySchema::integer("Length of the video in seconds (1-15)"),
                false,
            )
    }

    async fn execute(&self, arguments: &str) -> Result<String, Error> {
        let args = match parse_arguments(arguments) {
            Ok(args) => args,
            Err(message) => return Ok(error_payload(message)),
        };

        let Some(prompt) = args
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
        else {
            return Ok(error_payload("missing prompt"));
        };
        let duration = match args.get("duration") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(secs) if (1..=MAX_DURATION_SECS).contains(&secs) => Some(secs),
                _ => {
                    return Ok(error_payload(format!(
                        "duration must be an integer between 1 and {}",
                        MAX_DURATION_SECS
                    )))
                }
            },
        };

        let request = GenerationRequest {
            prompt: prompt.to_string(),
            duration,
        };
        let started = Instant::now();
        let request_id = match self.backend.submit(&request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Video generation submit failed");
                return Ok(error_payload(format!("failed to submit generation job: {}", e)));
            }
        };
        debug!(request_id = %request_id, "Video generation submitted");

        // Submission time counts against the same deadline.
        let policy = PollPolicy {
            timeout: self.policy.timeout.saturating_sub(started.elapsed()),
            ..self.policy
        };
        let outcome = poll_until_terminal(self.backend.as_ref(), &request_id, policy).await;
        Ok(outcome.to_payload().to_string())
    }
}
