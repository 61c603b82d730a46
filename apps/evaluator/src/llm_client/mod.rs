//! Generative Call Client — the single point of entry for all model calls.
//!
//! ARCHITECTURAL RULE: no other module may talk to the generation service
//! directly. Parsing and schema validation of nondeterministic model output
//! live here, inside the retry boundary, so stage logic never sees a raw
//! response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;

pub mod prompts;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The model used for all evaluation calls.
/// Intentionally hardcoded to prevent accidental drift between deployments.
pub const MODEL: &str = "claude-sonnet-4-5";
/// Fixed sampling temperature, a policy value rather than a per-call knob.
/// Kept low to minimize run-to-run variance in scoring.
pub const TEMPERATURE: f32 = 0.1;
pub const MAX_TOKENS: u32 = 2000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a single upstream attempt failed.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Worth retrying: timeout, transport error, rate limit, server error.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Not worth retrying: authentication or configuration refusal.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

/// One raw completion call against the generation service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, BackendError>;
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

/// Production backend: the Anthropic Messages API over reqwest.
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
}

impl AnthropicBackend {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
        }
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let request_body = AnthropicRequest {
            model: MODEL,
            max_tokens,
            temperature,
            system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        let status = response.status();

        if status.as_u16() == 429 || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Transient(format!("status {status}: {body}")));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(BackendError::Permanent(format!(
                "status {status}: {message}"
            )));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("invalid response body: {e}")))?;

        debug!(
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            "completion call succeeded"
        );

        parsed
            .content
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.clone())
            .ok_or_else(|| BackendError::Transient("empty completion content".to_string()))
    }
}

/// Retry schedule: exponential backoff with bounded jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Deterministic component of the wait after attempt `attempt` fails
    /// (1-based): base, 2x base, 4x base, ... The exponent saturates so an
    /// operator-configured attempt count cannot overflow the shift.
    pub fn step(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay * (1u32 << exponent)
    }

    /// Full wait including jitter. Jitter stays below half the step, so
    /// consecutive delays are strictly increasing even at the jitter bounds.
    pub fn delay(&self, attempt: u32) -> Duration {
        let step = self.step(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=step.as_millis() as u64 / 2);
        step + Duration::from_millis(jitter_ms)
    }
}

enum AttemptFailure {
    Transport(String),
    Malformed(String),
}

/// Wraps a backend with the retry policy and the schema-checking boundary.
#[derive(Clone)]
pub struct GenerativeClient {
    backend: Arc<dyn CompletionBackend>,
    retry: RetryPolicy,
}

impl GenerativeClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Calls the model and deserializes its JSON output into `T`, applying
    /// the caller's semantic validation before accepting the value.
    ///
    /// Transient transport failures, parse failures, and validation failures
    /// are all retried with backoff. Exhaustion is reported distinctly:
    /// `UpstreamUnavailable` when the last failure was transport-level,
    /// `MalformedResponse` when the service answered but incoherently.
    /// Permanent upstream refusals fail on the first attempt.
    pub async fn generate<T, F>(
        &self,
        system: &str,
        prompt: &str,
        validate: F,
    ) -> Result<T, PipelineError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<(), String> + Send + Sync,
    {
        let mut last: Option<AttemptFailure> = None;

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.retry.delay(attempt - 1);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying generation call"
                );
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let outcome = self
                .backend
                .complete(system, prompt, TEMPERATURE, MAX_TOKENS)
                .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Err(BackendError::Permanent(message)) => {
                    warn!(
                        attempt,
                        latency_ms,
                        outcome = "permanent",
                        %message,
                        "generation attempt rejected"
                    );
                    return Err(PipelineError::UpstreamRejected(message));
                }
                Err(BackendError::Transient(message)) => {
                    warn!(
                        attempt,
                        latency_ms,
                        outcome = "transient",
                        %message,
                        "generation attempt failed"
                    );
                    last = Some(AttemptFailure::Transport(message));
                }
                Ok(raw) => {
                    let text = strip_json_fences(&raw);
                    match serde_json::from_str::<T>(text) {
                        Err(e) => {
                            warn!(
                                attempt,
                                latency_ms,
                                outcome = "malformed",
                                error = %e,
                                "generation attempt returned unparseable output"
                            );
                            last = Some(AttemptFailure::Malformed(e.to_string()));
                        }
                        Ok(value) => match validate(&value) {
                            Err(message) => {
                                warn!(
                                    attempt,
                                    latency_ms,
                                    outcome = "invalid",
                                    %message,
                                    "generation attempt failed schema validation"
                                );
                                last = Some(AttemptFailure::Malformed(message));
                            }
                            Ok(()) => {
                                info!(
                                    attempt,
                                    latency_ms,
                                    outcome = "ok",
                                    "generation attempt succeeded"
                                );
                                return Ok(value);
                            }
                        },
                    }
                }
            }
        }

        let attempts = self.retry.max_attempts;
        Err(match last {
            Some(AttemptFailure::Malformed(message)) => {
                PipelineError::MalformedResponse { attempts, message }
            }
            Some(AttemptFailure::Transport(message)) => {
                PipelineError::UpstreamUnavailable { attempts, message }
            }
            None => PipelineError::UpstreamUnavailable {
                attempts,
                message: "no attempts were made".to_string(),
            },
        })
    }
}

/// Strips ```json ... ``` or ``` ... ``` code fences from model output.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}
