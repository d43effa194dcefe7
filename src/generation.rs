//! Text generation over an OpenAI-compatible chat-completions API.
//!
//! [`Generator::generate`] never fails: after the retry budget is spent it
//! returns one of the sentinel strings below, which callers can detect with
//! [`is_failure_sentinel`].
//!
//! Retry strategy:
//! - Timeouts, non-success HTTP statuses, transport errors → retry
//! - Backoff before retry `n` (n ≥ 2): `base_delay * 2^(n-2)`, capped at `2^5`
//! - Final attempt timed out → [`TIMEOUT_SENTINEL`], otherwise [`EXHAUSTED_SENTINEL`]

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{RagError, Result};

/// Returned when the last attempt timed out.
pub const TIMEOUT_SENTINEL: &str = "Error: the server did not respond in time";

/// Returned when every attempt failed for any other reason.
pub const EXHAUSTED_SENTINEL: &str = "Failed to get a response after several attempts";

/// Whether `text` is a degraded reply rather than generated content.
pub fn is_failure_sentinel(text: &str) -> bool {
    text == TIMEOUT_SENTINEL || text == EXHAUSTED_SENTINEL
}

/// Produces a completion for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> String;
}

/// Why a single generation attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base_delay * (1u32 << (attempt - 2).min(5))
    }
}

/// Run `attempt_fn` until it succeeds or the policy's attempts are used up.
///
/// `attempt_fn` receives the 1-based attempt number.
pub async fn run_with_retry<F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> String
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<String, AttemptError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_timed_out = false;

    for attempt in 1..=max_attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match attempt_fn(attempt).await {
            Ok(text) => return text,
            Err(AttemptError::Timeout) => {
                tracing::warn!(attempt, max_attempts, "generation request timed out");
                last_timed_out = true;
            }
            Err(e) => {
                tracing::warn!(attempt, max_attempts, error = %e, "generation request failed");
                last_timed_out = false;
            }
        }
    }

    if last_timed_out {
        TIMEOUT_SENTINEL.to_string()
    } else {
        EXHAUSTED_SENTINEL.to_string()
    }
}

/// Generator backed by `POST {base_url}/chat/completions`.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stop: Vec<String>,
    policy: RetryPolicy,
}

impl HttpGenerator {
    /// Build a client; the API key is read from the env var named by `api_key_env`.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                RagError::Configuration(format!(
                    "{} environment variable not set",
                    config.api_key_env
                ))
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            stop: config.stop.clone(),
            policy: RetryPolicy::from_config(config),
        })
    }

    async fn attempt(&self, prompt: &str) -> std::result::Result<String, AttemptError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "top_p": self.top_p,
            "max_tokens": self.max_tokens,
            "stop": self.stop,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttemptError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response.json().await.map_err(classify)?;
        parse_completion(&json)
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> String {
        run_with_retry(&self.policy, |_| self.attempt(prompt)).await
    }
}

fn classify(e: reqwest::Error) -> AttemptError {
    if e.is_timeout() {
        AttemptError::Timeout
    } else if e.is_decode() {
        AttemptError::InvalidResponse(e.to_string())
    } else {
        AttemptError::Transport(e.to_string())
    }
}

/// Extract `choices[0].message.content`, trimmed.
fn parse_completion(json: &serde_json::Value) -> std::result::Result<String, AttemptError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|content| content.trim().to_string())
        .ok_or_else(|| AttemptError::InvalidResponse("missing choices[0].message.content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn instant(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_always_timeout_uses_every_attempt() {
        let attempts = Cell::new(0);
        let reply = run_with_retry(&instant(5), |_| {
            attempts.set(attempts.get() + 1);
            async { Err(AttemptError::Timeout) }
        })
        .await;

        assert_eq!(reply, TIMEOUT_SENTINEL);
        assert_eq!(attempts.get(), 5);
        assert!(is_failure_sentinel(&reply));
    }

    #[tokio::test]
    async fn test_status_errors_exhaust_to_generic_sentinel() {
        let attempts = Cell::new(0);
        let reply = run_with_retry(&instant(3), |_| {
            attempts.set(attempts.get() + 1);
            async {
                Err(AttemptError::Status {
                    status: 503,
                    body: "busy".to_string(),
                })
            }
        })
        .await;

        assert_eq!(reply, EXHAUSTED_SENTINEL);
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test]
    async fn test_earlier_timeout_does_not_pick_timeout_sentinel() {
        let reply = run_with_retry(&instant(2), |attempt| async move {
            if attempt == 1 {
                Err(AttemptError::Timeout)
            } else {
                Err(AttemptError::Transport("reset".to_string()))
            }
        })
        .await;
        assert_eq!(reply, EXHAUSTED_SENTINEL);
    }

    #[tokio::test]
    async fn test_success_stops_retrying() {
        let attempts = Cell::new(0);
        let reply = run_with_retry(&instant(5), |attempt| {
            attempts.set(attempts.get() + 1);
            async move {
                if attempt < 3 {
                    Err(AttemptError::Transport("refused".to_string()))
                } else {
                    Ok("Step 1. Leave the building.".to_string())
                }
            }
        })
        .await;

        assert_eq!(reply, "Step 1. Leave the building.");
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(400));
        assert_eq!(policy.delay_before(10), Duration::from_millis(3200));
    }

    #[test]
    fn test_parse_completion() {
        let json = json!({"choices": [{"message": {"role": "assistant", "content": "  Go.\n"}}]});
        assert_eq!(parse_completion(&json).unwrap(), "Go.");
        assert!(parse_completion(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let config = GenerationConfig {
            api_key_env: "RAG_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HttpGenerator::new(&config),
            Err(RagError::Configuration(_))
        ));
    }
}
