use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{NarratorPipe, RunRequest, RunResponse};
use super::NarrativeGenerator;
use crate::config::{GeneratorConfig, RequestConfig};
use crate::error::{GeneratorError, GeneratorResult};
use crate::prompts::NARRATOR_SYSTEM_PROMPT;

/// When and how often a failed generation is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Pause before the given retry (1-based); doubles every time.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(retry.saturating_sub(1)))
    }

    /// Whether another attempt may follow a transient failure on `attempt`
    /// (0-based).
    fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl From<&RequestConfig> for RetryPolicy {
    fn from(config: &RequestConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// Failures worth another attempt. A rejected request or an unreadable
/// answer will not change on retry.
fn is_transient(error: &GeneratorError) -> bool {
    match error {
        GeneratorError::Timeout { .. } | GeneratorError::Http(_) => true,
        GeneratorError::Api { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
        }
        GeneratorError::InvalidResponse { .. } | GeneratorError::Unavailable { .. } => false,
    }
}

/// Narrative generator backed by a hosted completion pipe.
///
/// Each prompt is one stateless pipe run. Transient failures are retried with
/// exponential backoff; once retries run out the last failure is reported as
/// [`GeneratorError::Unavailable`].
#[derive(Clone)]
pub struct PipeGeneratorClient {
    client: Client,
    base_url: String,
    api_key: String,
    pipe: String,
    timeout_ms: u64,
    retry: RetryPolicy,
}

impl PipeGeneratorClient {
    pub fn new(config: &GeneratorConfig, request_config: RequestConfig) -> GeneratorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            pipe: config.pipe.clone(),
            timeout_ms: request_config.timeout_ms,
            retry: RetryPolicy::from(&request_config),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    fn send_error(&self, error: reqwest::Error) -> GeneratorError {
        if error.is_timeout() {
            GeneratorError::Timeout {
                timeout_ms: self.timeout_ms,
            }
        } else {
            GeneratorError::Http(error)
        }
    }

    /// One pipe run, no retries.
    async fn run_once(&self, body: &RunRequest<'_>) -> GeneratorResult<String> {
        let response = self
            .post("/v1/pipes/run")
            .json(body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeneratorError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let run: RunResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })?;
        if !run.success {
            return Err(GeneratorError::InvalidResponse {
                message: "Pipe reported an unsuccessful run".to_string(),
            });
        }
        Ok(run.completion)
    }

    /// Upsert the narrator pipe. An existing pipe (409) counts as ready.
    pub async fn ensure_pipe(&self) -> GeneratorResult<()> {
        info!(pipe = %self.pipe, "Ensuring narrator pipe exists");

        let response = self
            .post("/v1/pipes")
            .json(&NarratorPipe::new(&self.pipe, NARRATOR_SYSTEM_PROMPT))
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            info!(pipe = %self.pipe, "Narrator pipe ready");
            return Ok(());
        }

        Err(GeneratorError::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl NarrativeGenerator for PipeGeneratorClient {
    async fn generate(&self, prompt: &str) -> GeneratorResult<String> {
        let body = RunRequest::prompt(&self.pipe, prompt);
        let mut attempt = 0;

        loop {
            let start = Instant::now();
            let error = match self.run_once(&body).await {
                Ok(completion) => {
                    debug!(
                        pipe = %self.pipe,
                        attempt,
                        chars = completion.len(),
                        latency_ms = start.elapsed().as_millis(),
                        "Generation succeeded"
                    );
                    return Ok(completion);
                }
                Err(e) => e,
            };

            if !is_transient(&error) {
                warn!(pipe = %self.pipe, error = %error, "Generation rejected");
                return Err(error);
            }
            if !self.retry.allows_retry(attempt) {
                return Err(GeneratorError::Unavailable {
                    message: error.to_string(),
                    retries: attempt + 1,
                });
            }

            attempt += 1;
            let delay = self.retry.backoff(attempt);
            warn!(
                pipe = %self.pipe,
                error = %error,
                retry = attempt,
                delay_ms = delay.as_millis(),
                latency_ms = start.elapsed().as_millis(),
                "Generation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_client_creation() {
        let config = GeneratorConfig {
            api_key: "test_key".to_string(),
            base_url: "https://api.langbase.com/".to_string(),
            pipe: "narrator".to_string(),
        };

        let client = PipeGeneratorClient::new(&config, RequestConfig::default()).unwrap();
        assert_eq!(client.base_url(), "https://api.langbase.com");
        assert_eq!(client.retry_policy(), RetryPolicy::from(&RequestConfig::default()));
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = policy(5);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn test_transient_failures() {
        assert!(is_transient(&GeneratorError::Timeout { timeout_ms: 10 }));
        for status in [429, 500, 503] {
            assert!(is_transient(&GeneratorError::Api {
                status,
                message: String::new()
            }));
        }
        for status in [400, 401, 404] {
            assert!(!is_transient(&GeneratorError::Api {
                status,
                message: String::new()
            }));
        }
        assert!(!is_transient(&GeneratorError::InvalidResponse {
            message: "bad".to_string()
        }));
    }

    #[test]
    fn test_retry_budget() {
        assert!(policy(2).allows_retry(1));
        assert!(!policy(2).allows_retry(2));
        assert!(!policy(0).allows_retry(0));
    }
}
