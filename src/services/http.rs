//! HTTP clients for the generation, apply, and review services.
//!
//! Generation and apply respond with line-delimited JSON event streams that
//! are consumed incrementally; review is a plain JSON POST. Every call runs
//! under its own timeout and the run's cancellation token.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::errors::ServiceError;

use super::{
    ApplyEvent, ApplyRequest, ApplyResults, ApplyService, GenerationEvent, GenerationRequest,
    GenerationService, ReviewReport, ReviewRequest, ReviewService,
};

/// Endpoint and timeout configuration for the HTTP clients.
#[derive(Debug, Clone)]
pub struct HttpServiceConfig {
    pub base_url: String,
    pub generate_timeout: Duration,
    pub apply_timeout: Duration,
    pub review_timeout: Duration,
}

impl Default for HttpServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            generate_timeout: Duration::from_secs(300),
            apply_timeout: Duration::from_secs(120),
            review_timeout: Duration::from_secs(90),
        }
    }
}

/// One reqwest client shared across the three service roles.
#[derive(Debug, Clone)]
pub struct HttpServiceClient {
    client: reqwest::Client,
    config: HttpServiceConfig,
}

impl HttpServiceClient {
    pub fn new(config: HttpServiceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_stream(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> Result<reqwest::Response, ServiceError> {
        let endpoint = self.endpoint(path);
        self.client
            .post(&endpoint)
            .json(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| ServiceError::Request { endpoint, source })
    }
}

/// Drive a bounded, cancellable future; timeouts and cancellation map to
/// their service errors.
async fn bounded<T>(
    fut: impl Future<Output = Result<T, ServiceError>>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T, ServiceError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        outcome = tokio::time::timeout(timeout, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout {
                seconds: timeout.as_secs(),
            }),
        },
    }
}

/// Split a byte stream into lines and hand each non-empty line to `on_line`
/// until it yields a final value.
async fn consume_lines<T>(
    response: reqwest::Response,
    endpoint: String,
    mut on_line: impl FnMut(&str) -> Result<Option<T>, ServiceError>,
) -> Result<T, ServiceError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| ServiceError::Request {
            endpoint: endpoint.clone(),
            source,
        })?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);
            if line.is_empty() {
                continue;
            }
            if let Some(done) = on_line(&line)? {
                return Ok(done);
            }
        }
    }

    let trailing = buffer.trim();
    if !trailing.is_empty()
        && let Some(done) = on_line(trailing)?
    {
        return Ok(done);
    }
    Err(ServiceError::Incomplete)
}

#[async_trait]
impl GenerationService for HttpServiceClient {
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ServiceError> {
        let endpoint = self.endpoint("generate");
        let fut = async {
            let response = self.post_stream("generate", &request).await?;
            let mut accumulated = String::new();
            consume_lines(response, endpoint, |line| {
                let event: GenerationEvent = serde_json::from_str(line)
                    .map_err(|e| ServiceError::Payload(format!("{}: {}", e, line)))?;
                match event {
                    GenerationEvent::Stream { text } => {
                        accumulated.push_str(&text);
                        Ok(None)
                    }
                    GenerationEvent::Complete { generated_code } => {
                        // The completion payload wins over accumulated chunks
                        // when present; some backends send only one of the two.
                        if generated_code.is_empty() {
                            Ok(Some(std::mem::take(&mut accumulated)))
                        } else {
                            Ok(Some(generated_code))
                        }
                    }
                    GenerationEvent::Error { error } => Err(ServiceError::Stream(error)),
                    GenerationEvent::Status { .. }
                    | GenerationEvent::Thinking { .. }
                    | GenerationEvent::ThinkingComplete => Ok(None),
                }
            })
            .await
        };
        bounded(fut, self.config.generate_timeout, cancel).await
    }
}

#[async_trait]
impl ApplyService for HttpServiceClient {
    async fn apply(
        &self,
        request: ApplyRequest,
        cancel: &CancellationToken,
    ) -> Result<ApplyResults, ServiceError> {
        let endpoint = self.endpoint("apply");
        let fut = async {
            let response = self.post_stream("apply", &request).await?;
            consume_lines(response, endpoint, |line| {
                let event: ApplyEvent = serde_json::from_str(line)
                    .map_err(|e| ServiceError::Payload(format!("{}: {}", e, line)))?;
                match event {
                    ApplyEvent::Complete { results } => Ok(Some(results)),
                    ApplyEvent::Error { error } => Err(ServiceError::Stream(error)),
                    ApplyEvent::Status { .. } | ApplyEvent::Stream { .. } => Ok(None),
                }
            })
            .await
        };
        bounded(fut, self.config.apply_timeout, cancel).await
    }
}

#[async_trait]
impl ReviewService for HttpServiceClient {
    async fn review(
        &self,
        request: ReviewRequest,
        cancel: &CancellationToken,
    ) -> Result<ReviewReport, ServiceError> {
        let endpoint = self.endpoint("review");
        let fut = async {
            let response = self
                .client
                .post(&endpoint)
                .json(&request)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|source| ServiceError::Request {
                    endpoint: endpoint.clone(),
                    source,
                })?;
            response
                .json::<ReviewReport>()
                .await
                .map_err(|e| ServiceError::Payload(e.to_string()))
        };
        bounded(fut, self.config.review_timeout, cancel).await
    }
}
