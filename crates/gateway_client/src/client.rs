//! Top-level stream orchestration.
//!
//! One logical call walks `Requesting -> {ErrorHandling -> Requesting |
//! Streaming} -> Draining` as an iterative attempt loop. Bytes flow through
//! [`FrameParser`] and [`normalize`] into public [`StreamChunk`]s; failures
//! flow through [`RetryCoordinator`]. The returned stream is lazy: the
//! consumer controls pacing, and dropping it releases the connection.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::auth::{CredentialRefresher, RefreshGuard};
use crate::chunk::{ChunkStatus, StreamChunk, TimingMetadata};
use crate::config::ClientConfig;
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink, NoopDiagnostics};
use crate::error::{GatewayError, Result, TimeoutPhase};
use crate::frame::FrameParser;
use crate::normalize::normalize;
use crate::retry::{Decision, NetworkFailure, RetryContext, RetryCoordinator, RetrySignal};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// One logical streaming call.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub endpoint: String,
    pub credential: String,
    /// JSON body; `stream: true` is forced before sending.
    pub body: Value,
}

impl StreamRequest {
    pub fn new(
        endpoint: impl Into<String>,
        credential: impl Into<String>,
        body: Value,
    ) -> Self {
        StreamRequest {
            endpoint: endpoint.into(),
            credential: credential.into(),
            body,
        }
    }
}

/// Client for incrementally-delivered gateway responses.
pub struct GatewayClient {
    http: Client,
    config: ClientConfig,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    refresh_guard: Arc<RefreshGuard>,
}

impl GatewayClient {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        GatewayClient {
            http: Client::new(),
            config,
            refresher: None,
            diagnostics: Arc::new(NoopDiagnostics),
            refresh_guard: Arc::new(RefreshGuard::new()),
        }
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Stream the response as normalized chunks.
    pub fn stream(&self, request: StreamRequest) -> ChunkStream {
        self.stream_with_cancellation(request, CancellationToken::new())
    }

    /// Like [`stream`](Self::stream), with caller-initiated cancellation.
    /// Cancelling ends the stream cleanly: no error is surfaced, and chunks
    /// already yielded stay with the caller.
    pub fn stream_with_cancellation(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let http = self.http.clone();
        let config = self.config.clone();
        let refresher = self.refresher.clone();
        let diagnostics = self.diagnostics.clone();
        let refresh_guard = self.refresh_guard.clone();

        Box::pin(stream! {
            let StreamRequest { endpoint, credential, mut body } = request;
            if let Some(fields) = body.as_object_mut() {
                fields.insert("stream".to_string(), json!(true));
            }
            let mut ctx = RetryContext::new(endpoint, credential, body, config.max_attempts);

            // Per-logical-call flags, surviving retries.
            let mut first_token_sent = false;
            let mut timing_sent = false;
            let mut produced_output = false;
            let mut content_chars = 0usize;

            'attempts: loop {
                diagnostics.record(DiagnosticEvent::AttemptStarted {
                    attempt: ctx.attempt,
                    model: ctx.model().to_string(),
                });
                debug!(
                    "requesting {} (model {}, attempt {}/{})",
                    ctx.endpoint,
                    ctx.model(),
                    ctx.attempt + 1,
                    ctx.max_attempts
                );

                let send = http
                    .post(&ctx.endpoint)
                    .header("Accept", "text/event-stream")
                    .header("Authorization", format!("Bearer {}", ctx.credential))
                    .json(&ctx.body)
                    .send();

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("stream cancelled before the response started");
                        diagnostics.record(DiagnosticEvent::StreamCancelled);
                        return;
                    }
                    sent = tokio::time::timeout(config.request_timeout, send) => sent,
                };

                let signal = match outcome {
                    Err(_elapsed) => {
                        RetrySignal::Network(NetworkFailure::Deadline(TimeoutPhase::Request))
                    }
                    Ok(Err(err)) => RetrySignal::Network(NetworkFailure::Transport(err)),
                    Ok(Ok(response)) if !response.status().is_success() => {
                        let code = response.status().as_u16();
                        let retry_after = parse_retry_after(response.headers());
                        let message = read_error_message(response).await;
                        warn!("gateway rejected the request: HTTP {code}: {message}");
                        RetrySignal::Status { code, message, retry_after }
                    }
                    Ok(Ok(response)) => {
                        // ---- Streaming ----
                        if !timing_sent {
                            if let Some(timing) = timing_from_headers(response.headers()) {
                                timing_sent = true;
                                yield Ok(StreamChunk::timing(timing));
                            }
                        }

                        let mut fragments = Box::pin(response.bytes_stream());
                        let mut parser = FrameParser::new();
                        let mut saw_fragment = false;
                        let mut done_seen = false;
                        let mut mid_stream_failure: Option<NetworkFailure> = None;

                        'reading: loop {
                            // The watchdog resets on every fragment; a stream
                            // that never started gets less slack than one
                            // that stalled.
                            let gap = if saw_fragment {
                                config.idle_timeout
                            } else {
                                config.first_fragment_timeout
                            };

                            let next = tokio::select! {
                                _ = cancel.cancelled() => {
                                    info!("stream cancelled by the caller, partial output preserved");
                                    diagnostics.record(DiagnosticEvent::StreamCancelled);
                                    return;
                                }
                                read = tokio::time::timeout(gap, fragments.next()) => read,
                            };

                            let bytes = match next {
                                Err(_elapsed) => {
                                    let phase = if saw_fragment {
                                        TimeoutPhase::Idle
                                    } else {
                                        TimeoutPhase::FirstFragment
                                    };
                                    let err = GatewayError::Timeout { phase };
                                    diagnostics.record(DiagnosticEvent::StreamFailed {
                                        error: err.to_string(),
                                    });
                                    yield Err(err);
                                    return;
                                }
                                Ok(None) => break 'reading,
                                Ok(Some(Err(err))) => {
                                    if produced_output {
                                        // A retry here would duplicate
                                        // already-delivered output.
                                        let err = GatewayError::Http(err);
                                        diagnostics.record(DiagnosticEvent::StreamFailed {
                                            error: err.to_string(),
                                        });
                                        yield Err(err);
                                        return;
                                    }
                                    mid_stream_failure = Some(NetworkFailure::Transport(err));
                                    break 'reading;
                                }
                                Ok(Some(Ok(bytes))) => bytes,
                            };

                            saw_fragment = true;
                            let text = String::from_utf8_lossy(&bytes);
                            let fed = parser.feed(&text);

                            for frame in &fed.frames {
                                let Some(parsed) = normalize(frame) else { continue };

                                if let Some(error) = parsed.error {
                                    let err = error.into_gateway_error();
                                    diagnostics.record(DiagnosticEvent::StreamFailed {
                                        error: err.to_string(),
                                    });
                                    yield Err(err);
                                    return;
                                }
                                if let Some(tool_call) = parsed.tool_call {
                                    produced_output = true;
                                    yield Ok(StreamChunk::tool_call(tool_call));
                                }
                                if let Some(tool_result) = parsed.tool_result {
                                    produced_output = true;
                                    yield Ok(StreamChunk::tool_result(tool_result));
                                }
                                if parsed.content.is_some() || parsed.reasoning.is_some() {
                                    produced_output = true;
                                    content_chars += parsed.content.as_deref().map_or(0, str::len)
                                        + parsed.reasoning.as_deref().map_or(0, str::len);
                                    let mut chunk = StreamChunk {
                                        content: parsed.content,
                                        reasoning: parsed.reasoning,
                                        ..Default::default()
                                    };
                                    if !first_token_sent {
                                        first_token_sent = true;
                                        chunk.status = Some(ChunkStatus::FirstToken);
                                    }
                                    yield Ok(chunk);
                                }
                                // Upstream terminal signals are recorded, not
                                // forwarded; the single done chunk is emitted
                                // at drain so duplicates collapse.
                                done_seen |= parsed.done;
                            }

                            if done_seen || fed.terminal {
                                break 'reading;
                            }
                        }

                        if let Some(failure) = mid_stream_failure {
                            let signal = RetrySignal::Network(failure);
                            match RetryCoordinator::decide(signal, ctx.attempt, ctx.max_attempts) {
                                Decision::RetryAfter(delay) => {
                                    diagnostics.record(DiagnosticEvent::RetryScheduled {
                                        status: None,
                                        delay,
                                    });
                                    tokio::select! {
                                        _ = cancel.cancelled() => {
                                            diagnostics.record(DiagnosticEvent::StreamCancelled);
                                            return;
                                        }
                                        _ = tokio::time::sleep(delay) => {}
                                    }
                                    ctx.attempt += 1;
                                    continue 'attempts;
                                }
                                Decision::Fail(err) => {
                                    diagnostics.record(DiagnosticEvent::StreamFailed {
                                        error: err.to_string(),
                                    });
                                    yield Err(err);
                                    return;
                                }
                                Decision::RefreshAndRetry => {
                                    // Network signals never ask for a refresh.
                                    let err = GatewayError::streaming("The stream was interrupted");
                                    diagnostics.record(DiagnosticEvent::StreamFailed {
                                        error: err.to_string(),
                                    });
                                    yield Err(err);
                                    return;
                                }
                            }
                        }

                        // ---- Draining ----
                        if !produced_output {
                            let err = GatewayError::EmptyResponse {
                                model: ctx.model().to_string(),
                            };
                            diagnostics.record(DiagnosticEvent::StreamFailed {
                                error: err.to_string(),
                            });
                            yield Err(err);
                            return;
                        }
                        info!("stream completed ({content_chars} chars of text)");
                        diagnostics.record(DiagnosticEvent::StreamCompleted { content_chars });
                        yield Ok(StreamChunk::done());
                        return;
                    }
                };

                // ---- ErrorHandling ----
                let rate_limited = matches!(signal, RetrySignal::Status { code: 429, .. });
                let status = match &signal {
                    RetrySignal::Status { code, .. } => Some(*code),
                    RetrySignal::Network(_) => None,
                };
                match RetryCoordinator::decide(signal, ctx.attempt, ctx.max_attempts) {
                    Decision::RetryAfter(delay) => {
                        if rate_limited {
                            yield Ok(StreamChunk::status(ChunkStatus::RateLimitRetry));
                        }
                        info!("retrying in {delay:?} (attempt {})", ctx.attempt + 1);
                        diagnostics.record(DiagnosticEvent::RetryScheduled { status, delay });
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                diagnostics.record(DiagnosticEvent::StreamCancelled);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        ctx.attempt += 1;
                        continue 'attempts;
                    }
                    Decision::RefreshAndRetry => {
                        let Some(refresher) = refresher.clone() else {
                            let err = GatewayError::Authentication(
                                "The credential expired and no refresher is configured".to_string(),
                            );
                            diagnostics.record(DiagnosticEvent::StreamFailed {
                                error: err.to_string(),
                            });
                            yield Err(err);
                            return;
                        };
                        match refresh_guard.refresh(refresher).await {
                            Ok(credential) => {
                                info!("credential refreshed, retrying the request");
                                diagnostics.record(DiagnosticEvent::CredentialRefreshed);
                                ctx.credential = credential;
                                // Brief pause so backend auth state catches
                                // up with the freshly-issued credential.
                                let pause = config
                                    .refresh_pause
                                    .saturating_mul(1u32 << ctx.attempt.min(8));
                                tokio::time::sleep(pause).await;
                                ctx.attempt += 1;
                                continue 'attempts;
                            }
                            Err(message) => {
                                let err = GatewayError::Authentication(message);
                                diagnostics.record(DiagnosticEvent::StreamFailed {
                                    error: err.to_string(),
                                });
                                yield Err(err);
                                return;
                            }
                        }
                    }
                    Decision::Fail(err) => {
                        diagnostics.record(DiagnosticEvent::StreamFailed {
                            error: err.to_string(),
                        });
                        yield Err(err);
                        return;
                    }
                }
            }
        })
    }
}

impl Default for GatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull a human-readable message out of a non-2xx body. The gateway wraps
/// messages as `{"error":{"message":...}}` or `{"detail":...}`.
async fn read_error_message(response: Response) -> String {
    let fallback = format!("HTTP {}", response.status().as_u16());
    let text = match response.text().await {
        Ok(text) => text,
        Err(_) => return fallback,
    };
    if text.trim().is_empty() {
        return fallback;
    }

    if let Ok(body) = serde_json::from_str::<Value>(&text) {
        let message = body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .or_else(|| body.get("error").and_then(Value::as_str))
            .or_else(|| body.get("detail").and_then(Value::as_str))
            .or_else(|| body.get("message").and_then(Value::as_str));
        if let Some(message) = message {
            return message.to_string();
        }
    }
    text
}

/// `retry-after` in seconds; HTTP-date forms are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Server-side timing breakdown, when the transport exposes it.
fn timing_from_headers(headers: &HeaderMap) -> Option<TimingMetadata> {
    let read = |name: &str| {
        headers
            .get(name)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
    };
    let timing = TimingMetadata {
        backend_time_ms: read("x-backend-time-ms"),
        network_time_ms: read("x-network-time-ms"),
        total_time_ms: read("x-total-time-ms"),
    };
    if timing.backend_time_ms.is_none()
        && timing.network_time_ms.is_none()
        && timing.total_time_ms.is_none()
    {
        None
    } else {
        Some(timing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn timing_requires_at_least_one_header() {
        assert!(timing_from_headers(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert("x-backend-time-ms", "120".parse().unwrap());
        headers.insert("x-total-time-ms", "150".parse().unwrap());
        let timing = timing_from_headers(&headers).expect("timing");
        assert_eq!(timing.backend_time_ms, Some(120));
        assert_eq!(timing.network_time_ms, None);
        assert_eq!(timing.total_time_ms, Some(150));
    }

    #[test]
    fn stream_request_leaves_caller_body_untouched() {
        let request = StreamRequest::new(
            "http://gateway.local/v1/chat/completions",
            "sk-test",
            serde_json::json!({"model":"gpt-4o-mini","messages":[]}),
        );
        assert!(request.body.get("stream").is_none());
    }
}
