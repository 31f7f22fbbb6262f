//! Retry / backoff / auth-refresh decision table.
//!
//! Maps HTTP statuses and network-level failures to one of retry-with-backoff,
//! retry-after-credential-refresh, or fail-fast. The coordinator is a pure
//! decision function; the driver owns the attempt loop and the sleeps.

use std::time::Duration;

use rand::Rng;

use crate::error::{GatewayError, TimeoutPhase};
use crate::normalize::{classify_provider_message, rewrite_provider_message, MessageClass};

/// Exponential backoff for rate-limited attempts: 500ms, 1s, 2s... capped.
const RATE_LIMIT_BASE: Duration = Duration::from_millis(500);
const RATE_LIMIT_CAP: Duration = Duration::from_secs(8);

/// Concurrency/burst rejections clear slower than window-based ones, so
/// their backoff is widened.
const CONTENTION_BASE: Duration = Duration::from_secs(2);
const CONTENTION_CAP: Duration = Duration::from_secs(30);

/// Gateway 5xx hiccups.
const SERVER_BASE: Duration = Duration::from_millis(500);
const SERVER_CAP: Duration = Duration::from_secs(8);

/// Resets, refusals and timeouts get a larger base than HTTP-level retries.
const NETWORK_BASE: Duration = Duration::from_secs(1);
const NETWORK_CAP: Duration = Duration::from_secs(15);

/// What went wrong with one attempt.
#[derive(Debug)]
pub enum RetrySignal {
    /// Non-2xx response, with the message extracted from its body and the
    /// parsed `retry-after` header if present.
    Status {
        code: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    /// The request or read failed below HTTP.
    Network(NetworkFailure),
}

#[derive(Debug)]
pub enum NetworkFailure {
    Transport(reqwest::Error),
    /// A driver-side deadline elapsed.
    Deadline(TimeoutPhase),
}

/// Next action for the driver.
#[derive(Debug)]
pub enum Decision {
    RetryAfter(Duration),
    /// Refresh the credential through the shared guard, then retry.
    RefreshAndRetry,
    Fail(GatewayError),
}

/// Per-call retry state, threaded through the driver's attempt loop.
#[derive(Debug)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub endpoint: String,
    pub credential: String,
    pub body: serde_json::Value,
}

impl RetryContext {
    pub fn new(endpoint: String, credential: String, body: serde_json::Value, max_attempts: u32) -> Self {
        RetryContext {
            attempt: 0,
            max_attempts,
            endpoint,
            credential,
            body,
        }
    }

    pub fn model(&self) -> &str {
        self.body
            .get("model")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
    }
}

/// Table-driven decision function. Stateless; `attempt` and the bound come
/// from the [`RetryContext`].
pub struct RetryCoordinator;

impl RetryCoordinator {
    pub fn decide(signal: RetrySignal, attempt: u32, max_attempts: u32) -> Decision {
        match signal {
            RetrySignal::Status {
                code,
                message,
                retry_after,
            } => Self::decide_status(code, &message, retry_after, attempt, max_attempts),
            RetrySignal::Network(failure) => {
                if attempt + 1 < max_attempts {
                    Decision::RetryAfter(backoff_delay(NETWORK_BASE, NETWORK_CAP, attempt))
                } else {
                    Decision::Fail(match failure {
                        NetworkFailure::Transport(err) => GatewayError::Http(err),
                        NetworkFailure::Deadline(phase) => GatewayError::Timeout { phase },
                    })
                }
            }
        }
    }

    fn decide_status(
        code: u16,
        message: &str,
        retry_after: Option<Duration>,
        attempt: u32,
        max_attempts: u32,
    ) -> Decision {
        match code {
            400 => {
                let (_, rewritten) = rewrite_provider_message(message);
                Decision::Fail(GatewayError::streaming(rewritten))
            }
            401 if attempt == 0 => Decision::RefreshAndRetry,
            401 => Decision::Fail(GatewayError::Authentication(
                "The credential was rejected after a refresh".to_string(),
            )),
            403 => Decision::Fail(GatewayError::Authentication(
                "Access to this model is forbidden for the current credential".to_string(),
            )),
            404 => Decision::Fail(GatewayError::streaming(
                "The requested model was not found on the gateway",
            )),
            413 => Decision::Fail(GatewayError::streaming(
                "The request payload is too large for the gateway",
            )),
            429 => {
                if attempt + 1 >= max_attempts {
                    let (_, rewritten) = rewrite_provider_message(message);
                    return Decision::Fail(GatewayError::RateLimit(rewritten));
                }
                let contended = is_contention_limit(message);
                let (base, cap) = if contended {
                    (CONTENTION_BASE, CONTENTION_CAP)
                } else {
                    (RATE_LIMIT_BASE, RATE_LIMIT_CAP)
                };
                let mut delay = backoff_delay(base, cap, attempt);
                // The server's retry-after is a floor, not the whole wait.
                if let Some(floor) = retry_after {
                    delay = delay.max(floor);
                }
                Decision::RetryAfter(delay)
            }
            500 => {
                let (_, rewritten) = rewrite_provider_message(message);
                Decision::Fail(GatewayError::streaming(rewritten))
            }
            502 | 503 | 504 if attempt + 1 < max_attempts => {
                Decision::RetryAfter(backoff_delay(SERVER_BASE, SERVER_CAP, attempt))
            }
            502 | 503 | 504 => Decision::Fail(GatewayError::streaming(format!(
                "The gateway is unavailable (HTTP {code})"
            ))),
            _ => Decision::Fail(GatewayError::streaming(format!(
                "Unexpected gateway response (HTTP {code}): {message}"
            ))),
        }
    }
}

/// True when a 429 body names a concurrency or burst sub-limit.
fn is_contention_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    (lower.contains("concurrency") || lower.contains("burst"))
        && classify_provider_message(message) == MessageClass::RateLimited
}

/// Exponential backoff with random jitter: `base * 2^attempt` capped at
/// `cap`, plus up to half of that again.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16)).min(cap);
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=exp / 2);
    exp + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16, message: &str) -> RetrySignal {
        RetrySignal::Status {
            code,
            message: message.to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn bad_request_fails_with_rewritten_message() {
        let decision = RetryCoordinator::decide(status(400, "Insufficient credits"), 0, 3);
        match decision {
            Decision::Fail(GatewayError::Streaming { message, .. }) => {
                assert!(message.contains("credits are exhausted"))
            }
            other => panic!("expected Fail(Streaming), got {other:?}"),
        }
    }

    #[test]
    fn unauthorized_first_attempt_refreshes() {
        assert!(matches!(
            RetryCoordinator::decide(status(401, "expired"), 0, 3),
            Decision::RefreshAndRetry
        ));
    }

    #[test]
    fn unauthorized_after_refresh_fails_auth() {
        assert!(matches!(
            RetryCoordinator::decide(status(401, "expired"), 1, 3),
            Decision::Fail(GatewayError::Authentication(_))
        ));
    }

    #[test]
    fn forbidden_fails_auth_immediately() {
        assert!(matches!(
            RetryCoordinator::decide(status(403, ""), 0, 3),
            Decision::Fail(GatewayError::Authentication(_))
        ));
    }

    #[test]
    fn not_found_names_the_model_problem() {
        match RetryCoordinator::decide(status(404, ""), 0, 3) {
            Decision::Fail(GatewayError::Streaming { message, .. }) => {
                assert!(message.contains("not found"))
            }
            other => panic!("expected Fail(Streaming), got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_retries_until_exhausted() {
        assert!(matches!(
            RetryCoordinator::decide(status(429, "Rate limit exceeded"), 0, 3),
            Decision::RetryAfter(_)
        ));
        assert!(matches!(
            RetryCoordinator::decide(status(429, "Rate limit exceeded"), 2, 3),
            Decision::Fail(GatewayError::RateLimit(_))
        ));
    }

    #[test]
    fn rate_limit_honors_retry_after_as_floor() {
        let signal = RetrySignal::Status {
            code: 429,
            message: "Rate limit exceeded".to_string(),
            retry_after: Some(Duration::from_secs(20)),
        };
        match RetryCoordinator::decide(signal, 0, 3) {
            Decision::RetryAfter(delay) => assert!(delay >= Duration::from_secs(20)),
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }

    #[test]
    fn contention_rate_limit_widens_backoff() {
        match RetryCoordinator::decide(status(429, "Concurrency limit exceeded"), 0, 3) {
            Decision::RetryAfter(delay) => assert!(delay >= CONTENTION_BASE),
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }

    #[test]
    fn server_errors_retry_then_fail() {
        for code in [502u16, 503, 504] {
            assert!(matches!(
                RetryCoordinator::decide(status(code, ""), 0, 3),
                Decision::RetryAfter(_)
            ));
            assert!(matches!(
                RetryCoordinator::decide(status(code, ""), 2, 3),
                Decision::Fail(GatewayError::Streaming { .. })
            ));
        }
    }

    #[test]
    fn internal_error_fails_fast() {
        assert!(matches!(
            RetryCoordinator::decide(status(500, "boom"), 0, 3),
            Decision::Fail(GatewayError::Streaming { .. })
        ));
    }

    #[test]
    fn deadline_exhaustion_is_a_timeout() {
        let signal = RetrySignal::Network(NetworkFailure::Deadline(TimeoutPhase::Request));
        assert!(matches!(
            RetryCoordinator::decide(signal, 2, 3),
            Decision::Fail(GatewayError::Timeout { phase: TimeoutPhase::Request })
        ));
    }

    #[test]
    fn network_failure_retries_with_larger_base() {
        let signal = RetrySignal::Network(NetworkFailure::Deadline(TimeoutPhase::Request));
        match RetryCoordinator::decide(signal, 0, 3) {
            Decision::RetryAfter(delay) => assert!(delay >= NETWORK_BASE),
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }

    #[test]
    fn unknown_status_fails_generic() {
        match RetryCoordinator::decide(status(418, "teapot"), 0, 3) {
            Decision::Fail(GatewayError::Streaming { message, .. }) => {
                assert!(message.contains("418"))
            }
            other => panic!("expected Fail(Streaming), got {other:?}"),
        }
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        for attempt in 0..8 {
            let delay = backoff_delay(RATE_LIMIT_BASE, RATE_LIMIT_CAP, attempt);
            let exp = RATE_LIMIT_BASE
                .saturating_mul(1u32 << attempt)
                .min(RATE_LIMIT_CAP);
            assert!(delay >= exp);
            assert!(delay <= exp + exp / 2);
        }
    }

    #[test]
    fn retry_context_reads_model_from_body() {
        let ctx = RetryContext::new(
            "http://gateway.local/v1/chat/completions".to_string(),
            "key".to_string(),
            serde_json::json!({"model":"gpt-4o-mini","messages":[]}),
            3,
        );
        assert_eq!(ctx.model(), "gpt-4o-mini");

        let ctx = RetryContext::new("u".into(), "k".into(), serde_json::json!({}), 3);
        assert_eq!(ctx.model(), "unknown");
    }
}
