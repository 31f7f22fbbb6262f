//! Client configuration.

use std::time::Duration;

/// Tunables for one [`GatewayClient`](crate::GatewayClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on requests per logical call, retries included.
    pub max_attempts: u32,
    /// Deadline for response headers to arrive after issuing a request.
    pub request_timeout: Duration,
    /// Allowed gap before the first fragment of an accepted response.
    pub first_fragment_timeout: Duration,
    /// Allowed gap between subsequent fragments. Longer than the first-
    /// fragment gap: a stream that started is given more slack than one
    /// that never did.
    pub idle_timeout: Duration,
    /// Base pause after a successful credential refresh, doubled per
    /// attempt, letting backend auth state propagate before the retry.
    pub refresh_pause: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_attempts: 3,
            request_timeout: Duration::from_secs(30),
            first_fragment_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
            refresh_pause: Duration::from_millis(300),
        }
    }
}

impl ClientConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_first_fragment_timeout(mut self, timeout: Duration) -> Self {
        self.first_fragment_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_refresh_pause(mut self, pause: Duration) -> Self {
        self.refresh_pause = pause;
        self
    }
}
