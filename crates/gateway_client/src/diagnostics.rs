//! Fire-and-forget diagnostic sink.
//!
//! The driver reports lifecycle events to an application-supplied sink.
//! Implementations must return quickly and must never fail; nothing the
//! sink does can affect the stream.

use std::time::Duration;

#[derive(Debug, Clone)]
pub enum DiagnosticEvent {
    AttemptStarted { attempt: u32, model: String },
    RetryScheduled { status: Option<u16>, delay: Duration },
    CredentialRefreshed,
    StreamCompleted { content_chars: usize },
    StreamFailed { error: String },
    StreamCancelled,
}

pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: DiagnosticEvent);
}

/// Default sink that drops every event.
pub struct NoopDiagnostics;

impl DiagnosticsSink for NoopDiagnostics {
    fn record(&self, _event: DiagnosticEvent) {}
}
