use thiserror::Error;

/// Stream phase a watchdog or deadline fired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// The request deadline elapsed before response headers arrived.
    Request,
    /// The response started but no fragment arrived within the allowed gap.
    FirstFragment,
    /// Data stopped flowing mid-stream.
    Idle,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::Request => write!(f, "waiting for the response to start"),
            TimeoutPhase::FirstFragment => write!(f, "waiting for the first fragment"),
            TimeoutPhase::Idle => write!(f, "waiting for the next fragment"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic streaming failure, optionally carrying the provider's
    /// machine-readable type and code.
    #[error("{message}")]
    Streaming {
        message: String,
        kind: Option<String>,
        code: Option<String>,
    },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Stream timed out {phase}")]
    Timeout { phase: TimeoutPhase },

    /// The transport completed without the upstream producing any content.
    #[error("Model '{model}' returned an empty response")]
    EmptyResponse { model: String },
}

impl GatewayError {
    /// Shorthand for a plain [`GatewayError::Streaming`] without type or code.
    pub fn streaming(message: impl Into<String>) -> Self {
        GatewayError::Streaming {
            message: message.into(),
            kind: None,
            code: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
