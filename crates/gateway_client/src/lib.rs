//! Streaming client for LLM gateway responses.
//!
//! Consumes a live `data:`-framed response stream and exposes it as a lazy
//! sequence of normalized [`StreamChunk`]s, independent of which upstream
//! provider format produced the wire data. Transient failures are retried
//! with backoff, expired credentials are refreshed just-in-time through a
//! shared single-flight guard, and a watchdog guards against streams that
//! never start or stall mid-way.

pub mod auth;
pub mod chunk;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod normalize;
pub mod retry;

pub use auth::CredentialRefresher;
pub use chunk::{ChunkStatus, StreamChunk, TimingMetadata};
pub use client::{ChunkStream, GatewayClient, StreamRequest};
pub use config::ClientConfig;
pub use diagnostics::{DiagnosticEvent, DiagnosticsSink, NoopDiagnostics};
pub use error::{GatewayError, Result, TimeoutPhase};
pub use frame::{FeedResult, FrameParser};
pub use normalize::{normalize, ParsedChunk, WireError};
