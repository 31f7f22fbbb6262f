//! Public chunk types yielded by the stream driver.

use serde::Serialize;
use serde_json::Value;

/// Out-of-band status marker attached to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// First content or reasoning chunk of the logical call.
    FirstToken,
    /// A rate-limited attempt is being retried with backoff.
    RateLimitRetry,
    /// Carries [`TimingMetadata`] extracted from transport headers.
    TimingInfo,
}

/// Server-side timing breakdown, when the transport exposes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_time_ms: Option<u64>,
}

/// One normalized unit of stream output.
///
/// Exactly one chunk per logical call has `done = true`, and it is the last
/// chunk on the success path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ChunkStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingMetadata>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
}

impl StreamChunk {
    pub fn done() -> Self {
        StreamChunk {
            done: true,
            ..Default::default()
        }
    }

    pub fn status(status: ChunkStatus) -> Self {
        StreamChunk {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn timing(timing: TimingMetadata) -> Self {
        StreamChunk {
            status: Some(ChunkStatus::TimingInfo),
            timing: Some(timing),
            ..Default::default()
        }
    }

    pub fn tool_call(value: Value) -> Self {
        StreamChunk {
            tool_call: Some(value),
            ..Default::default()
        }
    }

    pub fn tool_result(value: Value) -> Self {
        StreamChunk {
            tool_result: Some(value),
            ..Default::default()
        }
    }

    /// True when the chunk carries text on either channel.
    pub fn has_text(&self) -> bool {
        self.content.is_some() || self.reasoning.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_chunk_serializes_minimal() {
        let json = serde_json::to_value(StreamChunk::done()).unwrap();
        assert_eq!(json, serde_json::json!({"done": true}));
    }

    #[test]
    fn content_chunk_skips_absent_fields() {
        let chunk = StreamChunk {
            content: Some("Hello".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json, serde_json::json!({"content": "Hello"}));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_value(StreamChunk::status(ChunkStatus::FirstToken)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "first_token"}));
    }

    #[test]
    fn timing_chunk_carries_status_and_metadata() {
        let chunk = StreamChunk::timing(TimingMetadata {
            backend_time_ms: Some(120),
            network_time_ms: None,
            total_time_ms: Some(150),
        });
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["status"], "timing_info");
        assert_eq!(json["timing"]["backend_time_ms"], 120);
        assert_eq!(json["timing"]["total_time_ms"], 150);
        assert!(json["timing"].get("network_time_ms").is_none());
    }
}
