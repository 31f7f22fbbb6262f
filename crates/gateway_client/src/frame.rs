//! Incremental wire-frame parser.
//!
//! The gateway streams newline-delimited frames:
//! ```text
//! data: {"choices":[{"delta":{"content":"Hello"}}]}
//!
//! data: {"choices":[{"delta":{},"finish_reason":"stop"}]}
//!
//! data: [DONE]
//! ```
//! Network reads can split a frame at any byte offset, so the final,
//! possibly incomplete line of every buffer is held back and prepended to
//! the next one.

use log::debug;
use serde_json::Value;

const FRAME_PREFIX: &str = "data:";
const TERMINAL_SENTINEL: &str = "[DONE]";

/// Frames extracted from one buffer.
#[derive(Debug, Default)]
pub struct FeedResult {
    pub frames: Vec<Value>,
    /// The terminal sentinel line was seen; no further lines of the buffer
    /// were processed.
    pub terminal: bool,
}

/// Accumulates raw text fragments into discrete JSON frames.
#[derive(Debug, Default)]
pub struct FrameParser {
    remainder: String,
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser::default()
    }

    /// Text carried over from the previous [`feed`](Self::feed) because it
    /// did not end at a line boundary.
    pub fn remainder(&self) -> &str {
        &self.remainder
    }

    /// Feed a fragment of arbitrary length, returning every complete frame
    /// it closes. Lines without the `data:` prefix and payloads that fail to
    /// parse as JSON are dropped.
    pub fn feed(&mut self, input: &str) -> FeedResult {
        let mut buffer = std::mem::take(&mut self.remainder);
        buffer.push_str(input);

        let mut result = FeedResult::default();
        let mut rest = buffer.as_str();

        while let Some(pos) = rest.find('\n') {
            let line = &rest[..pos];
            rest = &rest[pos + 1..];

            let line = line.strip_suffix('\r').unwrap_or(line).trim();
            if line.is_empty() {
                continue;
            }

            let Some(payload) = line.strip_prefix(FRAME_PREFIX) else {
                debug!("dropping non-frame line: {line}");
                continue;
            };
            let payload = payload.trim();

            if payload == TERMINAL_SENTINEL {
                result.terminal = true;
                break;
            }

            match serde_json::from_str::<Value>(payload) {
                Ok(frame) => result.frames.push(frame),
                Err(err) => debug!("dropping unparseable frame: {err}: {payload}"),
            }
        }

        self.remainder = rest.to_string();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(frames: &[Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["choices"][0]["delta"]["content"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn parses_complete_frames() {
        let mut parser = FrameParser::new();
        let result = parser.feed(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\" World\"}}]}\n",
        );

        assert_eq!(contents(&result.frames), vec!["Hello", " World"]);
        assert!(!result.terminal);
        assert_eq!(parser.remainder(), "");
    }

    #[test]
    fn holds_back_incomplete_line() {
        let mut parser = FrameParser::new();
        let result = parser.feed("data: {\"choices\":[{\"delta\":{\"con");

        assert!(result.frames.is_empty());
        assert_eq!(parser.remainder(), "data: {\"choices\":[{\"delta\":{\"con");

        let result = parser.feed("tent\":\"Hello\"}}]}\n");
        assert_eq!(contents(&result.frames), vec!["Hello"]);
        assert_eq!(parser.remainder(), "");
    }

    #[test]
    fn split_at_any_offset_matches_whole_feed() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\
                     data: {\"choices\":[{\"delta\":{\"content\":\" World\"}}]}\n\
                     data: [DONE]\n";

        let mut whole = FrameParser::new();
        let expected = whole.feed(input);

        for offset in 0..=input.len() {
            if !input.is_char_boundary(offset) {
                continue;
            }
            let mut parser = FrameParser::new();
            let mut frames = Vec::new();
            let mut terminal = false;
            for piece in [&input[..offset], &input[offset..]] {
                let fed = parser.feed(piece);
                frames.extend(fed.frames);
                terminal |= fed.terminal;
            }
            assert_eq!(frames, expected.frames, "split at offset {offset}");
            assert!(terminal, "split at offset {offset}");
        }
    }

    #[test]
    fn terminal_sentinel_stops_processing() {
        let mut parser = FrameParser::new();
        let result = parser.feed(
            "data: [DONE]\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        );

        assert!(result.terminal);
        assert!(result.frames.is_empty());
    }

    #[test]
    fn drops_non_frame_lines() {
        let mut parser = FrameParser::new();
        let result = parser.feed(": keep-alive\nevent: message\ndata: {\"ok\":true}\n");

        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0]["ok"], true);
    }

    #[test]
    fn drops_unparseable_json() {
        let mut parser = FrameParser::new();
        let result = parser.feed("data: {not json}\ndata: {\"ok\":true}\n");

        assert_eq!(result.frames.len(), 1);
    }

    #[test]
    fn tolerates_crlf_and_prefix_without_space() {
        let mut parser = FrameParser::new();
        let result = parser.feed("data:{\"ok\":true}\r\ndata: [DONE]\r\n");

        assert_eq!(result.frames.len(), 1);
        assert!(result.terminal);
    }
}
