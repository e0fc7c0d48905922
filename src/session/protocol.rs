//! Wire types for the voice-chat server
//!
//! Two formats travel between client and server:
//!
//! 1. Signaling: `POST /offer` with `{"sdp": ..., "type": "offer"}`, answered
//!    by `{"sdp": ..., "type": "answer"}`.
//! 2. Data channel: the server sends JSON objects discriminated by `type`;
//!    older servers send bare text. The client sends raw text with no
//!    envelope.

use serde::{Deserialize, Serialize};

/// SDP type string for offers
pub const SDP_TYPE_OFFER: &str = "offer";

/// SDP type string for answers
pub const SDP_TYPE_ANSWER: &str = "answer";

/// Session description as exchanged over HTTP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescriptionPayload {
    /// Wrap a local SDP offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: SDP_TYPE_OFFER.to_string(),
        }
    }

    /// Check if this describes an answer (case-insensitive)
    pub fn is_answer(&self) -> bool {
        self.kind.eq_ignore_ascii_case(SDP_TYPE_ANSWER)
    }
}

// ============================================================================
// Server Messages (received over the data channel)
// ============================================================================

/// Messages received from the server over the data channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// A piece of the streamed response
    TextChunk {
        #[serde(default)]
        content: String,
        /// Content-grouping token; a change marks a new response
        #[serde(default)]
        tag: Option<String>,
    },

    /// Authoritative full text of the response
    TextComplete {
        #[serde(default)]
        content: String,
    },

    /// Server-side failure (LLM not configured, generation failed, ...)
    Error {
        #[serde(default)]
        error: String,
    },

    /// Speech synthesis started
    TtsStart {
        #[serde(default)]
        text: String,
    },

    /// Speech synthesis finished
    TtsComplete,

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

/// Result of decoding one data channel payload
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Payload was JSON
    Message(InboundMessage),
    /// Payload was not JSON; treated as a chunk without a tag
    PlainText(String),
}

/// Decode a data channel payload.
///
/// Anything that is not valid JSON falls back to `PlainText`. Valid JSON that
/// does not match a known message shape (a bare number, an array, a
/// `text_chunk` with a non-string tag) decodes as `Unknown` and is ignored
/// downstream.
pub fn decode_frame(payload: &str) -> InboundFrame {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return InboundFrame::PlainText(payload.to_string()),
    };

    match serde_json::from_value::<InboundMessage>(value) {
        Ok(msg) => InboundFrame::Message(msg),
        Err(e) => {
            log::debug!("Ignoring JSON payload with unexpected shape: {}", e);
            InboundFrame::Message(InboundMessage::Unknown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_payload_serialization() {
        let offer = SessionDescriptionPayload::offer("v=0\r\n");
        let json = serde_json::to_string(&offer).unwrap();

        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"sdp\":\"v=0\\r\\n\""));
    }

    #[test]
    fn test_answer_payload_deserialization() {
        let json = r#"{"sdp": "v=0", "type": "answer"}"#;
        let answer: SessionDescriptionPayload = serde_json::from_str(json).unwrap();

        assert_eq!(answer.sdp, "v=0");
        assert!(answer.is_answer());
        assert!(!SessionDescriptionPayload::offer("v=0").is_answer());
    }

    #[test]
    fn test_text_chunk_deserialization() {
        let frame = decode_frame(r#"{"type": "text_chunk", "content": "Hi", "tag": "msg_1"}"#);

        assert_eq!(
            frame,
            InboundFrame::Message(InboundMessage::TextChunk {
                content: "Hi".to_string(),
                tag: Some("msg_1".to_string()),
            })
        );
    }

    #[test]
    fn test_text_chunk_without_tag() {
        let frame = decode_frame(r#"{"type": "text_chunk", "content": "Hi"}"#);

        match frame {
            InboundFrame::Message(InboundMessage::TextChunk { tag, .. }) => assert!(tag.is_none()),
            other => panic!("Expected TextChunk, got {:?}", other),
        }
    }

    #[test]
    fn test_error_and_tts_messages() {
        assert_eq!(
            decode_frame(r#"{"type": "error", "error": "LLM unavailable"}"#),
            InboundFrame::Message(InboundMessage::Error {
                error: "LLM unavailable".to_string()
            })
        );
        assert_eq!(
            decode_frame(r#"{"type": "tts_start", "text": "Generating speech..."}"#),
            InboundFrame::Message(InboundMessage::TtsStart {
                text: "Generating speech...".to_string()
            })
        );
        assert_eq!(
            decode_frame(r#"{"type": "tts_complete"}"#),
            InboundFrame::Message(InboundMessage::TtsComplete)
        );
    }

    #[test]
    fn test_non_json_falls_back_to_plain_text() {
        assert_eq!(
            decode_frame("hello there"),
            InboundFrame::PlainText("hello there".to_string())
        );
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        assert_eq!(
            decode_frame(r#"{"type": "some.future.type", "data": 1}"#),
            InboundFrame::Message(InboundMessage::Unknown)
        );
    }

    #[test]
    fn test_json_without_known_shape_is_unknown() {
        assert_eq!(decode_frame("42"), InboundFrame::Message(InboundMessage::Unknown));
        assert_eq!(
            decode_frame(r#"{"content": "no type"}"#),
            InboundFrame::Message(InboundMessage::Unknown)
        );
        assert_eq!(
            decode_frame(r#"{"type": "text_chunk", "content": "x", "tag": 7}"#),
            InboundFrame::Message(InboundMessage::Unknown)
        );
    }
}
