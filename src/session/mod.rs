//! WebRTC session with the voice-chat server
//!
//! A session owns one peer connection: a recv-only audio transceiver for the
//! synthesized speech and a `chat` data channel for text in both directions.
//!
//! # Connection Flow
//!
//! ```text
//! microphone probe ──▶ RTCPeerConnection ──▶ recvonly audio + "chat" channel
//!                                                        │
//!                                                        ▼
//!                          POST /offer {sdp, type} ──▶ answer applied
//!                                                        │
//!                                                        ▼
//!                                         SessionEvent stream (mpsc)
//! ```
//!
//! There is no reconnection: a failed session is closed and a new one must be
//! started explicitly.

mod client;
pub mod protocol;
pub mod signaling;

pub use client::{PeerState, RtcSession, RtcTextChannel, SessionEvent};
pub use protocol::{decode_frame, InboundFrame, InboundMessage, SessionDescriptionPayload};
pub use signaling::{exchange_offer, offer_url};

/// Errors surfaced by the session client.
///
/// Only `MediaPermissionDenied`, `SignalingFailure` and `NegotiationFailure`
/// end a connection attempt; the rest are reported as status updates.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Microphone access was refused or no input device exists
    MediaPermissionDenied(String),
    /// The offer/answer HTTP exchange failed
    SignalingFailure(String),
    /// The WebRTC stack rejected a step of the negotiation
    NegotiationFailure(String),
    /// Received audio could not be played
    PlaybackFailure(String),
    /// Data channel missing or not open
    ChannelNotReady,
    /// The server sent an `error` message over the data channel
    ServerReportedError(String),
    /// User tried to send an empty or whitespace-only message
    EmptyMessage,
}

impl ConnectionError {
    /// Whether this error ends the connection attempt
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::MediaPermissionDenied(_)
                | ConnectionError::SignalingFailure(_)
                | ConnectionError::NegotiationFailure(_)
        )
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::MediaPermissionDenied(e) => {
                write!(f, "Microphone permission denied: {}", e)
            }
            ConnectionError::SignalingFailure(e) => write!(f, "Signaling failed: {}", e),
            ConnectionError::NegotiationFailure(e) => {
                write!(f, "WebRTC negotiation failed: {}", e)
            }
            ConnectionError::PlaybackFailure(e) => write!(f, "Audio playback failed: {}", e),
            ConnectionError::ChannelNotReady => write!(f, "Data channel is not open"),
            ConnectionError::ServerReportedError(e) => write!(f, "Server error: {}", e),
            ConnectionError::EmptyMessage => write!(f, "Message is empty"),
        }
    }
}

impl std::error::Error for ConnectionError {}
