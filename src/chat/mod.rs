//! Conversation state for one session
//!
//! `ChatSession` decodes data channel payloads, keeps the streamed response
//! and the queue of sent-but-unanswered user messages, and writes every
//! change to a `StatusSink`.
//!
//! ```text
//! payload ──▶ decode_frame ──┬─ text_chunk / plain text ─▶ ResponseTracker
//!                            ├─ text_complete ───────────▶ ResponseTracker
//!                            ├─ error ───────────────────▶ response display
//!                            └─ tts_start / tts_complete ▶ audio status
//! ```
//!
//! User messages are matched to replies by order only: each tag change
//! consumes the oldest queued message.

mod response_buffer;

pub use response_buffer::{ResponseTracker, AI_LABEL, USER_LABEL};

use std::collections::VecDeque;
use std::sync::Arc;

use crate::session::{decode_frame, ConnectionError, InboundFrame, InboundMessage};
use crate::ui::{StatusSink, StatusStyle, Surface};

/// Default length of the speech preview on the audio status
pub const DEFAULT_PREVIEW_CHARS: usize = 50;

/// Outbound side of a data channel
pub trait TextChannel: Send + Sync + std::fmt::Debug {
    fn is_open(&self) -> bool;

    /// Send a raw text frame
    fn send(&self, text: String) -> Result<(), ConnectionError>;
}

/// Conversation state driven by inbound messages and user input
pub struct ChatSession {
    sink: Arc<dyn StatusSink>,
    response: ResponseTracker,
    pending_inputs: VecDeque<String>,
    preview_chars: usize,
}

impl ChatSession {
    pub fn new(sink: Arc<dyn StatusSink>, preview_chars: usize) -> Self {
        Self {
            sink,
            response: ResponseTracker::new(),
            pending_inputs: VecDeque::new(),
            preview_chars,
        }
    }

    /// Handle one data channel payload
    pub fn handle_frame(&mut self, payload: &str) {
        match decode_frame(payload) {
            InboundFrame::PlainText(text) => self.handle_text_chunk(&text, None),
            InboundFrame::Message(msg) => match msg {
                InboundMessage::TextChunk { content, tag } => {
                    self.handle_text_chunk(&content, tag.as_deref())
                }
                InboundMessage::TextComplete { content } => self.handle_text_complete(&content),
                InboundMessage::Error { error } => self.handle_error(&error),
                InboundMessage::TtsStart { text } => self.handle_tts_start(&text),
                InboundMessage::TtsComplete => self.handle_tts_complete(),
                InboundMessage::Unknown => {
                    log::debug!("Ignoring unknown message type");
                }
            },
        }
    }

    pub fn handle_text_chunk(&mut self, chunk: &str, tag: Option<&str>) {
        if self.response.is_new_response(tag) {
            let input = self.pending_inputs.pop_front();
            self.response.begin(tag, input.as_deref(), chunk);
            self.sink.begin_response();
            self.sink.set_status(
                Surface::Response,
                "Generating response...",
                StatusStyle::Generating,
            );
        } else {
            self.response.append(chunk);
        }
        self.sink.render_response(self.response.text());
    }

    pub fn handle_text_complete(&mut self, text: &str) {
        self.response.complete(text);
        self.sink.render_response(self.response.text());
        self.sink
            .set_status(Surface::Response, "Response complete", StatusStyle::Complete);
    }

    /// Show a server-reported error. The response buffer is left as is.
    pub fn handle_error(&mut self, message: &str) {
        log::warn!("{}", ConnectionError::ServerReportedError(message.to_string()));
        self.sink.render_response(message);
        self.sink
            .set_status(Surface::Response, "Error", StatusStyle::Error);
    }

    pub fn handle_tts_start(&mut self, text: &str) {
        let status = format!("Speaking: {}", preview(text, self.preview_chars));
        self.sink
            .set_status(Surface::Audio, &status, StatusStyle::Generating);
    }

    pub fn handle_tts_complete(&mut self) {
        self.sink
            .set_status(Surface::Audio, "Speech complete", StatusStyle::Complete);
    }

    /// Send a user message over `channel`.
    ///
    /// # Errors
    /// * `EmptyMessage` - text is empty after trimming
    /// * `ChannelNotReady` - no channel, or it is not open
    ///
    /// On error the user is alerted and nothing else changes.
    pub fn send_text(
        &mut self,
        text: &str,
        channel: Option<&dyn TextChannel>,
    ) -> Result<(), ConnectionError> {
        let text = text.trim();
        if text.is_empty() {
            self.sink.alert("Please enter a message");
            return Err(ConnectionError::EmptyMessage);
        }

        let channel = match channel {
            Some(c) if c.is_open() => c,
            _ => {
                self.sink.alert("Data channel is not open; connect first");
                return Err(ConnectionError::ChannelNotReady);
            }
        };

        if let Err(e) = channel.send(text.to_string()) {
            self.sink.alert(&e.to_string());
            return Err(e);
        }

        log::info!("Sent message ({} chars)", text.chars().count());
        self.pending_inputs.push_back(text.to_string());
        self.sink.clear_input();
        self.sink.set_status(
            Surface::Response,
            "Waiting for response...",
            StatusStyle::Waiting,
        );
        Ok(())
    }

    /// Messages sent but not yet matched to a response, oldest first
    pub fn pending_inputs(&self) -> impl Iterator<Item = &str> {
        self.pending_inputs.iter().map(String::as_str)
    }

    pub fn response_text(&self) -> &str {
        self.response.text()
    }

    pub fn current_tag(&self) -> Option<&str> {
        self.response.current_tag()
    }

    /// Drop all conversation state (new session)
    pub fn reset(&mut self) {
        self.response.reset();
        self.pending_inputs.clear();
    }
}

/// First `max_chars` characters of `text`, with "..." when cut
fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
