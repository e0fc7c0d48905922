//! Streamed response accumulation
//!
//! The server streams a reply as `text_chunk` messages sharing a tag, then
//! sends the authoritative text in `text_complete`. There is no id linking a
//! reply to the user message that caused it; a tag change is the only signal
//! that a new reply has started.
//!
//! # Aggregation Strategy
//!
//! - **Same tag**: chunk appended verbatim
//! - **New tag**: buffer restarted, optionally framed with the user's input
//! - **Complete**: replaces the buffer (authoritative from the server)

/// Label shown before the user's message in a framed response
pub const USER_LABEL: &str = "用户";

/// Label shown before the reply in a framed response
pub const AI_LABEL: &str = "AI";

/// Tracks the in-progress response and the tag it belongs to
#[derive(Debug, Clone, Default)]
pub struct ResponseTracker {
    buffer: String,
    /// Last seen tag; `None` until a tagged chunk arrives
    current_tag: Option<String>,
    chunk_count: u64,
    responses_started: u64,
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a chunk with `tag` starts a new response
    pub fn is_new_response(&self, tag: Option<&str>) -> bool {
        self.current_tag.as_deref() != tag
    }

    /// Start a new response with its first chunk.
    ///
    /// With `user_input`, the buffer is framed as
    /// `"用户: {input}\n\nAI: {chunk}"`; without it the chunk stands alone.
    pub fn begin(&mut self, tag: Option<&str>, user_input: Option<&str>, chunk: &str) -> &str {
        self.buffer = match user_input {
            Some(input) => format!("{}: {}\n\n{}: {}", USER_LABEL, input, AI_LABEL, chunk),
            None => chunk.to_string(),
        };
        self.current_tag = tag.map(str::to_string);
        self.chunk_count = 1;
        self.responses_started += 1;

        log::debug!(
            "ResponseTracker: response #{} started (tag {:?}, framed: {})",
            self.responses_started,
            self.current_tag,
            user_input.is_some()
        );
        &self.buffer
    }

    /// Append a continuation chunk
    pub fn append(&mut self, chunk: &str) -> &str {
        self.buffer.push_str(chunk);
        self.chunk_count += 1;

        if self.chunk_count % 50 == 0 {
            log::debug!(
                "ResponseTracker: {} chunks, {} chars accumulated",
                self.chunk_count,
                self.buffer.len()
            );
        }
        &self.buffer
    }

    /// Replace the buffer with the final text. The tag is kept.
    pub fn complete(&mut self, text: &str) -> &str {
        log::info!(
            "ResponseTracker: completed with {} chars (had {} chunks, {} partial chars)",
            text.len(),
            self.chunk_count,
            self.buffer.len()
        );
        self.buffer = text.to_string();
        &self.buffer
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn current_tag(&self) -> Option<&str> {
        self.current_tag.as_deref()
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn responses_started(&self) -> u64 {
        self.responses_started
    }

    /// Back to the initial state for a new conversation
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.current_tag = None;
        self.chunk_count = 0;
        self.responses_started = 0;
    }
}
