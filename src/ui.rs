//! Status sink
//!
//! The chat and connection logic never touch a display directly. They write
//! status text and a style into named surfaces through `StatusSink`; the
//! shipped binary uses `ConsoleSink`, tests use a recording sink.

use std::io::Write;
use std::sync::Mutex;

/// Id of the response text display
pub const RESPONSE_TEXT_ID: &str = "responseText";

/// Id of the message input field
pub const TEXT_INPUT_ID: &str = "textInput";

/// Status indicators the client updates independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Connection,
    Response,
    Audio,
}

impl Surface {
    pub fn element_id(&self) -> &'static str {
        match self {
            Surface::Connection => "connectionStatus",
            Surface::Response => "responseStatus",
            Surface::Audio => "audioStatus",
        }
    }
}

/// Visual style of a status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStyle {
    Info,
    Connecting,
    Connected,
    Generating,
    Waiting,
    Complete,
    Warning,
    Error,
}

impl StatusStyle {
    pub fn class_name(&self) -> &'static str {
        match self {
            StatusStyle::Info => "info",
            StatusStyle::Connecting => "connecting",
            StatusStyle::Connected => "connected",
            StatusStyle::Generating => "generating",
            StatusStyle::Waiting => "waiting",
            StatusStyle::Complete => "complete",
            StatusStyle::Warning => "warning",
            StatusStyle::Error => "error",
        }
    }
}

/// Where status text and the response display are written
pub trait StatusSink: Send + Sync {
    fn set_status(&self, surface: Surface, text: &str, style: StatusStyle);

    /// A new response replaces whatever the display holds
    fn begin_response(&self) {}

    /// Show `text` as the whole response display
    fn render_response(&self, text: &str);

    fn clear_input(&self);

    /// User-facing notice that needs no state change
    fn alert(&self, message: &str);
}

/// Terminal rendering of the status surfaces.
///
/// Streaming responses are printed incrementally: when the new render extends
/// the previous one only the suffix is written, otherwise the whole text is
/// reprinted on a fresh line. A new response always starts on a fresh line.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    last_render: Mutex<String>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn timestamp() -> String {
        chrono::Local::now().format("%H:%M:%S").to_string()
    }

    /// End an in-progress response line before printing something else
    fn break_line(&self) {
        if let Ok(mut last) = self.last_render.lock() {
            if !last.is_empty() {
                println!();
                last.clear();
            }
        }
    }
}

impl StatusSink for ConsoleSink {
    fn set_status(&self, surface: Surface, text: &str, style: StatusStyle) {
        // Streaming status updates would interleave with the response text
        if surface == Surface::Response && style == StatusStyle::Generating {
            log::debug!("{}: {}", surface.element_id(), text);
            return;
        }
        self.break_line();
        println!(
            "[{}] {} ({}): {}",
            Self::timestamp(),
            surface.element_id(),
            style.class_name(),
            text
        );
    }

    fn begin_response(&self) {
        log::debug!("{} reset", RESPONSE_TEXT_ID);
        self.break_line();
    }

    fn render_response(&self, text: &str) {
        let Ok(mut last) = self.last_render.lock() else {
            return;
        };

        let mut stdout = std::io::stdout().lock();
        let result = match text.strip_prefix(last.as_str()) {
            Some(suffix) if !last.is_empty() => write!(stdout, "{}", suffix),
            _ => {
                if !last.is_empty() {
                    let _ = writeln!(stdout);
                }
                write!(stdout, "{}", text)
            }
        };
        if result.and_then(|_| stdout.flush()).is_err() {
            log::warn!("Failed to write response to stdout");
        }

        last.clear();
        last.push_str(text);
    }

    fn clear_input(&self) {
        log::debug!("{} cleared", TEXT_INPUT_ID);
    }

    fn alert(&self, message: &str) {
        self.break_line();
        println!("[{}] ! {}", Self::timestamp(), message);
    }
}
