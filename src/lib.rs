pub mod audio;
pub mod chat;
pub mod effects;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod ui;

use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use chat::{ChatSession, TextChannel};
use effects::{EffectRunner, RtcEffectRunner};
use state_machine::{reduce, Effect, Event, State};
use ui::{ConsoleSink, StatusSink, StatusStyle, Surface};

/// Connection status as rendered on the connection surface.
/// Uses tagged union format: { "status": "idle" } or { "status": "connected", "channelOpen": true }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ConnectionUi {
    Idle,
    Connecting,
    Connected {
        #[serde(rename = "channelOpen")]
        channel_open: bool,
    },
    Closed,
    Failed {
        message: String,
    },
}

impl ConnectionUi {
    fn status_text(&self) -> (String, StatusStyle) {
        match self {
            ConnectionUi::Idle => ("Not connected".to_string(), StatusStyle::Info),
            ConnectionUi::Connecting => ("Connecting...".to_string(), StatusStyle::Connecting),
            ConnectionUi::Connected { channel_open: true } => {
                ("Connected".to_string(), StatusStyle::Connected)
            }
            ConnectionUi::Connected {
                channel_open: false,
            } => (
                "Connected, waiting for data channel...".to_string(),
                StatusStyle::Connecting,
            ),
            ConnectionUi::Closed => ("Disconnected".to_string(), StatusStyle::Info),
            ConnectionUi::Failed { message } => {
                (format!("Connection failed: {}", message), StatusStyle::Error)
            }
        }
    }
}

/// Convert internal State to the connection status
pub fn state_to_ui(state: &State) -> ConnectionUi {
    match state {
        State::Idle => ConnectionUi::Idle,
        State::Connecting { .. } => ConnectionUi::Connecting,
        State::Connected { channel_open, .. } => ConnectionUi::Connected {
            channel_open: *channel_open,
        },
        State::Closed { .. } => ConnectionUi::Closed,
        State::Failed { message } => ConnectionUi::Failed {
            message: message.clone(),
        },
    }
}

/// Render the connection state to the sink
fn emit_ui_state(sink: &dyn StatusSink, state: &State) {
    let ui_state = state_to_ui(state);
    log::debug!("Emitting UI state: {:?}", serde_json::to_string(&ui_state));
    let (text, style) = ui_state.status_text();
    sink.set_status(Surface::Connection, &text, style);
}

/// User input line, parsed
#[derive(Debug, Clone, PartialEq)]
pub enum InputCommand {
    Connect,
    Disconnect,
    Quit,
    Message(String),
}

pub fn parse_input(line: &str) -> InputCommand {
    match line.trim() {
        "/connect" => InputCommand::Connect,
        "/disconnect" => InputCommand::Disconnect,
        "/quit" | "/exit" => InputCommand::Quit,
        _ => InputCommand::Message(line.to_string()),
    }
}

impl From<InputCommand> for Event {
    fn from(cmd: InputCommand) -> Self {
        match cmd {
            InputCommand::Connect => Event::Connect,
            InputCommand::Disconnect => Event::Disconnect,
            InputCommand::Quit => Event::Exit,
            InputCommand::Message(text) => Event::UserInput { text },
        }
    }
}

/// Run the main state loop until `Event::Exit`.
///
/// The loop is the only owner of the connection state and the conversation;
/// everything else talks to it through `tx`. Before returning the final state
/// it waits for the effect runner to close every session.
pub async fn run_state_loop(
    sink: Arc<dyn StatusSink>,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    preview_chars: usize,
) -> State {
    let mut state = State::default();
    let mut chat = ChatSession::new(sink.clone(), preview_chars);
    let mut channel: Option<Arc<dyn TextChannel>> = None;

    // Emit initial state
    emit_ui_state(sink.as_ref(), &state);
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        // Handle chat traffic and Exit at the edge
        match event {
            Event::Exit => {
                log::info!("Exit requested, shutting down state loop");
                break;
            }
            Event::Inbound { id, payload } => {
                if state.session_id() == Some(id) {
                    chat.handle_frame(&payload);
                } else {
                    log::debug!("Dropping message for stale session {}", id);
                }
                continue;
            }
            Event::UserInput { text } => {
                if let Err(e) = chat.send_text(&text, channel.as_deref()) {
                    log::debug!("Message not sent: {}", e);
                }
                continue;
            }
            Event::ConnectOk { id, channel: ref ch } if state.session_id() == Some(id) => {
                channel = Some(ch.clone());
            }
            _ => {}
        }

        log::debug!("Received event: {:?}", event);

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        // Log state transitions
        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;
        if state.session_id().is_none() {
            channel = None;
        }

        // Execute effects
        for eff in effects {
            match eff {
                Effect::EmitUi => emit_ui_state(sink.as_ref(), &state),
                Effect::ResetConversation => chat.reset(),
                Effect::ReportWarning { surface, message } => {
                    log::warn!("{}", message);
                    sink.set_status(surface, &message, StatusStyle::Warning);
                }
                other => effect_runner.spawn(other, tx.clone()),
            }
        }
    }

    effect_runner.shutdown().await;
    log::info!("State loop ended");
    state
}

/// Forward stdin lines to the state loop; EOF exits.
async fn read_stdin(tx: mpsc::Sender<Event>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(parse_input(&line).into()).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    let _ = tx.send(Event::Exit).await;
}

// ============================================================================
// Application entry point
// ============================================================================

pub async fn run() -> Result<(), String> {
    let settings = settings::load_settings();
    log::info!(
        "Server {} (offer path {}), {} ICE server(s)",
        settings.server_url,
        settings.offer_path,
        settings.ice_servers.len()
    );

    let sink: Arc<dyn StatusSink> = Arc::new(ConsoleSink::new());
    let effect_runner = RtcEffectRunner::new(settings.clone())?;

    // Create event channel for state machine
    let (tx, rx) = mpsc::channel::<Event>(64);

    tokio::spawn(read_stdin(tx.clone()));

    let ctrl_c_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received");
            let _ = ctrl_c_tx.send(Event::Exit).await;
        }
    });

    println!("Type a message and press Enter. Commands: /connect /disconnect /quit");
    if settings.auto_connect {
        tx.send(Event::Connect)
            .await
            .map_err(|e| format!("State loop unavailable: {}", e))?;
    }

    run_state_loop(sink, rx, tx, effect_runner, settings.preview_chars).await;

    log::info!("Voice chat client stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_input("/connect"), InputCommand::Connect);
        assert_eq!(parse_input("  /disconnect "), InputCommand::Disconnect);
        assert_eq!(parse_input("/quit"), InputCommand::Quit);
        assert_eq!(
            parse_input("hello /connect"),
            InputCommand::Message("hello /connect".to_string())
        );
    }

    #[test]
    fn test_ui_state_serialization() {
        let json = serde_json::to_string(&ConnectionUi::Connected { channel_open: true }).unwrap();
        assert_eq!(json, r#"{"status":"connected","channelOpen":true}"#);

        let json = serde_json::to_string(&ConnectionUi::Idle).unwrap();
        assert_eq!(json, r#"{"status":"idle"}"#);
    }

    #[test]
    fn test_failed_state_text_includes_message() {
        let state = State::Failed {
            message: "Signaling failed: refused".to_string(),
        };
        let (text, style) = state_to_ui(&state).status_text();
        assert!(text.contains("refused"));
        assert_eq!(style, StatusStyle::Error);
    }
}
