//! Connection state machine for the voice-chat client
//!
//! This module implements the connection lifecycle using a single-writer
//! pattern. All state transitions go through the `reduce()` function, which
//! returns a new state and a list of effects to execute.
//!
//! ```text
//! Idle ──Connect──▶ Connecting ──ConnectOk──▶ Connected ──ChannelClosed──▶ Closed
//!                       │                         │ ▲
//!                       │ ConnectFail             │ └─ ChannelOpened
//!                       ▼                         ▼ peer Failed
//!                     Failed ◀────────────────────┘
//! ```

use std::sync::Arc;
use uuid::Uuid;

use crate::chat::TextChannel;
use crate::session::{ConnectionError, PeerState};
use crate::ui::Surface;

/// Internal state of the connection.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    Connecting {
        session_id: Uuid,
        /// The data channel can open before the answer handling finishes
        channel_open: bool,
    },
    Connected {
        session_id: Uuid,
        channel_open: bool,
    },
    Closed {
        session_id: Uuid,
    },
    Failed {
        message: String,
    },
}

impl State {
    /// Session this state refers to, if it is still live
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Connecting { session_id, .. } | State::Connected { session_id, .. } => {
                Some(*session_id)
            }
            State::Idle | State::Closed { .. } | State::Failed { .. } => None,
        }
    }

    pub fn is_channel_open(&self) -> bool {
        matches!(
            self,
            State::Connected {
                channel_open: true,
                ..
            }
        )
    }
}

/// Events that can trigger state transitions.
/// These are sent from the user, the effect runner, and session callbacks.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to connect
    Connect,
    /// User asked to disconnect
    Disconnect,
    /// Application exit requested
    Exit,

    // Session setup
    ConnectOk {
        id: Uuid,
        channel: Arc<dyn TextChannel>,
    },
    ConnectFail {
        id: Uuid,
        err: ConnectionError,
    },

    // Session callbacks
    ChannelOpened {
        id: Uuid,
    },
    ChannelClosed {
        id: Uuid,
    },
    ChannelError {
        id: Uuid,
        message: String,
    },
    PeerStateChanged {
        id: Uuid,
        state: PeerState,
    },
    PlaybackFailed {
        id: Uuid,
        message: String,
    },

    /// Data channel payload; handled by the chat session, not the reducer
    Inbound {
        id: Uuid,
        payload: String,
    },
    /// Line typed by the user; handled by the chat session
    UserInput {
        text: String,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    StartSession { id: Uuid },
    CloseSession { id: Uuid },
    /// Clear the response buffer and input queue for a new session
    ResetConversation,
    /// Recoverable problem shown as a status, connection unchanged
    ReportWarning { surface: Surface, message: String },
    /// Signal to render the connection status
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    match (state, event) {
        // -----------------
        // Starting a session
        // -----------------
        (Idle | Closed { .. } | Failed { .. }, Connect) => {
            let id = Uuid::new_v4();
            (
                Connecting {
                    session_id: id,
                    channel_open: false,
                },
                vec![ResetConversation, StartSession { id }, EmitUi],
            )
        }
        (Connecting { .. } | Connected { .. }, Connect) => {
            log::debug!("Connect ignored: session already active");
            (state.clone(), vec![])
        }

        // -----------------
        // Connecting
        // -----------------
        (
            Connecting {
                session_id,
                channel_open,
            },
            ConnectOk { id, .. },
        ) if *session_id == id => (
            Connected {
                session_id: *session_id,
                channel_open: *channel_open,
            },
            vec![EmitUi],
        ),
        (Connecting { session_id, .. }, ConnectFail { id, err }) if *session_id == id => {
            if err.is_fatal() {
                (
                    Failed {
                        message: err.to_string(),
                    },
                    vec![EmitUi],
                )
            } else {
                (
                    state.clone(),
                    vec![ReportWarning {
                        surface: Surface::Connection,
                        message: err.to_string(),
                    }],
                )
            }
        }
        (Connecting { session_id, .. }, ChannelOpened { id }) if *session_id == id => (
            Connecting {
                session_id: *session_id,
                channel_open: true,
            },
            vec![],
        ),

        // -----------------
        // Connected
        // -----------------
        (Connected { session_id, .. }, ChannelOpened { id }) if *session_id == id => (
            Connected {
                session_id: *session_id,
                channel_open: true,
            },
            vec![EmitUi],
        ),

        // -----------------
        // Live session (Connecting or Connected)
        // -----------------
        (Connecting { session_id, .. } | Connected { session_id, .. }, Disconnect) => (
            Closed {
                session_id: *session_id,
            },
            vec![CloseSession { id: *session_id }, EmitUi],
        ),
        (_, ChannelClosed { id }) if is_current(id) => (
            Closed { session_id: id },
            vec![CloseSession { id }, EmitUi],
        ),
        (_, PeerStateChanged { id, state: peer }) if is_current(id) => match peer {
            PeerState::Failed => (
                Failed {
                    message: "Peer connection failed".to_string(),
                },
                vec![CloseSession { id }, EmitUi],
            ),
            PeerState::Closed => (
                Closed { session_id: id },
                vec![CloseSession { id }, EmitUi],
            ),
            PeerState::Disconnected => (
                state.clone(),
                vec![ReportWarning {
                    surface: Surface::Connection,
                    message: "Peer connection interrupted".to_string(),
                }],
            ),
            PeerState::New | PeerState::Connecting | PeerState::Connected => {
                (state.clone(), vec![])
            }
        },
        (_, ChannelError { id, message }) if is_current(id) => (
            state.clone(),
            vec![ReportWarning {
                surface: Surface::Connection,
                message: format!("Data channel error: {}", message),
            }],
        ),
        (_, PlaybackFailed { id, message }) if is_current(id) => (
            state.clone(),
            vec![ReportWarning {
                surface: Surface::Audio,
                message: ConnectionError::PlaybackFailure(message).to_string(),
            }],
        ),

        // -----------------
        // Stale session results: close anything that finished setup late
        // -----------------
        (_, ConnectOk { id, .. }) if !is_current(id) => {
            log::debug!("Closing stale session {}", id);
            (state.clone(), vec![CloseSession { id }])
        }

        // -----------------
        // Unhandled or stale: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct OpenChannel;

    impl TextChannel for OpenChannel {
        fn is_open(&self) -> bool {
            true
        }
        fn send(&self, _text: String) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    fn connecting(id: Uuid) -> State {
        State::Connecting {
            session_id: id,
            channel_open: false,
        }
    }

    #[test]
    fn idle_connect_starts_session() {
        let (next, effects) = reduce(&State::Idle, Event::Connect);
        let id = match next {
            State::Connecting { session_id, .. } => session_id,
            other => panic!("Expected Connecting, got {:?}", other),
        };
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartSession { id: sid } if *sid == id)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ResetConversation)));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn connect_while_active_is_ignored() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id), Event::Connect);
        assert!(matches!(next, State::Connecting { session_id, .. } if session_id == id));
        assert!(effects.is_empty());
    }

    #[test]
    fn connect_ok_transitions_to_connected() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(id),
            Event::ConnectOk {
                id,
                channel: Arc::new(OpenChannel),
            },
        );
        assert!(matches!(
            next,
            State::Connected {
                channel_open: false,
                ..
            }
        ));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn channel_open_before_connect_ok_is_remembered() {
        let id = Uuid::new_v4();
        let (next, _) = reduce(&connecting(id), Event::ChannelOpened { id });
        let (next, _) = reduce(
            &next,
            Event::ConnectOk {
                id,
                channel: Arc::new(OpenChannel),
            },
        );
        assert!(next.is_channel_open());
    }

    #[test]
    fn fatal_connect_fail_transitions_to_failed() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(id),
            Event::ConnectFail {
                id,
                err: ConnectionError::SignalingFailure("refused".to_string()),
            },
        );
        assert!(matches!(next, State::Failed { ref message } if message.contains("refused")));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let stale_id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(id),
            Event::ConnectFail {
                id: stale_id,
                err: ConnectionError::SignalingFailure("x".to_string()),
            },
        );
        assert!(matches!(next, State::Connecting { .. }));
        assert!(effects.is_empty());

        let (next, effects) = reduce(&connecting(id), Event::ChannelClosed { id: stale_id });
        assert!(matches!(next, State::Connecting { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_connect_ok_closes_late_session() {
        let stale_id = Uuid::new_v4();
        let (next, effects) = reduce(
            &State::Idle,
            Event::ConnectOk {
                id: stale_id,
                channel: Arc::new(OpenChannel),
            },
        );
        assert!(matches!(next, State::Idle));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CloseSession { id } if *id == stale_id)));
    }

    #[test]
    fn channel_closed_transitions_to_closed() {
        let id = Uuid::new_v4();
        let state = State::Connected {
            session_id: id,
            channel_open: true,
        };
        let (next, effects) = reduce(&state, Event::ChannelClosed { id });
        assert!(matches!(next, State::Closed { session_id } if session_id == id));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CloseSession { .. })));
    }

    #[test]
    fn peer_failure_transitions_to_failed() {
        let id = Uuid::new_v4();
        let state = State::Connected {
            session_id: id,
            channel_open: true,
        };
        let (next, effects) = reduce(
            &state,
            Event::PeerStateChanged {
                id,
                state: PeerState::Failed,
            },
        );
        assert!(matches!(next, State::Failed { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CloseSession { .. })));
    }

    #[test]
    fn recoverable_errors_keep_state() {
        let id = Uuid::new_v4();
        let state = State::Connected {
            session_id: id,
            channel_open: true,
        };

        let (next, effects) = reduce(
            &state,
            Event::PlaybackFailed {
                id,
                message: "no output device".to_string(),
            },
        );
        assert!(next.is_channel_open());
        assert!(matches!(
            effects.as_slice(),
            [Effect::ReportWarning {
                surface: Surface::Audio,
                message,
            }] if message.contains("no output device")
        ));

        let (next, effects) = reduce(
            &state,
            Event::ChannelError {
                id,
                message: "sctp".to_string(),
            },
        );
        assert!(next.is_channel_open());
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn disconnect_closes_session() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id), Event::Disconnect);
        assert!(matches!(next, State::Closed { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CloseSession { id: sid } if *sid == id)));

        let (next, effects) = reduce(&State::Idle, Event::Disconnect);
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn reconnect_after_failure_uses_new_id() {
        let state = State::Failed {
            message: "x".to_string(),
        };
        let (next, _) = reduce(&state, Event::Connect);
        assert!(matches!(next, State::Connecting { .. }));

        let old_id = Uuid::new_v4();
        let (next, _) = reduce(&State::Closed { session_id: old_id }, Event::Connect);
        assert!(matches!(next, State::Connecting { session_id, .. } if session_id != old_id));
    }
}
