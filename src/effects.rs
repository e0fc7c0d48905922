//! Effect runner for the voice-chat client
//!
//! This module handles executing effects produced by the state machine.
//! Session setup runs on its own task; its result and every later session
//! callback come back to the state loop as `Event`s tagged with the session id.
//! Setup and close tasks are tracked so `shutdown` can wait for them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::chat::TextChannel;
use crate::session::{ConnectionError, RtcSession, SessionEvent};
use crate::settings::ClientSettings;
use crate::state_machine::{Effect, Event};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);

    /// Close every session, open or still connecting, and wait for
    /// outstanding work. Called once when the state loop exits.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Map a session callback to a state machine event
fn session_event(id: Uuid, event: SessionEvent) -> Event {
    match event {
        SessionEvent::ChannelOpen => Event::ChannelOpened { id },
        SessionEvent::ChannelClosed => Event::ChannelClosed { id },
        SessionEvent::ChannelError(message) => Event::ChannelError { id, message },
        SessionEvent::Message(payload) => Event::Inbound { id, payload },
        SessionEvent::PeerState(state) => Event::PeerStateChanged { id, state },
        SessionEvent::PlaybackFailed(message) => Event::PlaybackFailed { id, message },
    }
}

/// Effect runner backed by real WebRTC sessions.
pub struct RtcEffectRunner {
    settings: ClientSettings,
    client: reqwest::Client,
    active_sessions: Arc<Mutex<HashMap<Uuid, RtcSession>>>,
    tasks: TaskTracker,
    /// Parent of every session's cancellation token
    cancel: CancellationToken,
}

impl RtcEffectRunner {
    pub fn new(settings: ClientSettings) -> Result<Arc<Self>, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Arc::new(Self {
            settings,
            client,
            active_sessions: Arc::new(Mutex::new(HashMap::new())),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }))
    }

    /// Close every session (used on exit).
    ///
    /// Sessions still connecting are cancelled; pending closes are awaited.
    pub async fn close_all(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let sessions: Vec<RtcSession> = {
            let mut active = self.active_sessions.lock().await;
            active.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            log::info!("Closing session {} on exit", session.id());
            session.close().await;
        }
    }
}

impl EffectRunner for RtcEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartSession { id } => {
                let settings = self.settings.clone();
                let client = self.client.clone();
                let active = self.active_sessions.clone();
                let shutdown = self.cancel.clone();

                self.tasks.spawn(async move {
                    let (session_tx, mut session_rx) = mpsc::unbounded_channel::<SessionEvent>();

                    // Forward session callbacks in arrival order
                    let forward_tx = tx.clone();
                    tokio::spawn(async move {
                        while let Some(ev) = session_rx.recv().await {
                            if forward_tx.send(session_event(id, ev)).await.is_err() {
                                break;
                            }
                        }
                        log::debug!("Session {}: event forwarder exiting", id);
                    });

                    match RtcSession::connect(id, &settings, &client, session_tx, &shutdown).await {
                        Ok(session) if shutdown.is_cancelled() => {
                            session.close().await;
                        }
                        Ok(session) => {
                            let channel: Arc<dyn TextChannel> = session.channel();
                            active.lock().await.insert(id, session);
                            let _ = tx.send(Event::ConnectOk { id, channel }).await;
                        }
                        Err(err) => {
                            let _ = tx.send(Event::ConnectFail { id, err }).await;
                        }
                    }
                });
            }

            Effect::CloseSession { id } => {
                let active = self.active_sessions.clone();
                self.tasks.spawn(async move {
                    let session = active.lock().await.remove(&id);
                    match session {
                        Some(session) => session.close().await,
                        None => log::debug!("Session {}: nothing to close", id),
                    }
                });
            }

            Effect::ResetConversation | Effect::ReportWarning { .. } | Effect::EmitUi => {
                unreachable!("UI effects should be handled in run_state_loop");
            }
        }
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.close_all())
    }
}

/// Always-open channel used by `StubEffectRunner`; records what was sent.
#[derive(Debug, Default)]
pub struct StubChannel {
    sent: std::sync::Mutex<Vec<String>>,
}

impl StubChannel {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl TextChannel for StubChannel {
    fn is_open(&self) -> bool {
        true
    }

    fn send(&self, text: String) -> Result<(), ConnectionError> {
        log::info!("Stub: would send {:?}", text);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(text);
        }
        Ok(())
    }
}

/// Stub effect runner for testing: every session connects and opens its
/// channel after a short delay.
pub struct StubEffectRunner {
    channel: Arc<StubChannel>,
    started: std::sync::Mutex<Vec<Uuid>>,
    closed: Arc<std::sync::Mutex<Vec<Uuid>>>,
}

impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channel: Arc::new(StubChannel::default()),
            started: std::sync::Mutex::new(Vec::new()),
            closed: Arc::new(std::sync::Mutex::new(Vec::new())),
        })
    }

    pub fn channel(&self) -> Arc<StubChannel> {
        self.channel.clone()
    }

    /// Ids of every session started so far, oldest first
    pub fn started_sessions(&self) -> Vec<Uuid> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Ids of every session closed so far, in close order
    pub fn closed_sessions(&self) -> Vec<Uuid> {
        self.closed.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartSession { id } => {
                if let Ok(mut started) = self.started.lock() {
                    started.push(id);
                }
                let channel: Arc<dyn TextChannel> = self.channel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log::info!("Stub: session {} connected", id);
                    let _ = tx.send(Event::ConnectOk { id, channel }).await;
                    let _ = tx.send(Event::ChannelOpened { id }).await;
                });
            }

            Effect::CloseSession { id } => {
                log::info!("Stub: closing session {}", id);
                if let Ok(mut closed) = self.closed.lock() {
                    closed.push(id);
                }
            }

            Effect::ResetConversation | Effect::ReportWarning { .. } | Effect::EmitUi => {
                unreachable!("UI effects should be handled in run_state_loop");
            }
        }
    }

    /// Closes every started session that is still open, after a delay that
    /// stands in for the peer connection teardown.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let started = self.started_sessions();
            if let Ok(mut closed) = self.closed.lock() {
                for id in started {
                    if !closed.contains(&id) {
                        log::info!("Stub: closing session {} on exit", id);
                        closed.push(id);
                    }
                }
            }
        })
    }
}
