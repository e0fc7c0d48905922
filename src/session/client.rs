//! Peer connection lifecycle
//!
//! `RtcSession::connect` performs the whole setup in order and either returns
//! a live session or a typed `ConnectionError`. Everything that happens after
//! setup (channel open/close, inbound messages, peer state, playback errors)
//! is reported as a `SessionEvent` on the channel passed in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::protocol::SessionDescriptionPayload;
use super::signaling::{exchange_offer, offer_url};
use super::ConnectionError;
use crate::audio::{probe_microphone, AudioPlayer, OpusDecoder};
use crate::chat::TextChannel;
use crate::settings::ClientSettings;

/// Peer connection state as seen by the rest of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        }
    }
}

/// Events emitted by a live session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ChannelOpen,
    ChannelClosed,
    ChannelError(String),
    /// Raw data channel payload (decoded as UTF-8, lossy)
    Message(String),
    PeerState(PeerState),
    PlaybackFailed(String),
}

/// The `chat` data channel, write side.
///
/// Sends are queued to a writer task so callers never await the SCTP stack.
pub struct RtcTextChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    tx: mpsc::UnboundedSender<String>,
}

impl RtcTextChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_dc = dc.clone();

        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = writer_dc.send_text(text).await {
                    log::warn!("Data channel send failed: {}", e);
                }
            }
            log::debug!("Data channel writer exiting");
        });

        Self {
            label: dc.label().to_string(),
            dc,
            tx,
        }
    }
}

impl std::fmt::Debug for RtcTextChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcTextChannel")
            .field("label", &self.label)
            .field("state", &self.dc.ready_state())
            .finish()
    }
}

impl TextChannel for RtcTextChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn send(&self, text: String) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::ChannelNotReady);
        }
        self.tx
            .send(text)
            .map_err(|_| ConnectionError::ChannelNotReady)
    }
}

/// One connection to the voice-chat server
pub struct RtcSession {
    id: Uuid,
    peer: Arc<RTCPeerConnection>,
    channel: Arc<RtcTextChannel>,
    cancel: CancellationToken,
}

impl RtcSession {
    /// Establish a session.
    ///
    /// Steps: microphone probe, peer connection with a recv-only audio
    /// transceiver, track and state handlers, the data channel, then the
    /// offer/answer exchange. A half-built peer connection is closed on error.
    ///
    /// Cancelling `shutdown` aborts setup, and later closes the session's
    /// background tasks.
    pub async fn connect(
        id: Uuid,
        settings: &ClientSettings,
        client: &reqwest::Client,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: &CancellationToken,
    ) -> Result<Self, ConnectionError> {
        log::info!("Session {}: connecting to {}", id, settings.server_url);

        if settings.require_microphone {
            let info = tokio::task::spawn_blocking(probe_microphone)
                .await
                .map_err(|e| ConnectionError::MediaPermissionDenied(e.to_string()))?
                .map_err(|e| ConnectionError::MediaPermissionDenied(e.to_string()))?;
            log::info!(
                "Session {}: microphone available ({}, {} Hz)",
                id,
                info.device_name,
                info.sample_rate
            );
        } else {
            log::info!("Session {}: microphone check skipped", id);
        }

        let peer = create_peer(settings).await?;
        let cancel = shutdown.child_token();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::NegotiationFailure(
                "cancelled before setup finished".to_string(),
            )),
            result = negotiate(id, &peer, settings, client, events, cancel.clone()) => result,
        };

        match result {
            Ok(channel) => {
                log::info!("Session {}: negotiation complete", id);
                Ok(Self {
                    id,
                    peer,
                    channel,
                    cancel,
                })
            }
            Err(e) => {
                log::error!("Session {}: {}", id, e);
                cancel.cancel();
                if let Err(close_err) = peer.close().await {
                    log::warn!("Session {}: close after failure: {}", id, close_err);
                }
                Err(e)
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The session's text channel
    pub fn channel(&self) -> Arc<RtcTextChannel> {
        self.channel.clone()
    }

    /// Tear down playback and the peer connection
    pub async fn close(self) {
        log::info!("Session {}: closing", self.id);
        self.cancel.cancel();
        if let Err(e) = self.peer.close().await {
            log::warn!("Session {}: close failed: {}", self.id, e);
        }
    }
}

async fn create_peer(settings: &ClientSettings) -> Result<Arc<RTCPeerConnection>, ConnectionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| ConnectionError::NegotiationFailure(format!("register codecs: {}", e)))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| ConnectionError::NegotiationFailure(format!("register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = if settings.ice_servers.is_empty() {
        vec![]
    } else {
        vec![RTCIceServer {
            urls: settings.ice_servers.clone(),
            ..Default::default()
        }]
    };

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let peer = api
        .new_peer_connection(config)
        .await
        .map_err(|e| ConnectionError::NegotiationFailure(format!("create peer connection: {}", e)))?;

    Ok(Arc::new(peer))
}

/// Everything between creating the peer and applying the answer
async fn negotiate(
    id: Uuid,
    peer: &Arc<RTCPeerConnection>,
    settings: &ClientSettings,
    client: &reqwest::Client,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) -> Result<Arc<RtcTextChannel>, ConnectionError> {
    peer.add_transceiver_from_kind(
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .map_err(|e| ConnectionError::NegotiationFailure(format!("add audio transceiver: {}", e)))?;

    register_track_handler(id, peer, settings.audio_playback, events.clone(), cancel);
    register_state_handler(id, peer, events.clone());

    // Must exist before the offer so it is negotiated in the SDP
    let dc = peer
        .create_data_channel(&settings.data_channel_label, None)
        .await
        .map_err(|e| ConnectionError::NegotiationFailure(format!("create data channel: {}", e)))?;
    register_channel_handlers(id, &dc, events);

    let mut gathering_done = peer.gathering_complete_promise().await;

    let offer = peer
        .create_offer(None)
        .await
        .map_err(|e| ConnectionError::NegotiationFailure(format!("create offer: {}", e)))?;
    peer.set_local_description(offer)
        .await
        .map_err(|e| ConnectionError::NegotiationFailure(format!("set local description: {}", e)))?;

    let gathering_timeout = Duration::from_millis(settings.ice_gathering_timeout_ms);
    if tokio::time::timeout(gathering_timeout, gathering_done.recv())
        .await
        .is_err()
    {
        log::warn!(
            "Session {}: ICE gathering not complete after {:?}, sending partial offer",
            id,
            gathering_timeout
        );
    }

    let local = peer
        .local_description()
        .await
        .ok_or_else(|| ConnectionError::NegotiationFailure("missing local description".into()))?;

    let url = offer_url(&settings.server_url, &settings.offer_path);
    let answer = exchange_offer(client, &url, &SessionDescriptionPayload::offer(local.sdp)).await?;

    let remote = RTCSessionDescription::answer(answer.sdp)
        .map_err(|e| ConnectionError::NegotiationFailure(format!("invalid answer SDP: {}", e)))?;
    peer.set_remote_description(remote)
        .await
        .map_err(|e| ConnectionError::NegotiationFailure(format!("set remote description: {}", e)))?;

    Ok(Arc::new(RtcTextChannel::new(dc)))
}

fn register_state_handler(
    id: Uuid,
    peer: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let peer_state = PeerState::from(state);
        log::info!("Session {}: peer connection {:?}", id, peer_state);
        let _ = events.send(SessionEvent::PeerState(peer_state));
        Box::pin(async {})
    }));
}

fn register_channel_handlers(
    id: Uuid,
    dc: &Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let label = dc.label().to_string();

    let tx = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        log::info!("Session {}: data channel '{}' open", id, open_label);
        let _ = tx.send(SessionEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        log::info!("Session {}: data channel '{}' closed", id, label);
        let _ = tx.send(SessionEvent::ChannelClosed);
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_error(Box::new(move |err: webrtc::Error| {
        log::warn!("Session {}: data channel error: {}", id, err);
        let _ = tx.send(SessionEvent::ChannelError(err.to_string()));
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        log::debug!("Session {}: received {} bytes", id, text.len());
        let _ = events.send(SessionEvent::Message(text));
        Box::pin(async {})
    }));
}

fn register_track_handler(
    id: Uuid,
    peer: &Arc<RTCPeerConnection>,
    playback: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let attached = Arc::new(AtomicBool::new(false));

    peer.on_track(Box::new(move |track, _receiver, _transceiver| {
        let attached = attached.clone();
        let events = events.clone();
        let cancel = cancel.clone();

        Box::pin(async move {
            if track.kind() != RTPCodecType::Audio {
                log::debug!("Session {}: ignoring {:?} track", id, track.kind());
                return;
            }
            if attached.swap(true, Ordering::SeqCst) {
                log::info!("Session {}: ignoring additional audio track {}", id, track.id());
                return;
            }

            log::info!(
                "Session {}: audio track {} (stream {}, {}) at {}",
                id,
                track.id(),
                track.stream_id(),
                track.codec().capability.mime_type,
                chrono::Local::now().format("%H:%M:%S%.3f")
            );

            tokio::spawn(play_track(id, track, playback, events, cancel));
        })
    }));
}

/// Decode and play the remote track until it ends or the session closes.
///
/// If playback cannot start, the track is still drained so RTP reception keeps
/// working; the failure is reported once.
async fn play_track(
    id: Uuid,
    track: Arc<TrackRemote>,
    playback: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut output = if playback {
        match start_playback().await {
            Ok(output) => Some(output),
            Err(e) => {
                log::warn!("Session {}: {}", id, e);
                let _ = events.send(SessionEvent::PlaybackFailed(e.to_string()));
                None
            }
        }
    } else {
        None
    };

    let mut packets: u64 = 0;
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _attributes)) => packet,
                Err(e) => {
                    log::debug!("Session {}: track read ended: {}", id, e);
                    break;
                }
            },
        };
        packets += 1;

        let Some((decoder, player)) = output.as_mut() else {
            continue;
        };
        let failure = match decoder.decode(&packet.payload) {
            Ok(pcm) => {
                player.push_samples(pcm);
                None
            }
            Err(e) => Some(e),
        };
        if let Some(e) = failure {
            log::warn!("Session {}: {}", id, e);
            let _ = events.send(SessionEvent::PlaybackFailed(e.to_string()));
            if let Some((_, player)) = output.take() {
                stop_player(id, player).await;
            }
        }
    }

    if let Some((_, player)) = output {
        stop_player(id, player).await;
    }
    log::info!("Session {}: audio track finished after {} packets", id, packets);
}

/// Joining the playback thread blocks, so it happens on the blocking pool
async fn stop_player(id: Uuid, player: AudioPlayer) {
    let unplayed = player.buffered_ms();
    if unplayed > 0 {
        log::debug!("Session {}: discarding {} ms of unplayed audio", id, unplayed);
    }
    if let Err(e) = tokio::task::spawn_blocking(move || player.stop()).await {
        log::warn!("Session {}: stopping playback failed: {}", id, e);
    }
}

async fn start_playback() -> Result<(OpusDecoder, AudioPlayer), ConnectionError> {
    let decoder = OpusDecoder::new().map_err(|e| ConnectionError::PlaybackFailure(e.to_string()))?;
    let player = tokio::task::spawn_blocking(AudioPlayer::start)
        .await
        .map_err(|e| ConnectionError::PlaybackFailure(e.to_string()))?
        .map_err(|e| ConnectionError::PlaybackFailure(e.to_string()))?;
    Ok((decoder, player))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_state_mapping() {
        assert_eq!(PeerState::from(RTCPeerConnectionState::New), PeerState::New);
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Unspecified),
            PeerState::New
        );
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Connected),
            PeerState::Connected
        );
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Failed),
            PeerState::Failed
        );
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Closed),
            PeerState::Closed
        );
    }

    #[tokio::test]
    async fn test_connect_fails_when_server_unreachable() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let settings = ClientSettings {
            server_url: format!("http://{}", addr),
            require_microphone: false,
            audio_playback: false,
            ice_gathering_timeout_ms: 500,
            ..Default::default()
        };
        let client = reqwest::Client::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result =
            RtcSession::connect(Uuid::new_v4(), &settings, &client, tx, &CancellationToken::new())
                .await;

        match result {
            Err(ConnectionError::SignalingFailure(_)) => {}
            Err(other) => panic!("Expected SignalingFailure, got {}", other),
            Ok(_) => panic!("Expected connection to fail"),
        }
    }

    #[tokio::test]
    async fn test_connect_aborts_when_shutdown_cancelled() {
        let settings = ClientSettings {
            server_url: "http://127.0.0.1:9".to_string(),
            require_microphone: false,
            audio_playback: false,
            ..Default::default()
        };
        let client = reqwest::Client::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = RtcSession::connect(Uuid::new_v4(), &settings, &client, tx, &shutdown).await;

        match result {
            Err(ConnectionError::NegotiationFailure(msg)) => assert!(msg.contains("cancelled")),
            Err(other) => panic!("Expected NegotiationFailure, got {}", other),
            Ok(_) => panic!("Expected setup to be cancelled"),
        }
    }

    #[tokio::test]
    #[ignore] // Requires an audio output device
    async fn test_stop_player_runs_off_the_runtime() {
        let (_decoder, player) = start_playback().await.expect("playback failed to start");
        player.push_samples(&[0.0; 960 * 2]);
        stop_player(Uuid::new_v4(), player).await;
    }
}
