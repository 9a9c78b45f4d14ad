//! WebRTC peer session.
//!
//! One `PeerSession` owns one peer connection carrying two data
//! channels: an unreliable-ordered media channel for video fragments and
//! a reliable-ordered control channel. Negotiation payloads (SDP,
//! candidates) pass through opaquely; this module only reacts to the
//! transport's state-change events.

use crate::config::TransportConfig;
use crate::control::ControlMessage;
use crate::errors::{Result, StreamError};
use crate::types::{CodecId, Fragment};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the unreliable-ordered video channel.
pub const MEDIA_CHANNEL_LABEL: &str = "media";
/// Label of the reliable-ordered control channel.
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Negotiating = 1,
    Connected = 2,
    Streaming = 3,
    Closing = 4,
    Closed = 5,
    Failed = 6,
}

impl SessionState {
    fn from_u8(value: u8) -> SessionState {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Negotiating,
            2 => SessionState::Connected,
            3 => SessionState::Streaming,
            4 => SessionState::Closing,
            5 => SessionState::Closed,
            _ => SessionState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    /// Media fragments may only flow while connected or streaming.
    pub fn can_send_media(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Streaming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Legal state-machine edges.
pub fn transition_allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Idle, Negotiating)
            | (Negotiating, Connected)
            | (Connected, Streaming)
            | (Negotiating | Connected | Streaming, Failed)
            | (Idle | Negotiating | Connected | Streaming | Failed, Closing)
            | (Closing, Closed)
    )
}

/// Connection-level events surfaced by the transport library.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected(String),
    IceFailed(String),
    Closed,
}

/// Events delivered to the owning session manager on the event-loop
/// boundary, never inline with media sends.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Transport(TransportEvent),
    Control(ControlMessage),
}

enum WriterCmd {
    Fragment(Fragment),
    Shutdown(oneshot::Sender<()>),
}

/// State shared between the session, its writer task, and the transport
/// callbacks.
struct Shared {
    id: Uuid,
    state: AtomicU8,
    started: Instant,
    /// Milliseconds since `started` of the last successful media send or
    /// state change. Drives dead-peer detection.
    last_activity_ms: AtomicU64,
    fragments_sent: AtomicU64,
    fragments_dropped: AtomicU64,
    keyframes_sent: AtomicU64,
    control_sent: AtomicU64,
    last_keyframe_sequence: AtomicU64,
    /// u64::MAX until a sample has been recorded.
    rtt_estimate_ms: AtomicU64,
}

impl Shared {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            state: AtomicU8::new(SessionState::Idle as u8),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            fragments_sent: AtomicU64::new(0),
            fragments_dropped: AtomicU64::new(0),
            keyframes_sent: AtomicU64::new(0),
            control_sent: AtomicU64::new(0),
            last_keyframe_sequence: AtomicU64::new(0),
            rtt_estimate_ms: AtomicU64::new(u64::MAX),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn touch_activity(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Apply a transition if the edge is legal. Returns whether the
    /// state changed.
    fn try_transition(&self, to: SessionState) -> bool {
        let mut current = self.state();
        loop {
            if !transition_allowed(current, to) {
                return false;
            }
            match self.state.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.touch_activity();
                    log::info!(
                        "Session {}: {} -> {}",
                        self.id,
                        current.as_str(),
                        to.as_str()
                    );
                    return true;
                }
                Err(actual) => current = SessionState::from_u8(actual),
            }
        }
    }

    fn apply_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.try_transition(SessionState::Connected);
            }
            TransportEvent::Disconnected(reason) => {
                if self.try_transition(SessionState::Failed) {
                    log::warn!("Session {} failed: {}", self.id, reason);
                }
            }
            TransportEvent::IceFailed(reason) => {
                if self.try_transition(SessionState::Failed) {
                    log::warn!("Session {} ICE failed: {}", self.id, reason);
                }
            }
            TransportEvent::Closed => {
                // An orderly close completes Closing; anything else is a
                // peer that went away under us.
                if !self.try_transition(SessionState::Closed) {
                    self.try_transition(SessionState::Failed);
                }
            }
        }
    }
}

/// Point-in-time session counters for telemetry and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub state: SessionState,
    pub negotiated_codec: Option<CodecId>,
    pub fragments_sent: u64,
    pub fragments_dropped: u64,
    pub keyframes_sent: u64,
    pub control_sent: u64,
    pub last_keyframe_sequence: u64,
    pub rtt_ms: Option<u64>,
}

/// One remote peer: connection, channels, and session state machine.
pub struct PeerSession {
    shared: Arc<Shared>,
    pc: Arc<RTCPeerConnection>,
    media_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    control_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    negotiated_codec: StdRwLock<Option<CodecId>>,
    outbound: mpsc::UnboundedSender<WriterCmd>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    local_candidates: Arc<RwLock<Vec<String>>>,
}

impl PeerSession {
    /// Create the peer connection and register transport callbacks. The
    /// session starts in `Idle`.
    pub async fn new(config: &TransportConfig) -> Result<Self> {
        let api = APIBuilder::new().build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            StreamError::TransportFailed(format!("Failed to create peer connection: {}", e))
        })?);

        let shared = Arc::new(Shared::new(Uuid::new_v4()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let media_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> =
            Arc::new(RwLock::new(None));
        let control_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> =
            Arc::new(RwLock::new(None));
        let local_candidates = Arc::new(RwLock::new(Vec::new()));

        let session = Self {
            shared: shared.clone(),
            pc: pc.clone(),
            media_channel: media_channel.clone(),
            control_channel: control_channel.clone(),
            negotiated_codec: StdRwLock::new(None),
            outbound: outbound_tx,
            events_tx: events_tx.clone(),
            events_rx: StdMutex::new(Some(events_rx)),
            local_candidates: local_candidates.clone(),
        };

        session.register_callbacks();
        spawn_writer(shared, media_channel, outbound_rx);

        Ok(session)
    }

    fn register_callbacks(&self) {
        let shared = self.shared.clone();
        let events = self.events_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let event = match state {
                    RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
                    RTCPeerConnectionState::Disconnected => Some(TransportEvent::Disconnected(
                        "peer connection disconnected".to_string(),
                    )),
                    RTCPeerConnectionState::Failed => Some(TransportEvent::Disconnected(
                        "peer connection failed".to_string(),
                    )),
                    RTCPeerConnectionState::Closed => Some(TransportEvent::Closed),
                    _ => None,
                };
                if let Some(event) = event {
                    shared.apply_transport_event(&event);
                    let _ = events.send(SessionEvent::Transport(event));
                }
                Box::pin(async {})
            }));

        let shared = self.shared.clone();
        let events = self.events_tx.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                if state == RTCIceConnectionState::Failed {
                    let event = TransportEvent::IceFailed("ICE connectivity lost".to_string());
                    shared.apply_transport_event(&event);
                    let _ = events.send(SessionEvent::Transport(event));
                }
                Box::pin(async {})
            }));

        let candidates = self.local_candidates.clone();
        let session_id = self.shared.id;
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidates = candidates.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        log::debug!("Session {} gathered candidate: {}", session_id, candidate);
                        candidates.write().await.push(candidate.to_string());
                    }
                })
            }));

        // Channels created by the remote end (answerer path).
        let media_slot = self.media_channel.clone();
        let control_slot = self.control_channel.clone();
        let events = self.events_tx.clone();
        let session_id = self.shared.id;
        self.pc
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let media_slot = media_slot.clone();
                let control_slot = control_slot.clone();
                let events = events.clone();
                Box::pin(async move {
                    match channel.label() {
                        MEDIA_CHANNEL_LABEL => {
                            *media_slot.write().await = Some(channel);
                        }
                        CONTROL_CHANNEL_LABEL => {
                            attach_control_handler(&channel, events, session_id);
                            *control_slot.write().await = Some(channel);
                        }
                        other => {
                            log::debug!(
                                "Session {} ignoring unexpected channel '{}'",
                                session_id,
                                other
                            );
                        }
                    }
                })
            }));
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn negotiated_codec(&self) -> Option<CodecId> {
        *self.negotiated_codec.read().unwrap()
    }

    pub fn set_negotiated_codec(&self, codec: CodecId) {
        *self.negotiated_codec.write().unwrap() = Some(codec);
    }

    /// Start negotiating as the offering side: creates both channels,
    /// then produces a local offer to hand to the signaling layer.
    pub async fn begin_negotiation(&self) -> Result<()> {
        if !self.shared.try_transition(SessionState::Negotiating) {
            return Err(StreamError::InvalidState(format!(
                "cannot negotiate from {}",
                self.state().as_str()
            )));
        }

        // Unreliable but ordered: stale fragments are dropped by the
        // transport instead of being retransmitted.
        let media_init = RTCDataChannelInit {
            ordered: Some(true),
            max_retransmits: Some(0),
            ..Default::default()
        };
        let media = self
            .pc
            .create_data_channel(MEDIA_CHANNEL_LABEL, Some(media_init))
            .await
            .map_err(|e| {
                StreamError::TransportFailed(format!("Failed to create media channel: {}", e))
            })?;
        *self.media_channel.write().await = Some(media);

        let control_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let control = self
            .pc
            .create_data_channel(CONTROL_CHANNEL_LABEL, Some(control_init))
            .await
            .map_err(|e| {
                StreamError::TransportFailed(format!("Failed to create control channel: {}", e))
            })?;
        attach_control_handler(&control, self.events_tx.clone(), self.shared.id);
        *self.control_channel.write().await = Some(control);

        Ok(())
    }

    /// Create an SDP offer and install it as the local description.
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| StreamError::NegotiationError(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                StreamError::NegotiationError(format!("Failed to set local description: {}", e))
            })?;
        Ok(offer.sdp)
    }

    /// Accept a remote offer and answer it (answering side). Transitions
    /// `Idle -> Negotiating` if negotiation has not started yet.
    pub async fn accept_offer(&self, sdp: &str) -> Result<String> {
        if self.state() == SessionState::Idle
            && !self.shared.try_transition(SessionState::Negotiating)
        {
            return Err(StreamError::InvalidState(
                "session left idle concurrently".to_string(),
            ));
        }

        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| StreamError::NegotiationError(format!("Invalid SDP offer: {}", e)))?;
        self.pc.set_remote_description(offer).await.map_err(|e| {
            StreamError::NegotiationError(format!("Failed to set remote description: {}", e))
        })?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| StreamError::NegotiationError(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                StreamError::NegotiationError(format!("Failed to set local description: {}", e))
            })?;
        Ok(answer.sdp)
    }

    /// Accept the remote answer to a previously created offer.
    pub async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| StreamError::NegotiationError(format!("Invalid SDP answer: {}", e)))?;
        self.pc.set_remote_description(answer).await.map_err(|e| {
            StreamError::NegotiationError(format!("Failed to set remote description: {}", e))
        })
    }

    /// Pass a remote ICE candidate through to the transport.
    pub async fn add_remote_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| StreamError::NegotiationError(format!("Failed to add candidate: {}", e)))
    }

    /// Locally gathered candidates, for the signaling layer to forward.
    pub async fn local_candidates(&self) -> Vec<String> {
        self.local_candidates.read().await.clone()
    }

    /// Hand a fragment to the session's writer. Never blocks and never
    /// retries; fragments that cannot be delivered are dropped and
    /// counted.
    pub fn send_media(&self, fragment: Fragment) -> Result<()> {
        let state = self.state();
        if matches!(state, SessionState::Closing | SessionState::Closed) {
            return Err(StreamError::SessionClosed);
        }
        if !state.can_send_media() {
            return Err(StreamError::InvalidState(format!(
                "cannot send media while {}",
                state.as_str()
            )));
        }
        self.outbound
            .send(WriterCmd::Fragment(fragment))
            .map_err(|_| StreamError::SessionClosed)
    }

    /// Send a control message on the reliable channel. Failure is
    /// reported as `ControlDeliveryFailed`; retry policy belongs to the
    /// caller.
    pub async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let state = self.state();
        if matches!(state, SessionState::Closing | SessionState::Closed) {
            return Err(StreamError::SessionClosed);
        }
        if !matches!(state, SessionState::Connected | SessionState::Streaming) {
            return Err(StreamError::InvalidState(format!(
                "cannot send control while {}",
                state.as_str()
            )));
        }

        let channel = self.control_channel.read().await.clone().ok_or_else(|| {
            StreamError::ControlDeliveryFailed("control channel not established".to_string())
        })?;
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(StreamError::ControlDeliveryFailed(
                "control channel not open".to_string(),
            ));
        }

        let wire = message.encode()?;
        channel
            .send(&wire)
            .await
            .map_err(|e| StreamError::ControlDeliveryFailed(e.to_string()))?;
        self.shared.control_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Take the inbound event stream. The owning manager consumes these
    /// at the start of each tick.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Inject a transport event. Exercised by the transport callbacks
    /// and by tests.
    pub fn handle_transport_event(&self, event: &TransportEvent) {
        self.shared.apply_transport_event(event);
    }

    /// Enqueue a session event as if the transport had delivered it.
    /// Lets hosts with custom transports (and tests) feed the same
    /// event path the callbacks use.
    pub fn inject_event(&self, event: SessionEvent) {
        if let SessionEvent::Transport(ref transport) = event {
            self.shared.apply_transport_event(transport);
        }
        let _ = self.events_tx.send(event);
    }

    /// Mark the first successful media handoff.
    pub fn mark_streaming(&self) {
        self.shared.try_transition(SessionState::Streaming);
    }

    /// Record a round-trip sample (exponentially smoothed).
    pub fn record_rtt_sample(&self, sample_ms: u64) {
        let previous = self.shared.rtt_estimate_ms.load(Ordering::Relaxed);
        let next = if previous == u64::MAX {
            sample_ms
        } else {
            (previous * 7 + sample_ms) / 8
        };
        self.shared.rtt_estimate_ms.store(next, Ordering::Relaxed);
    }

    /// Milliseconds since the last successful media send or state
    /// change.
    pub fn idle_ms(&self) -> u64 {
        self.shared
            .now_ms()
            .saturating_sub(self.shared.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> SessionStats {
        let rtt = self.shared.rtt_estimate_ms.load(Ordering::Relaxed);
        SessionStats {
            session_id: self.shared.id,
            state: self.state(),
            negotiated_codec: self.negotiated_codec(),
            fragments_sent: self.shared.fragments_sent.load(Ordering::Relaxed),
            fragments_dropped: self.shared.fragments_dropped.load(Ordering::Relaxed),
            keyframes_sent: self.shared.keyframes_sent.load(Ordering::Relaxed),
            control_sent: self.shared.control_sent.load(Ordering::Relaxed),
            last_keyframe_sequence: self.shared.last_keyframe_sequence.load(Ordering::Relaxed),
            rtt_ms: if rtt == u64::MAX { None } else { Some(rtt) },
        }
    }

    /// Cooperative close: in-flight writer work gets a bounded grace
    /// period, then resources are released regardless.
    pub async fn close(&self, grace: Duration) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        self.shared.try_transition(SessionState::Closing);

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbound.send(WriterCmd::Shutdown(ack_tx)).is_ok() {
            if tokio::time::timeout(grace, ack_rx).await.is_err() {
                log::warn!(
                    "Session {} writer did not stop within {:?}, force-releasing",
                    self.shared.id,
                    grace
                );
            }
        }

        if let Err(e) = self.pc.close().await {
            log::warn!("Session {} peer connection close: {}", self.shared.id, e);
        }

        self.shared.try_transition(SessionState::Closed);
        *self.media_channel.write().await = None;
        *self.control_channel.write().await = None;
        Ok(())
    }
}

/// Attach the inbound decoder to a control channel.
fn attach_control_handler(
    channel: &Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<SessionEvent>,
    session_id: Uuid,
) {
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        match ControlMessage::decode(&msg.data) {
            Ok(message) => {
                let _ = events.send(SessionEvent::Control(message));
            }
            Err(e) => {
                log::warn!("Session {} dropped malformed control message: {}", session_id, e);
            }
        }
        Box::pin(async {})
    }));
}

/// Drains the outbound fragment queue onto the media channel. Fragments
/// of one chunk leave in index order; anything not deliverable right now
/// is dropped.
fn spawn_writer(
    shared: Arc<Shared>,
    media_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
) {
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let fragment = match cmd {
                WriterCmd::Shutdown(ack) => {
                    let _ = ack.send(());
                    break;
                }
                WriterCmd::Fragment(fragment) => fragment,
            };

            if !shared.state().can_send_media() {
                shared.fragments_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let channel = media_channel.read().await.clone();
            let open = channel
                .as_ref()
                .map(|ch| ch.ready_state() == RTCDataChannelState::Open)
                .unwrap_or(false);
            if !open {
                shared.fragments_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let channel = match channel {
                Some(channel) => channel,
                None => continue,
            };
            let wire: Bytes = fragment.to_wire();
            match channel.send(&wire).await {
                Ok(_) => {
                    shared.fragments_sent.fetch_add(1, Ordering::Relaxed);
                    shared.touch_activity();
                    if fragment.is_keyframe && fragment.fragment_index == 0 {
                        shared.keyframes_sent.fetch_add(1, Ordering::Relaxed);
                        shared
                            .last_keyframe_sequence
                            .store(fragment.chunk_sequence as u64, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    shared.fragments_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Session {} media send failed: {}", shared.id, e);
                }
            }
        }
        log::debug!("Session {} writer stopped", shared.id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::tags;
    use bytes::Bytes;
    use serde_json::json;

    fn transport_config() -> TransportConfig {
        TransportConfig {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            max_fragment_size: 1024,
            control_retry_limit: 2,
            session_idle_timeout_ms: 5000,
            close_grace_ms: 100,
        }
    }

    fn fragment() -> Fragment {
        Fragment {
            chunk_sequence: 1,
            fragment_index: 0,
            fragment_count: 1,
            is_keyframe: true,
            codec: CodecId::H264,
            timestamp_ms: 0,
            payload: Bytes::from_static(b"data"),
        }
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(transition_allowed(Idle, Negotiating));
        assert!(transition_allowed(Negotiating, Connected));
        assert!(transition_allowed(Connected, Streaming));
        assert!(transition_allowed(Streaming, Failed));
        assert!(transition_allowed(Failed, Closing));
        assert!(transition_allowed(Closing, Closed));

        assert!(!transition_allowed(Idle, Connected));
        assert!(!transition_allowed(Closed, Negotiating));
        assert!(!transition_allowed(Failed, Streaming));
        assert!(!transition_allowed(Closed, Closing));
    }

    #[tokio::test]
    async fn test_session_starts_idle() {
        let session = PeerSession::new(&transport_config()).await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.negotiated_codec().is_none());
    }

    #[tokio::test]
    async fn test_negotiation_produces_offer() {
        let session = PeerSession::new(&transport_config()).await.unwrap();
        session.begin_negotiation().await.unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);

        let offer = session.create_offer().await.unwrap();
        assert!(offer.contains("v=0"), "offer should be valid SDP");
    }

    #[tokio::test]
    async fn test_double_negotiation_rejected() {
        let session = PeerSession::new(&transport_config()).await.unwrap();
        session.begin_negotiation().await.unwrap();
        assert!(session.begin_negotiation().await.is_err());
    }

    #[tokio::test]
    async fn test_failure_from_any_live_state_blocks_sends() {
        for setup in ["negotiating", "connected", "streaming"] {
            let session = PeerSession::new(&transport_config()).await.unwrap();
            session.begin_negotiation().await.unwrap();
            if setup != "negotiating" {
                session.handle_transport_event(&TransportEvent::Connected);
            }
            if setup == "streaming" {
                session.mark_streaming();
            }

            session
                .handle_transport_event(&TransportEvent::Disconnected("test".to_string()));
            assert_eq!(session.state(), SessionState::Failed, "from {}", setup);

            assert!(session.send_media(fragment()).is_err());
            let msg = ControlMessage::new(tags::REQUEST_KEYFRAME, json!({}));
            assert!(session.send_control(&msg).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_media_send_requires_connection() {
        let session = PeerSession::new(&transport_config()).await.unwrap();
        assert!(session.send_media(fragment()).is_err());

        session.begin_negotiation().await.unwrap();
        assert!(session.send_media(fragment()).is_err());

        session.handle_transport_event(&TransportEvent::Connected);
        // Accepted for delivery; the writer drops it since no channel is
        // open, but the caller does not block or fail.
        assert!(session.send_media(fragment()).is_ok());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let session = PeerSession::new(&transport_config()).await.unwrap();
        session.begin_negotiation().await.unwrap();
        session.handle_transport_event(&TransportEvent::Connected);

        session.close(Duration::from_millis(100)).await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        assert!(matches!(
            session.send_media(fragment()),
            Err(StreamError::SessionClosed)
        ));
        let msg = ControlMessage::new(tags::REQUEST_KEYFRAME, json!({}));
        assert!(matches!(
            session.send_control(&msg).await,
            Err(StreamError::SessionClosed)
        ));

        // Closing twice is fine.
        session.close(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ice_failure_fails_session() {
        let session = PeerSession::new(&transport_config()).await.unwrap();
        session.begin_negotiation().await.unwrap();
        session.handle_transport_event(&TransportEvent::IceFailed("no route".to_string()));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_rtt_smoothing() {
        let session = PeerSession::new(&transport_config()).await.unwrap();
        assert_eq!(session.stats().rtt_ms, None);

        session.record_rtt_sample(40);
        assert_eq!(session.stats().rtt_ms, Some(40));

        session.record_rtt_sample(80);
        let smoothed = session.stats().rtt_ms.unwrap();
        assert!(smoothed > 40 && smoothed < 80);
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_sessions() {
        let offerer = PeerSession::new(&transport_config()).await.unwrap();
        let answerer = PeerSession::new(&transport_config()).await.unwrap();

        offerer.begin_negotiation().await.unwrap();
        let offer = offerer.create_offer().await.unwrap();

        let answer = answerer.accept_offer(&offer).await.unwrap();
        assert!(answer.contains("v=0"));
        assert_eq!(answerer.state(), SessionState::Negotiating);

        offerer.accept_answer(&answer).await.unwrap();
    }
}
