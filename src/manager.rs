//! Top-level session management.
//!
//! `SessionManager` owns one peer session, encoder, frame queue, and
//! capture context per remote peer, and drives the
//! dequeue→encode→packetize→send pass for every active session once per
//! render tick. A misbehaving session is isolated and closed; it never
//! stops the others from ticking.

use crate::capture::{CaptureContext, RenderTargetView};
use crate::config::StreamPluginConfig;
use crate::control::{ControlCommand, ControlRouter, TelemetryReport};
use crate::encode::{EncoderBackend, EncoderSettings, VideoEncoder};
use crate::errors::{Result, StreamError};
use crate::packetize::Packetizer;
use crate::peer::{PeerSession, SessionEvent, SessionState, TransportEvent};
use crate::queue::FrameQueue;
use crate::timing::PtsClock;
use crate::types::PixelFormat;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a session was closed; carried in logs and close bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The host asked for the session to end.
    HostRequest,
    /// The remote peer sent a terminate command.
    RemoteTerminate,
    /// The transport reported an unrecoverable failure.
    TransportFailure,
    /// Encoder stall escalation exhausted its restarts.
    EncoderFailure,
    /// No deliverable media within the configured timeout.
    IdleTimeout,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            CloseReason::HostRequest => "host request",
            CloseReason::RemoteTerminate => "remote terminate",
            CloseReason::TransportFailure => "transport failure",
            CloseReason::EncoderFailure => "encoder failure",
            CloseReason::IdleTimeout => "idle timeout",
        };
        f.write_str(reason)
    }
}

/// Transport counters plus pipeline-side counters for one session.
#[derive(Debug, Clone)]
pub struct ManagedSessionStats {
    pub transport: crate::peer::SessionStats,
    pub frames_captured: u64,
    pub frames_dropped_queue: u64,
    pub frames_dropped_pool: u64,
}

/// Handler invoked for every inbound input event, outside the media
/// path. The host forwards these into its simulation loop.
pub type InputHandler = Box<dyn Fn(Uuid, serde_json::Value) + Send + Sync>;

struct ManagedSession {
    session: Arc<PeerSession>,
    queue: Arc<FrameQueue>,
    capture: Arc<CaptureContext>,
    encoder: StdMutex<VideoEncoder>,
    packetizer: Packetizer,
    events: StdMutex<mpsc::UnboundedReceiver<SessionEvent>>,
    stall_strikes: AtomicU32,
    restart_failures: AtomicU32,
    frames_since_keyframe: AtomicU32,
}

/// Owns and drives all streaming sessions for one plugin instance.
pub struct SessionManager {
    config: StreamPluginConfig,
    clock: PtsClock,
    sessions: StdRwLock<HashMap<Uuid, Arc<ManagedSession>>>,
    router: ControlRouter,
    input_handler: StdRwLock<Option<InputHandler>>,
    tick_count: AtomicU64,
}

impl SessionManager {
    pub fn new(config: StreamPluginConfig) -> Result<Self> {
        config.validate()?;
        let router = ControlRouter::new(config.transport.control_retry_limit);
        Ok(Self {
            config,
            clock: PtsClock::new(),
            sessions: StdRwLock::new(HashMap::new()),
            router,
            input_handler: StdRwLock::new(None),
            tick_count: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StreamPluginConfig {
        &self.config
    }

    /// Install the handler receiving inbound input events.
    pub fn set_input_handler<F>(&self, handler: F)
    where
        F: Fn(Uuid, serde_json::Value) + Send + Sync + 'static,
    {
        *self.input_handler.write().unwrap() = Some(Box::new(handler));
    }

    /// Create a session with an encoder selected from the configured
    /// codec preference list.
    pub async fn create_session(&self) -> Result<Uuid> {
        let settings = EncoderSettings::from_config(&self.config.video);
        let encoder = VideoEncoder::configure(&self.config.video.codec_preference, settings)?;
        self.add_session(encoder).await
    }

    /// Create a session around a caller-supplied backend. Used by tests
    /// to run the full pipeline against the synthetic encoder.
    pub async fn create_session_with_backend(
        &self,
        backend: Box<dyn EncoderBackend>,
    ) -> Result<Uuid> {
        let settings = EncoderSettings::from_config(&self.config.video);
        let encoder = VideoEncoder::with_backend(backend, settings);
        self.add_session(encoder).await
    }

    async fn add_session(&self, encoder: VideoEncoder) -> Result<Uuid> {
        let session = Arc::new(PeerSession::new(&self.config.transport).await?);
        session.set_negotiated_codec(encoder.codec());
        let events = session.take_events().ok_or_else(|| {
            StreamError::InvalidState("session event stream already taken".to_string())
        })?;

        let queue = Arc::new(FrameQueue::new(self.config.pipeline.queue_capacity));
        let [width, height] = self.config.video.resolution;
        let capture = Arc::new(CaptureContext::new(
            queue.clone(),
            self.config.pipeline.pool_capacity,
            PixelFormat::Rgb24.buffer_size(width, height),
            Duration::from_millis(self.config.pipeline.pool_acquire_timeout_ms),
            PtsClock::from_instant(self.clock.start()),
        ));

        let id = session.id();
        let managed = Arc::new(ManagedSession {
            session,
            queue,
            capture,
            encoder: StdMutex::new(encoder),
            packetizer: Packetizer::new(self.config.transport.max_fragment_size),
            events: StdMutex::new(events),
            stall_strikes: AtomicU32::new(0),
            restart_failures: AtomicU32::new(0),
            frames_since_keyframe: AtomicU32::new(0),
        });

        self.sessions.write().unwrap().insert(id, managed);
        log::info!("Created session {}", id);
        Ok(id)
    }

    fn get(&self, id: Uuid) -> Result<Arc<ManagedSession>> {
        self.sessions
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StreamError::InvalidState(format!("unknown session {}", id)))
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().unwrap().keys().copied().collect()
    }

    /// Direct handle to a session, for hosts that drive negotiation or
    /// transport events themselves.
    pub fn session_handle(&self, id: Uuid) -> Option<Arc<PeerSession>> {
        self.sessions
            .read()
            .unwrap()
            .get(&id)
            .map(|m| m.session.clone())
    }

    pub fn session_state(&self, id: Uuid) -> Option<SessionState> {
        self.sessions
            .read()
            .unwrap()
            .get(&id)
            .map(|m| m.session.state())
    }

    pub fn session_stats(&self, id: Uuid) -> Option<ManagedSessionStats> {
        self.sessions.read().unwrap().get(&id).map(|m| ManagedSessionStats {
            transport: m.session.stats(),
            frames_captured: m.capture.frames_captured(),
            frames_dropped_queue: m.queue.dropped_count(),
            frames_dropped_pool: m.capture.pool_dropped(),
        })
    }

    // Negotiation pass-through. The payloads are opaque; the signaling
    // transport that carries them is the host's concern.

    pub async fn begin_negotiation(&self, id: Uuid) -> Result<()> {
        self.get(id)?.session.begin_negotiation().await
    }

    pub async fn create_offer(&self, id: Uuid) -> Result<String> {
        self.get(id)?.session.create_offer().await
    }

    pub async fn accept_offer(&self, id: Uuid, sdp: &str) -> Result<String> {
        self.get(id)?.session.accept_offer(sdp).await
    }

    pub async fn accept_answer(&self, id: Uuid, sdp: &str) -> Result<()> {
        self.get(id)?.session.accept_answer(sdp).await
    }

    pub async fn add_remote_candidate(
        &self,
        id: Uuid,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        self.get(id)?
            .session
            .add_remote_candidate(candidate, sdp_mid, sdp_mline_index)
            .await
    }

    pub async fn local_candidates(&self, id: Uuid) -> Result<Vec<String>> {
        Ok(self.get(id)?.session.local_candidates().await)
    }

    /// Latch a host-side keyframe request for a session.
    pub fn request_keyframe(&self, id: Uuid) -> Result<()> {
        self.get(id)?.queue.request_keyframe();
        Ok(())
    }

    /// Capture callback: copy the rendered frame into every session that
    /// can currently stream it. The render-target view is not retained.
    pub fn on_frame_captured(&self, view: &RenderTargetView<'_>) {
        let sessions: Vec<Arc<ManagedSession>> =
            self.sessions.read().unwrap().values().cloned().collect();
        for managed in sessions {
            if !managed.session.state().can_send_media() {
                continue;
            }
            if let Err(e) = managed.capture.on_frame(view) {
                log::warn!(
                    "Session {} rejected captured frame: {}",
                    managed.session.id(),
                    e
                );
            }
        }
    }

    /// Drive one pipeline pass for every active session. Call once per
    /// render tick. Per-session failures are contained here.
    pub async fn tick(&self) {
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        let sessions: Vec<Arc<ManagedSession>> =
            self.sessions.read().unwrap().values().cloned().collect();

        for managed in sessions {
            let id = managed.session.id();
            if let Err(e) = self.tick_session(&managed, tick).await {
                log::warn!("Session {} tick error: {}", id, e);
            }
        }
    }

    async fn tick_session(&self, managed: &Arc<ManagedSession>, tick: u64) -> Result<()> {
        let session = &managed.session;

        // Inbound events first: they were queued by the transport
        // callbacks and must not race the encode work below.
        let commands = drain_commands(managed, &self.router);
        for command in commands {
            match command {
                ControlCommand::RequestKeyframe => managed.queue.request_keyframe(),
                ControlCommand::SetBitrate { bitrate_kbps } => {
                    if let Err(e) = managed.encoder.lock().unwrap().set_bitrate(bitrate_kbps) {
                        log::warn!("Session {} bitrate change failed: {}", session.id(), e);
                    }
                }
                ControlCommand::SetResolution { width, height } => {
                    let result = managed
                        .encoder
                        .lock()
                        .unwrap()
                        .set_resolution(crate::types::Resolution::new(width, height));
                    if let Err(e) = result {
                        log::warn!("Session {} resolution change failed: {}", session.id(), e);
                    }
                }
                ControlCommand::InputEvent { payload } => {
                    if let Some(handler) = self.input_handler.read().unwrap().as_ref() {
                        handler(session.id(), payload);
                    }
                }
                ControlCommand::SessionTerminate => {
                    self.close_session(session.id(), CloseReason::RemoteTerminate)
                        .await?;
                    return Ok(());
                }
                ControlCommand::Unknown { .. } => {}
            }
        }

        match session.state() {
            SessionState::Failed => {
                self.close_session(session.id(), CloseReason::TransportFailure)
                    .await?;
                return Ok(());
            }
            state if !state.can_send_media() => return Ok(()),
            _ => {}
        }

        // Dead peer: nothing deliverable for too long.
        if session.idle_ms() > self.config.transport.session_idle_timeout_ms {
            session.handle_transport_event(&TransportEvent::Disconnected(
                "no deliverable media within timeout".to_string(),
            ));
            self.close_session(session.id(), CloseReason::IdleTimeout)
                .await?;
            return Ok(());
        }

        let mut handed_off = false;
        for _ in 0..self.config.pipeline.max_frames_per_tick {
            let Some(queued) = managed.queue.dequeue() else {
                break;
            };

            let cadence_due = managed.frames_since_keyframe.load(Ordering::Relaxed)
                >= self.config.video.keyframe_interval;
            let force_keyframe = queued.force_keyframe || cadence_due;

            let submit_result = managed
                .encoder
                .lock()
                .unwrap()
                .submit(&queued.frame, force_keyframe);
            managed.frames_since_keyframe.fetch_add(1, Ordering::Relaxed);

            match submit_result {
                Ok(chunks) => {
                    if chunks.is_empty() {
                        continue;
                    }
                    managed.stall_strikes.store(0, Ordering::Relaxed);
                    managed.restart_failures.store(0, Ordering::Relaxed);

                    for chunk in chunks {
                        if chunk.is_keyframe {
                            managed.frames_since_keyframe.store(0, Ordering::Relaxed);
                        }
                        for fragment in managed.packetizer.split(&chunk)? {
                            match session.send_media(fragment) {
                                Ok(()) => handed_off = true,
                                Err(e) => {
                                    log::debug!(
                                        "Session {} media handoff stopped: {}",
                                        session.id(),
                                        e
                                    );
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(StreamError::EncoderStalled(submissions)) => {
                    let strikes = managed.stall_strikes.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!(
                        "Session {} encoder stalled after {} submissions (strike {})",
                        session.id(),
                        submissions,
                        strikes
                    );
                    if strikes >= 2 {
                        session.handle_transport_event(&TransportEvent::Disconnected(
                            "encoder stalled repeatedly".to_string(),
                        ));
                        self.close_session(session.id(), CloseReason::EncoderFailure)
                            .await?;
                        return Ok(());
                    }

                    let restart = managed.encoder.lock().unwrap().restart();
                    if let Err(e) = restart {
                        let failures =
                            managed.restart_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        log::warn!(
                            "Session {} encoder restart failed ({}): {}",
                            session.id(),
                            failures,
                            e
                        );
                        if failures >= 2 {
                            session.handle_transport_event(&TransportEvent::Disconnected(
                                "encoder restart failed twice".to_string(),
                            ));
                            self.close_session(session.id(), CloseReason::EncoderFailure)
                                .await?;
                            return Ok(());
                        }
                    } else {
                        managed.restart_failures.store(0, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    // Bad frame or transient backend error; skip the
                    // frame, keep the session.
                    log::warn!("Session {} encode error: {}", session.id(), e);
                }
            }
        }

        if handed_off {
            session.mark_streaming();
        }

        if tick % self.config.pipeline.telemetry_interval_ticks == 0
            && session.state().can_send_media()
        {
            self.emit_telemetry(managed);
        }

        Ok(())
    }

    /// Emit a telemetry report on the control channel, off the tick
    /// path.
    fn emit_telemetry(&self, managed: &Arc<ManagedSession>) {
        let stats = managed.session.stats();
        let report = TelemetryReport {
            session_id: stats.session_id,
            rtt_ms: stats.rtt_ms,
            frames_dropped: managed.queue.dropped_count() + managed.capture.pool_dropped(),
            fragments_sent: stats.fragments_sent,
            fragments_dropped: stats.fragments_dropped,
            keyframes_sent: stats.keyframes_sent,
        };
        let message = match report.to_message() {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Telemetry encode failed: {}", e);
                return;
            }
        };

        let session = managed.session.clone();
        let router = self.router.clone();
        tokio::spawn(async move {
            if let Err(e) = router.send_with_retry(&session, &message).await {
                log::debug!("Session {} telemetry dropped: {}", session.id(), e);
            }
        });
    }

    /// Close one session: no media or control traffic is sent after this
    /// returns. Queued frames are discarded.
    pub async fn close_session(&self, id: Uuid, reason: CloseReason) -> Result<()> {
        let managed = self
            .sessions
            .write()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| StreamError::InvalidState(format!("unknown session {}", id)))?;

        let drained = managed.queue.clear();
        if drained > 0 {
            log::debug!("Session {} discarded {} queued frames", id, drained);
        }

        managed
            .session
            .close(Duration::from_millis(self.config.transport.close_grace_ms))
            .await?;
        log::info!("Closed session {} ({})", id, reason);
        Ok(())
    }

    /// Tear down every session.
    pub async fn close_all(&self, reason: CloseReason) {
        for id in self.session_ids() {
            if let Err(e) = self.close_session(id, reason).await {
                log::warn!("Closing session {}: {}", id, e);
            }
        }
    }
}

/// Pull queued inbound events and decode them into commands without
/// holding the receiver lock across any await point.
fn drain_commands(managed: &Arc<ManagedSession>, router: &ControlRouter) -> Vec<ControlCommand> {
    let mut commands = Vec::new();
    let mut events = managed.events.lock().unwrap();
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Transport(event) => {
                // State was already applied on the callback boundary.
                log::debug!(
                    "Session {} transport event: {:?}",
                    managed.session.id(),
                    event
                );
            }
            SessionEvent::Control(message) => commands.push(router.dispatch(&message)),
        }
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SyntheticBackend;
    use crate::types::CodecId;

    fn test_config() -> StreamPluginConfig {
        let mut config = StreamPluginConfig::default();
        config.video.resolution = [32, 32];
        config.video.stall_threshold = 1;
        config.pipeline.queue_capacity = 4;
        config.pipeline.pool_capacity = 8;
        config.transport.session_idle_timeout_ms = 60_000;
        config
    }

    #[tokio::test]
    async fn test_create_and_close_session() {
        let manager = SessionManager::new(test_config()).unwrap();
        let id = manager
            .create_session_with_backend(Box::new(SyntheticBackend::new(CodecId::H264)))
            .await
            .unwrap();

        assert_eq!(manager.session_state(id), Some(SessionState::Idle));
        assert_eq!(manager.session_ids(), vec![id]);

        manager
            .close_session(id, CloseReason::HostRequest)
            .await
            .unwrap();
        assert!(manager.session_state(id).is_none());
    }

    #[tokio::test]
    async fn test_close_unknown_session_errors() {
        let manager = SessionManager::new(test_config()).unwrap();
        assert!(manager
            .close_session(Uuid::new_v4(), CloseReason::HostRequest)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_tick_with_no_sessions_is_noop() {
        let manager = SessionManager::new(test_config()).unwrap();
        manager.tick().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.pipeline.queue_capacity = 0;
        assert!(SessionManager::new(config).is_err());
    }
}
