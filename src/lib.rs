//! Framecast: remote-rendering stream pipeline for real-time 3D engines
//!
//! This crate moves rendered frames from a host engine's render pipeline
//! to remote peers as a compressed video stream over WebRTC, and routes
//! inbound control/input messages back toward the simulation loop.
//!
//! # Features
//! - Non-blocking frame capture with pooled buffers and drop-oldest
//!   backpressure
//! - Polymorphic encoder backends: hardware-accelerated (FFmpeg
//!   NVENC/QSV/AMF/VAAPI) and software (openh264), selected per
//!   configuration
//! - Deterministic chunk fragmentation for the unreliable-ordered media
//!   channel
//! - Reliable-ordered control channel with a tagged, forward-compatible
//!   wire format
//! - Per-session failure isolation under a single session manager
//!
//! # Usage
//! ```rust,ignore
//! use framecast::{SessionManager, StreamPluginConfig};
//!
//! # async fn run() -> Result<(), framecast::StreamError> {
//! let manager = SessionManager::new(StreamPluginConfig::load_or_default())?;
//! let session = manager.create_session().await?;
//! manager.begin_negotiation(session).await?;
//! let offer = manager.create_offer(session).await?;
//! // ... exchange offer/answer/candidates over your signaling layer,
//! // then once per render tick:
//! //   manager.on_frame_captured(&view);
//! //   manager.tick().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod control;
pub mod encode;
pub mod errors;
pub mod manager;
pub mod packetize;
pub mod peer;
pub mod queue;
pub mod timing;
pub mod types;

// Testing utilities - synthetic frames and a deterministic encoder
// backend for offline tests
pub mod testing;

// Re-exports for convenience
pub use capture::{CaptureContext, CaptureOutcome, FramePool, RenderTargetView};
pub use config::{BackendKind, CodecPreference, StreamPluginConfig};
pub use control::{ControlCommand, ControlMessage, ControlRouter, TelemetryReport};
pub use encode::{EncoderBackend, EncoderSettings, VideoEncoder};
pub use errors::{Result, StreamError};
pub use manager::{CloseReason, SessionManager};
pub use packetize::{Packetizer, Reassembler};
pub use peer::{PeerSession, SessionState, TransportEvent};
pub use queue::FrameQueue;
pub use types::{CodecId, EncodedChunk, Fragment, Frame, PixelFormat, Resolution};

/// Initialize logging for the streaming pipeline
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "framecast=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}
