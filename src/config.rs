//! Configuration management for Framecast
//!
//! Provides configuration loading, saving, and validation for codec
//! selection, transport limits, and pipeline sizing.

use crate::errors::StreamError;
use crate::types::CodecId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which kind of encoder backend a preference entry selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hardware-accelerated encoder (NVENC/QSV/AMF/VAAPI via FFmpeg).
    Hardware,
    /// CPU encoder (openh264).
    Software,
}

/// One entry in the ordered codec preference list.
///
/// The first entry whose backend initializes wins; hardware entries are
/// conventionally listed before their software fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPreference {
    pub codec: CodecId,
    pub backend: BackendKind,
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPluginConfig {
    pub video: VideoConfig,
    pub transport: TransportConfig,
    pub pipeline: PipelineConfig,
}

/// Encoder and stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Target bitrate in kbps
    pub target_bitrate_kbps: u32,
    /// Stream resolution [width, height]; captured frames are adapted to it
    pub resolution: [u32; 2],
    /// Nominal frames per second
    pub fps: u32,
    /// Keyframe cadence in frames
    pub keyframe_interval: u32,
    /// Encoder outputs larger than this are segmented into multiple chunks
    pub max_chunk_size: usize,
    /// Consecutive empty submissions before the backend counts as stalled
    pub stall_threshold: u32,
    /// Ordered backend preference; first to initialize is used.
    pub codec_preference: Vec<CodecPreference>,
}

/// Peer-connection and channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// Maximum media fragment payload size in bytes
    pub max_fragment_size: usize,
    /// Bounded retry count for reliable control sends
    pub control_retry_limit: u32,
    /// A session with no deliverable media for this long is a dead peer
    pub session_idle_timeout_ms: u64,
    /// Grace period for in-flight work during session close
    pub close_grace_ms: u64,
}

/// Frame queue and buffer pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frame queue capacity per session
    pub queue_capacity: usize,
    /// Number of reusable frame buffers per session
    pub pool_capacity: usize,
    /// Bounded wait for a free buffer before the frame is dropped
    pub pool_acquire_timeout_ms: u64,
    /// Upper bound on frames drained per session per tick
    pub max_frames_per_tick: usize,
    /// Telemetry is emitted every this many ticks, never per frame
    pub telemetry_interval_ticks: u64,
}

impl Default for StreamPluginConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig {
                target_bitrate_kbps: 4000,
                resolution: [1280, 720],
                fps: 60,
                keyframe_interval: 120,
                max_chunk_size: 256 * 1024,
                stall_threshold: 8,
                codec_preference: vec![
                    CodecPreference {
                        codec: CodecId::H264,
                        backend: BackendKind::Hardware,
                    },
                    CodecPreference {
                        codec: CodecId::H264,
                        backend: BackendKind::Software,
                    },
                ],
            },
            transport: TransportConfig {
                ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
                max_fragment_size: 16 * 1024,
                control_retry_limit: 3,
                session_idle_timeout_ms: 5000,
                close_grace_ms: 500,
            },
            pipeline: PipelineConfig {
                queue_capacity: 4,
                pool_capacity: 6,
                pool_acquire_timeout_ms: 5,
                max_frames_per_tick: 2,
                telemetry_interval_ticks: 120,
            },
        }
    }
}

impl StreamPluginConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| StreamError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: StreamPluginConfig = toml::from_str(&contents)
            .map_err(|e| StreamError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), StreamError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StreamError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| StreamError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| StreamError::ConfigError(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("framecast.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.video.codec_preference.is_empty() {
            return Err(StreamError::ConfigError(
                "Codec preference list must not be empty".to_string(),
            ));
        }
        if self.video.resolution[0] == 0 || self.video.resolution[1] == 0 {
            return Err(StreamError::ConfigError(
                "Invalid stream resolution".to_string(),
            ));
        }
        if self.video.fps == 0 || self.video.fps > 240 {
            return Err(StreamError::ConfigError(
                "FPS must be between 1 and 240".to_string(),
            ));
        }
        if self.video.keyframe_interval == 0 {
            return Err(StreamError::ConfigError(
                "Keyframe interval must be at least 1".to_string(),
            ));
        }
        if self.video.max_chunk_size == 0 {
            return Err(StreamError::ConfigError(
                "Max chunk size must be nonzero".to_string(),
            ));
        }
        if self.video.stall_threshold == 0 {
            return Err(StreamError::ConfigError(
                "Stall threshold must be at least 1".to_string(),
            ));
        }
        if self.transport.max_fragment_size == 0 {
            return Err(StreamError::ConfigError(
                "Max fragment size must be nonzero".to_string(),
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(StreamError::ConfigError(
                "Queue capacity must be at least 1".to_string(),
            ));
        }
        if self.pipeline.pool_capacity < self.pipeline.queue_capacity {
            return Err(StreamError::ConfigError(
                "Pool capacity must be at least the queue capacity".to_string(),
            ));
        }
        if self.pipeline.max_frames_per_tick == 0 {
            return Err(StreamError::ConfigError(
                "Max frames per tick must be at least 1".to_string(),
            ));
        }
        if self.pipeline.telemetry_interval_ticks == 0 {
            return Err(StreamError::ConfigError(
                "Telemetry interval must be at least 1 tick".to_string(),
            ));
        }
        Ok(())
    }
}
