//! Video encoding with pluggable backends.
//!
//! `VideoEncoder` walks the configured codec preference list and wraps
//! the first backend that initializes. Backends are polymorphic behind
//! `EncoderBackend`: a hardware-accelerated suite, a software codec, and
//! a deterministic synthetic one for offline tests (see
//! [`crate::testing`]).

#[cfg(feature = "hardware-codec")]
pub mod hardware;
#[cfg(feature = "software-codec")]
pub mod software;

use crate::config::{BackendKind, CodecPreference, VideoConfig};
use crate::errors::{Result, StreamError};
use crate::types::{CodecId, EncodedChunk, Frame, Resolution};
use bytes::Bytes;

/// Runtime encoder settings, derived from [`VideoConfig`] and mutated by
/// control commands.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub resolution: Resolution,
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub keyframe_interval: u32,
    pub max_chunk_size: usize,
    pub stall_threshold: u32,
}

impl EncoderSettings {
    pub fn from_config(video: &VideoConfig) -> Self {
        Self {
            resolution: Resolution::new(video.resolution[0], video.resolution[1]),
            bitrate_kbps: video.target_bitrate_kbps,
            fps: video.fps,
            keyframe_interval: video.keyframe_interval,
            max_chunk_size: video.max_chunk_size,
            stall_threshold: video.stall_threshold,
        }
    }
}

/// Raw output unit from a backend, before sequencing and segmentation.
#[derive(Debug, Clone)]
pub struct BackendChunk {
    pub payload: Vec<u8>,
    pub is_keyframe: bool,
    pub timestamp_ms: u64,
}

/// A single encoder implementation.
///
/// `encode` may buffer frames internally (lookahead) and return chunks
/// for an earlier frame on a later call; an empty return is not an
/// error by itself.
pub trait EncoderBackend: Send {
    fn codec(&self) -> CodecId;
    fn name(&self) -> &str;

    /// Encode one frame. `force_keyframe` makes the output of this
    /// submission intra-only.
    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Vec<BackendChunk>>;

    /// Adjust the target bitrate without recreating the codec.
    fn set_bitrate(&mut self, bitrate_kbps: u32) -> Result<()>;

    /// Re-initialize the codec with new settings (resolution changes).
    fn reconfigure(&mut self, settings: &EncoderSettings) -> Result<()>;

    /// Tear down and recreate the underlying codec after a stall.
    fn restart(&mut self) -> Result<()>;
}

#[cfg(feature = "software-codec")]
fn create_software(codec: CodecId, settings: &EncoderSettings) -> Result<Box<dyn EncoderBackend>> {
    if codec != CodecId::H264 {
        return Err(StreamError::CodecUnavailable(format!(
            "Software backend only encodes h264, not {}",
            codec
        )));
    }
    Ok(Box::new(software::SoftwareEncoder::new(settings)?))
}

#[cfg(not(feature = "software-codec"))]
fn create_software(codec: CodecId, _settings: &EncoderSettings) -> Result<Box<dyn EncoderBackend>> {
    Err(StreamError::CodecUnavailable(format!(
        "Software {} backend not compiled in (enable the software-codec feature)",
        codec
    )))
}

#[cfg(feature = "hardware-codec")]
fn create_hardware(codec: CodecId, settings: &EncoderSettings) -> Result<Box<dyn EncoderBackend>> {
    Ok(Box::new(hardware::HardwareEncoder::new(codec, settings)?))
}

#[cfg(not(feature = "hardware-codec"))]
fn create_hardware(codec: CodecId, _settings: &EncoderSettings) -> Result<Box<dyn EncoderBackend>> {
    Err(StreamError::CodecUnavailable(format!(
        "Hardware {} backend not compiled in (enable the hardware-codec feature)",
        codec
    )))
}

/// Instantiate the backend described by one preference entry.
pub fn create_backend(
    preference: &CodecPreference,
    settings: &EncoderSettings,
) -> Result<Box<dyn EncoderBackend>> {
    match preference.backend {
        BackendKind::Software => create_software(preference.codec, settings),
        BackendKind::Hardware => create_hardware(preference.codec, settings),
    }
}

/// Encoder facade owned by one session: backend selection, chunk
/// sequencing, stall detection, and oversized-output segmentation.
pub struct VideoEncoder {
    backend: Box<dyn EncoderBackend>,
    settings: EncoderSettings,
    sequence: u64,
    force_keyframe: bool,
    empty_submissions: u32,
}

// The trait-object backend field blocks `#[derive(Debug)]`; this hand
// impl provides the `Debug` bound the tests rely on (e.g. `unwrap_err`)
// by printing the backend's name rather than the object itself.
impl std::fmt::Debug for VideoEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoEncoder")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .field("sequence", &self.sequence)
            .field("force_keyframe", &self.force_keyframe)
            .field("empty_submissions", &self.empty_submissions)
            .finish()
    }
}

impl VideoEncoder {
    /// Select the first backend from the preference list that
    /// initializes. Fails with `CodecUnavailable` only when every entry
    /// fails.
    pub fn configure(preferences: &[CodecPreference], settings: EncoderSettings) -> Result<Self> {
        let mut failures = Vec::new();
        for preference in preferences {
            match create_backend(preference, &settings) {
                Ok(backend) => {
                    log::info!(
                        "Selected {} backend '{}' for {} at {} kbps",
                        match preference.backend {
                            BackendKind::Hardware => "hardware",
                            BackendKind::Software => "software",
                        },
                        backend.name(),
                        backend.codec(),
                        settings.bitrate_kbps
                    );
                    return Ok(Self::with_backend(backend, settings));
                }
                Err(err) => {
                    log::debug!(
                        "Backend {:?}/{} unavailable: {}",
                        preference.backend,
                        preference.codec,
                        err
                    );
                    failures.push(format!("{:?}/{}: {}", preference.backend, preference.codec, err));
                }
            }
        }
        Err(StreamError::CodecUnavailable(failures.join("; ")))
    }

    /// Wrap an already-built backend. Used by tests to inject the
    /// synthetic backend.
    pub fn with_backend(backend: Box<dyn EncoderBackend>, settings: EncoderSettings) -> Self {
        Self {
            backend,
            settings,
            sequence: 0,
            force_keyframe: false,
            empty_submissions: 0,
        }
    }

    pub fn codec(&self) -> CodecId {
        self.backend.codec()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Force the next submission's output to be intra-only.
    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    pub fn set_bitrate(&mut self, bitrate_kbps: u32) -> Result<()> {
        self.backend.set_bitrate(bitrate_kbps)?;
        self.settings.bitrate_kbps = bitrate_kbps;
        log::info!("Encoder bitrate set to {} kbps", bitrate_kbps);
        Ok(())
    }

    /// Change the stream resolution. The backend is re-initialized and
    /// the next output is forced to a keyframe so the receiver can
    /// resynchronize.
    pub fn set_resolution(&mut self, resolution: Resolution) -> Result<()> {
        self.settings.resolution = resolution;
        self.backend.reconfigure(&self.settings)?;
        self.force_keyframe = true;
        self.empty_submissions = 0;
        log::info!("Encoder resolution set to {}", resolution);
        Ok(())
    }

    /// Submit one frame. Returns zero or more sequenced chunks; zero is
    /// normal backend lookahead until it repeats `stall_threshold`
    /// times, at which point `EncoderStalled` is raised.
    pub fn submit(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Vec<EncodedChunk>> {
        let force = force_keyframe || self.force_keyframe;
        self.force_keyframe = false;

        let raw = self.backend.encode(frame, force)?;
        if raw.is_empty() {
            self.empty_submissions += 1;
            if self.empty_submissions >= self.settings.stall_threshold {
                let stalled_for = self.empty_submissions;
                self.empty_submissions = 0;
                return Err(StreamError::EncoderStalled(stalled_for));
            }
            return Ok(Vec::new());
        }
        self.empty_submissions = 0;

        let mut chunks = Vec::with_capacity(raw.len());
        for output in raw {
            self.segment_into(&mut chunks, output);
        }
        Ok(chunks)
    }

    /// Recreate the backend after a stall. The next output is forced to
    /// a keyframe.
    pub fn restart(&mut self) -> Result<()> {
        log::warn!("Restarting encoder backend '{}'", self.backend.name());
        self.backend.restart()?;
        self.force_keyframe = true;
        self.empty_submissions = 0;
        Ok(())
    }

    /// Split a backend output into chunks no larger than
    /// `max_chunk_size`, assigning sequence numbers.
    fn segment_into(&mut self, chunks: &mut Vec<EncodedChunk>, output: BackendChunk) {
        let payload = Bytes::from(output.payload);
        let max = self.settings.max_chunk_size.max(1);
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + max).min(payload.len());
            self.sequence += 1;
            chunks.push(EncodedChunk {
                sequence: self.sequence,
                timestamp_ms: output.timestamp_ms,
                is_keyframe: output.is_keyframe,
                codec: self.backend.codec(),
                payload: payload.slice(offset..end),
            });
            offset = end;
        }
    }
}

/// Convert packed RGB24 to planar YUV420 (BT.601).
pub(crate) fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let rgb_idx = (y * w + x) * 3;
            let r = rgb[rgb_idx] as i32;
            let g = rgb[rgb_idx + 1] as i32;
            let b = rgb[rgb_idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            // Subsample U and V over 2x2 blocks
            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

/// Resize packed RGB24 pixel data to the target resolution (Lanczos3).
pub(crate) fn resize_rgb(
    rgb: &[u8],
    from: Resolution,
    to: Resolution,
) -> Result<Vec<u8>> {
    if from == to {
        return Ok(rgb.to_vec());
    }

    let img = image::RgbImage::from_raw(from.width, from.height, rgb.to_vec()).ok_or_else(|| {
        StreamError::EncodingError(format!(
            "Frame data does not match {} RGB dimensions ({} bytes)",
            from,
            rgb.len()
        ))
    })?;

    let resized = image::imageops::resize(
        &img,
        to.width,
        to.height,
        image::imageops::FilterType::Lanczos3,
    );
    Ok(resized.into_raw())
}
