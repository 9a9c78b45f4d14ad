//! Hardware-accelerated backend using hwcodec (FFmpeg wrapper).
//!
//! Probes the machine for NVENC, QSV, AMF, or VAAPI encoders for the
//! requested codec and drives the first one that comes up.

use hwcodec::common::{DataFormat, Quality, RateControl};
use hwcodec::ffmpeg::AVPixelFormat;
use hwcodec::ffmpeg_ram::encode::{EncodeContext, Encoder as HwEncoder};
use hwcodec::ffmpeg_ram::CodecInfo;

use super::{rgb_to_yuv420, BackendChunk, EncoderBackend, EncoderSettings};
use crate::errors::{Result, StreamError};
use crate::types::{CodecId, Frame, PixelFormat};

fn data_format(codec: CodecId) -> DataFormat {
    match codec {
        CodecId::H264 => DataFormat::H264,
        CodecId::H265 => DataFormat::H265,
        CodecId::Vp8 => DataFormat::VP8,
        CodecId::Vp9 => DataFormat::VP9,
    }
}

fn encode_context(name: String, settings: &EncoderSettings) -> EncodeContext {
    EncodeContext {
        name,
        mc_name: None,
        width: settings.resolution.width as i32,
        height: settings.resolution.height as i32,
        pixfmt: AVPixelFormat::AV_PIX_FMT_YUV420P,
        align: 1,
        fps: settings.fps as i32,
        gop: settings.keyframe_interval as i32,
        rc: RateControl::RC_CBR,
        // Lowest-latency preset; quality is bought with bitrate here.
        quality: Quality::Quality_Low,
        kbs: settings.bitrate_kbps as i32,
        q: 23,
        thread_count: 4,
    }
}

/// List hardware encoders usable for the given codec and settings.
pub fn available_encoders(codec: CodecId, settings: &EncoderSettings) -> Vec<CodecInfo> {
    let probe = encode_context(String::new(), settings);
    HwEncoder::available_encoders(probe, None)
        .into_iter()
        .filter(|info| info.format == data_format(codec))
        .collect()
}

/// GPU-backed encoder selected from whatever the machine offers.
pub struct HardwareEncoder {
    inner: HwEncoder,
    codec: CodecId,
    codec_name: String,
    settings: EncoderSettings,
    frame_count: u64,
}

impl HardwareEncoder {
    /// Probe for a hardware encoder and initialize the best match.
    pub fn new(codec: CodecId, settings: &EncoderSettings) -> Result<Self> {
        let candidates = available_encoders(codec, settings);
        let info = candidates.first().ok_or_else(|| {
            StreamError::CodecUnavailable(format!("No hardware {} encoder detected", codec))
        })?;

        log::info!(
            "Creating hardware encoder '{}' at {} @ {} kbps",
            info.name,
            settings.resolution,
            settings.bitrate_kbps
        );

        let inner = HwEncoder::new(encode_context(info.name.clone(), settings)).map_err(|_| {
            StreamError::CodecUnavailable(format!(
                "Hardware encoder '{}' failed to initialize",
                info.name
            ))
        })?;

        Ok(Self {
            inner,
            codec,
            codec_name: info.name.clone(),
            settings: settings.clone(),
            frame_count: 0,
        })
    }

    fn rebuild(&mut self) -> Result<()> {
        self.inner =
            HwEncoder::new(encode_context(self.codec_name.clone(), &self.settings)).map_err(
                |_| {
                    StreamError::EncodingError(format!(
                        "Hardware encoder '{}' failed to reinitialize",
                        self.codec_name
                    ))
                },
            )?;
        self.frame_count = 0;
        Ok(())
    }

    /// Bring a captured frame to the YUV420 layout FFmpeg expects.
    fn prepare_yuv(&self, frame: &Frame) -> Result<Vec<u8>> {
        if frame.resolution() != self.settings.resolution {
            return Err(StreamError::EncodingError(format!(
                "Frame is {} but the hardware encoder is configured for {}",
                frame.resolution(),
                self.settings.resolution
            )));
        }
        match frame.pixel_format {
            PixelFormat::Rgb24 => Ok(rgb_to_yuv420(&frame.payload, frame.width, frame.height)),
            PixelFormat::Yuv420 => Ok(frame.payload.to_vec()),
        }
    }
}

// The wrapped FFmpeg context holds raw pointers that never escape this
// struct, and a session's encoder is only driven from one context at a
// time.
unsafe impl Send for HardwareEncoder {}

impl EncoderBackend for HardwareEncoder {
    fn codec(&self) -> CodecId {
        self.codec
    }

    fn name(&self) -> &str {
        &self.codec_name
    }

    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Vec<BackendChunk>> {
        let yuv = self.prepare_yuv(frame)?;

        if force_keyframe {
            self.inner.request_keyframe();
        }

        self.frame_count += 1;
        let timestamp_ms = frame.pts_ms;

        match self.inner.encode(&yuv, timestamp_ms as i64) {
            Ok(frames) => Ok(frames
                .drain(..)
                .map(|f| BackendChunk {
                    payload: f.data,
                    is_keyframe: f.key == 1,
                    timestamp_ms,
                })
                .collect()),
            Err(code) => Err(StreamError::EncodingError(format!(
                "Hardware encode failed with code {}",
                code
            ))),
        }
    }

    fn set_bitrate(&mut self, bitrate_kbps: u32) -> Result<()> {
        self.inner
            .set_bitrate(bitrate_kbps as i32)
            .map_err(|_| StreamError::EncodingError("Failed to update bitrate".to_string()))?;
        self.settings.bitrate_kbps = bitrate_kbps;
        Ok(())
    }

    fn reconfigure(&mut self, settings: &EncoderSettings) -> Result<()> {
        self.settings = settings.clone();
        self.rebuild()
    }

    fn restart(&mut self) -> Result<()> {
        self.rebuild()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    fn settings() -> EncoderSettings {
        EncoderSettings {
            resolution: Resolution::HD720,
            bitrate_kbps: 2000,
            fps: 30,
            keyframe_interval: 60,
            max_chunk_size: 256 * 1024,
            stall_threshold: 8,
        }
    }

    // Hardware availability depends on the machine; these only assert
    // that probing does not panic.
    #[test]
    fn test_probe_does_not_panic() {
        let found = available_encoders(CodecId::H264, &settings());
        for info in &found {
            println!("hardware encoder: {}", info.name);
        }
    }

    #[test]
    fn test_create_reports_unavailable_cleanly() {
        match HardwareEncoder::new(CodecId::H264, &settings()) {
            Ok(encoder) => println!("created {}", encoder.name()),
            Err(StreamError::CodecUnavailable(reason)) => println!("unavailable: {}", reason),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}
