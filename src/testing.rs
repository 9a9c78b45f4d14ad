//! Testing utilities for Framecast
//!
//! Synthetic frames and a deterministic encoder backend so the pipeline
//! can be exercised offline, with no GPU, codec library, or network.

use crate::encode::{BackendChunk, EncoderBackend, EncoderSettings};
use crate::errors::{Result, StreamError};
use crate::types::{CodecId, Frame, FrameBuffer, PixelFormat, Resolution};
use std::collections::VecDeque;

/// Generate a synthetic frame with a deterministic pixel pattern.
///
/// The pattern varies with the generation id so consecutive frames are
/// distinguishable to an encoder.
pub fn synthetic_frame(generation_id: u64, resolution: Resolution, format: PixelFormat) -> Frame {
    let size = format.buffer_size(resolution.width, resolution.height);
    let base = (generation_id % 2 * 255) as u8;
    let mut data = vec![base; size];
    for (i, value) in data.iter_mut().enumerate() {
        *value = value.wrapping_add((generation_id as u8).wrapping_mul(5).wrapping_add(i as u8));
    }

    Frame {
        generation_id,
        capture_timestamp: chrono::Utc::now(),
        pts_ms: generation_id * 33,
        width: resolution.width,
        height: resolution.height,
        pixel_format: format,
        payload: FrameBuffer::detached(data),
    }
}

/// One scripted response of the synthetic backend.
#[derive(Debug, Clone)]
pub enum SyntheticStep {
    /// Produce this many chunks for the submission.
    Chunks(usize),
    /// Produce nothing (models backend lookahead or a stall).
    Empty,
    /// Fail the submission with an encoding error.
    Fail(String),
}

/// Deterministic in-memory encoder backend.
///
/// Without a script it yields one chunk per frame, keyframe first. A
/// script makes stalls, lookahead bursts, and failures reproducible.
pub struct SyntheticBackend {
    codec: CodecId,
    chunk_size: usize,
    script: VecDeque<SyntheticStep>,
    fail_restarts: bool,
    outputs: u64,
    restarts: u64,
}

impl SyntheticBackend {
    pub fn new(codec: CodecId) -> Self {
        Self {
            codec,
            chunk_size: 120,
            script: VecDeque::new(),
            fail_restarts: false,
            outputs: 0,
            restarts: 0,
        }
    }

    /// Payload size of each produced chunk.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Scripted responses, consumed one per submission; after the script
    /// runs out the backend reverts to one chunk per frame.
    pub fn with_script(mut self, steps: Vec<SyntheticStep>) -> Self {
        self.script = steps.into();
        self
    }

    /// Make every restart attempt fail, for escalation tests.
    pub fn with_failing_restarts(mut self) -> Self {
        self.fail_restarts = true;
        self
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    fn make_chunk(&mut self, frame: &Frame, keyframe: bool) -> BackendChunk {
        self.outputs += 1;
        let marker = (frame.generation_id as u8).wrapping_add(self.outputs as u8);
        BackendChunk {
            payload: vec![marker; self.chunk_size],
            is_keyframe: keyframe,
            timestamp_ms: frame.pts_ms,
        }
    }
}

impl EncoderBackend for SyntheticBackend {
    fn codec(&self) -> CodecId {
        self.codec
    }

    fn name(&self) -> &str {
        "synthetic"
    }

    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Vec<BackendChunk>> {
        let step = self
            .script
            .pop_front()
            .unwrap_or(SyntheticStep::Chunks(1));
        match step {
            SyntheticStep::Empty => Ok(Vec::new()),
            SyntheticStep::Fail(reason) => Err(StreamError::EncodingError(reason)),
            SyntheticStep::Chunks(count) => {
                let mut chunks = Vec::with_capacity(count);
                for i in 0..count {
                    let keyframe = (force_keyframe || self.outputs == 0) && i == 0;
                    chunks.push(self.make_chunk(frame, keyframe));
                }
                Ok(chunks)
            }
        }
    }

    fn set_bitrate(&mut self, _bitrate_kbps: u32) -> Result<()> {
        Ok(())
    }

    fn reconfigure(&mut self, _settings: &EncoderSettings) -> Result<()> {
        self.outputs = 0;
        Ok(())
    }

    fn restart(&mut self) -> Result<()> {
        self.restarts += 1;
        if self.fail_restarts {
            return Err(StreamError::EncodingError(
                "synthetic restart failure".to_string(),
            ));
        }
        self.outputs = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_frame_dimensions() {
        let frame = synthetic_frame(3, Resolution::new(32, 16), PixelFormat::Rgb24);
        assert_eq!(frame.generation_id, 3);
        assert_eq!(frame.payload.len(), 32 * 16 * 3);

        let yuv = synthetic_frame(4, Resolution::new(32, 16), PixelFormat::Yuv420);
        assert_eq!(yuv.payload.len(), 32 * 16 * 3 / 2);
    }

    #[test]
    fn test_backend_default_behavior() {
        let mut backend = SyntheticBackend::new(CodecId::Vp9);
        let frame = synthetic_frame(1, Resolution::new(8, 8), PixelFormat::Rgb24);

        let first = backend.encode(&frame, false).unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_keyframe);

        let second = backend.encode(&frame, false).unwrap();
        assert!(!second[0].is_keyframe);

        let forced = backend.encode(&frame, true).unwrap();
        assert!(forced[0].is_keyframe);
    }

    #[test]
    fn test_backend_script_is_consumed_in_order() {
        let mut backend = SyntheticBackend::new(CodecId::H264).with_script(vec![
            SyntheticStep::Empty,
            SyntheticStep::Fail("scripted".to_string()),
            SyntheticStep::Chunks(2),
        ]);
        let frame = synthetic_frame(1, Resolution::new(8, 8), PixelFormat::Rgb24);

        assert!(backend.encode(&frame, false).unwrap().is_empty());
        assert!(backend.encode(&frame, false).is_err());
        assert_eq!(backend.encode(&frame, false).unwrap().len(), 2);
        // Script exhausted, back to defaults.
        assert_eq!(backend.encode(&frame, false).unwrap().len(), 1);
    }

    #[test]
    fn test_failing_restart() {
        let mut backend = SyntheticBackend::new(CodecId::H264).with_failing_restarts();
        assert!(backend.restart().is_err());
        assert_eq!(backend.restarts(), 1);
    }
}
