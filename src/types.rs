//! Core data types shared across the pipeline.
//!
//! A `Frame` is produced once per render tick and owns its pixel data
//! exclusively; it is never mutated after it enters the frame queue.
//! `EncodedChunk` and `Fragment` are the encoder and transport units
//! derived from it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes per pixel.
    Rgb24,
    /// Planar YUV 4:2:0 (I420).
    Yuv420,
}

impl PixelFormat {
    /// Buffer size in bytes for a frame of the given dimensions.
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Yuv420 => pixels * 3 / 2,
        }
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD720: Resolution = Resolution { width: 1280, height: 720 };
    pub const HD1080: Resolution = Resolution { width: 1920, height: 1080 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Video codec identifier carried in fragment headers and negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecId {
    H264,
    H265,
    Vp8,
    Vp9,
}

impl CodecId {
    /// Single-byte id used on the wire.
    pub fn wire_id(&self) -> u8 {
        match self {
            CodecId::H264 => 1,
            CodecId::H265 => 2,
            CodecId::Vp8 => 3,
            CodecId::Vp9 => 4,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(CodecId::H264),
            2 => Some(CodecId::H265),
            3 => Some(CodecId::Vp8),
            4 => Some(CodecId::Vp9),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CodecId::H264 => "h264",
            CodecId::H265 => "h265",
            CodecId::Vp8 => "vp8",
            CodecId::Vp9 => "vp9",
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel buffer that returns itself to its pool when dropped.
///
/// Buffers acquired from a `FramePool` carry the pool's return channel;
/// detached buffers simply free their memory.
pub struct FrameBuffer {
    data: Vec<u8>,
    pool_return: Option<Sender<Vec<u8>>>,
}

impl FrameBuffer {
    /// Wrap a plain vector with no backing pool.
    pub fn detached(data: Vec<u8>) -> Self {
        Self {
            data,
            pool_return: None,
        }
    }

    pub(crate) fn pooled(data: Vec<u8>, pool_return: Sender<Vec<u8>>) -> Self {
        Self {
            data,
            pool_return: Some(pool_return),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `src` into the buffer. The buffer must already be sized to
    /// match.
    pub fn copy_from(&mut self, src: &[u8]) {
        debug_assert_eq!(self.data.len(), src.len());
        self.data.copy_from_slice(src);
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(ret) = self.pool_return.take() {
            // Pool may already be gone during teardown; the buffer is
            // simply freed in that case.
            let _ = ret.try_send(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.pool_return.is_some())
            .finish()
    }
}

/// One captured frame, owned exclusively by whoever holds it.
#[derive(Debug)]
pub struct Frame {
    /// Strictly increasing per capture context.
    pub generation_id: u64,
    /// Wall-clock capture time.
    pub capture_timestamp: DateTime<Utc>,
    /// Monotonic presentation timestamp in milliseconds.
    pub pts_ms: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub payload: FrameBuffer,
}

impl Frame {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// One compressed output unit from the encoder.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Strictly increasing per encoder instance.
    pub sequence: u64,
    /// Presentation timestamp of the source frame in milliseconds.
    pub timestamp_ms: u64,
    /// Self-contained chunk, decodable without prior chunks.
    pub is_keyframe: bool,
    pub codec: CodecId,
    pub payload: Bytes,
}

/// A transport-sized slice of one encoded chunk.
///
/// Fragments of a chunk are sent in index order on the media channel.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub chunk_sequence: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub is_keyframe: bool,
    pub codec: CodecId,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_buffer_size() {
        assert_eq!(PixelFormat::Rgb24.buffer_size(640, 480), 640 * 480 * 3);
        assert_eq!(PixelFormat::Yuv420.buffer_size(640, 480), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_codec_wire_id_round_trip() {
        for codec in [CodecId::H264, CodecId::H265, CodecId::Vp8, CodecId::Vp9] {
            assert_eq!(CodecId::from_wire_id(codec.wire_id()), Some(codec));
        }
        assert_eq!(CodecId::from_wire_id(0), None);
        assert_eq!(CodecId::from_wire_id(200), None);
    }

    #[test]
    fn test_detached_buffer() {
        let buf = FrameBuffer::detached(vec![1, 2, 3]);
        assert_eq!(buf.len(), 3);
        assert_eq!(&buf[..], &[1, 2, 3]);
    }

    #[test]
    fn test_pooled_buffer_returns_on_drop() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        {
            let _buf = FrameBuffer::pooled(vec![0u8; 16], tx);
        }
        let returned = rx.try_recv().expect("buffer should return to pool");
        assert_eq!(returned.len(), 16);
    }
}
