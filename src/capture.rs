//! Capture-side adapter between the host render pipeline and the frame
//! queue.
//!
//! The host delivers a borrowed view of the render target once per tick;
//! the pixel data is copied into a pooled buffer inside the callback
//! scope and the view is never retained. The capture path touches only
//! the buffer pool and the frame queue, and never blocks on encode or
//! network work.

use crate::errors::{Result, StreamError};
use crate::queue::FrameQueue;
use crate::timing::PtsClock;
use crate::types::{Frame, FrameBuffer, PixelFormat};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Borrowed view of one rendered frame, valid only for the duration of
/// the capture callback.
#[derive(Debug)]
pub struct RenderTargetView<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub timestamp: DateTime<Utc>,
}

/// Pool of reusable pixel buffers shared between the capture and encode
/// contexts. Acquisition has a bounded wait; the fallback is dropping
/// the frame, never blocking the render thread.
pub struct FramePool {
    slots: Receiver<Vec<u8>>,
    recycle: Sender<Vec<u8>>,
    acquire_timeout: Duration,
}

impl FramePool {
    pub fn new(capacity: usize, buffer_size: usize, acquire_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (recycle, slots) = bounded(capacity);
        for _ in 0..capacity {
            // Channel was sized for exactly these buffers.
            let _ = recycle.send(vec![0u8; buffer_size]);
        }
        Self {
            slots,
            recycle,
            acquire_timeout,
        }
    }

    /// Acquire a buffer of at least `size` bytes, waiting at most the
    /// configured timeout. Returns `None` when the pool is exhausted.
    pub fn acquire(&self, size: usize) -> Option<FrameBuffer> {
        let mut data = match self.slots.recv_timeout(self.acquire_timeout) {
            Ok(data) => data,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        };
        data.resize(size, 0);
        Some(FrameBuffer::pooled(data, self.recycle.clone()))
    }

    /// Buffers currently available for acquisition.
    pub fn available(&self) -> usize {
        self.slots.len()
    }
}

/// Outcome of one capture callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Frame copied and enqueued; carries the queue's running
    /// dropped-count.
    Enqueued { queue_dropped: u64 },
    /// No pooled buffer became available within the bounded wait.
    DroppedNoBuffer,
}

/// Per-session capture context: buffer pool, generation counter, and the
/// handoff into the session's frame queue.
pub struct CaptureContext {
    queue: Arc<FrameQueue>,
    pool: FramePool,
    clock: PtsClock,
    generation: AtomicU64,
    pool_dropped: AtomicU64,
    captured: AtomicU64,
}

impl CaptureContext {
    pub fn new(
        queue: Arc<FrameQueue>,
        pool_capacity: usize,
        buffer_size: usize,
        acquire_timeout: Duration,
        clock: PtsClock,
    ) -> Self {
        Self {
            queue,
            pool: FramePool::new(pool_capacity, buffer_size, acquire_timeout),
            clock,
            generation: AtomicU64::new(0),
            pool_dropped: AtomicU64::new(0),
            captured: AtomicU64::new(0),
        }
    }

    /// Copy a rendered frame into a pooled buffer and hand it to the
    /// frame queue. Never blocks beyond the pool's bounded wait.
    pub fn on_frame(&self, view: &RenderTargetView<'_>) -> Result<CaptureOutcome> {
        let expected = view.pixel_format.buffer_size(view.width, view.height);
        if view.pixels.len() != expected {
            return Err(StreamError::EncodingError(format!(
                "Render target size mismatch: expected {} bytes for {}x{} {:?}, got {}",
                expected,
                view.width,
                view.height,
                view.pixel_format,
                view.pixels.len()
            )));
        }

        let Some(mut buffer) = self.pool.acquire(expected) else {
            let dropped = self.pool_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("Frame pool exhausted, frame dropped (total: {})", dropped);
            return Ok(CaptureOutcome::DroppedNoBuffer);
        };
        buffer.copy_from(view.pixels);

        let generation_id = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Frame {
            generation_id,
            capture_timestamp: view.timestamp,
            pts_ms: self.clock.pts_ms(),
            width: view.width,
            height: view.height,
            pixel_format: view.pixel_format,
            payload: buffer,
        };

        self.captured.fetch_add(1, Ordering::Relaxed);
        let queue_dropped = self.queue.enqueue(frame);
        Ok(CaptureOutcome::Enqueued { queue_dropped })
    }

    /// Frames dropped because no pooled buffer was free in time.
    pub fn pool_dropped(&self) -> u64 {
        self.pool_dropped.load(Ordering::Relaxed)
    }

    /// Frames successfully copied and enqueued.
    pub fn frames_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    fn view(pixels: &[u8], res: Resolution) -> RenderTargetView<'_> {
        RenderTargetView {
            pixels,
            width: res.width,
            height: res.height,
            pixel_format: PixelFormat::Rgb24,
            timestamp: Utc::now(),
        }
    }

    fn context(queue_capacity: usize, pool_capacity: usize) -> CaptureContext {
        let res = Resolution::new(16, 16);
        CaptureContext::new(
            Arc::new(FrameQueue::new(queue_capacity)),
            pool_capacity,
            PixelFormat::Rgb24.buffer_size(res.width, res.height),
            Duration::from_millis(1),
            PtsClock::new(),
        )
    }

    #[test]
    fn test_capture_enqueues_with_increasing_generation() {
        let ctx = context(4, 4);
        let res = Resolution::new(16, 16);
        let pixels = vec![42u8; PixelFormat::Rgb24.buffer_size(16, 16)];

        for _ in 0..3 {
            let outcome = ctx.on_frame(&view(&pixels, res)).unwrap();
            assert!(matches!(outcome, CaptureOutcome::Enqueued { .. }));
        }

        let first = ctx.queue().dequeue().unwrap().frame;
        let second = ctx.queue().dequeue().unwrap().frame;
        assert_eq!(first.generation_id, 1);
        assert_eq!(second.generation_id, 2);
        assert_eq!(&first.payload[..4], &[42, 42, 42, 42]);
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let ctx = context(4, 4);
        let res = Resolution::new(16, 16);
        let short = vec![0u8; 10];
        assert!(ctx.on_frame(&view(&short, res)).is_err());
    }

    #[test]
    fn test_pool_exhaustion_drops_without_blocking() {
        // Pool of 2, queue that holds everything: the third capture finds
        // no free buffer because both live in the queue.
        let ctx = context(8, 2);
        let res = Resolution::new(16, 16);
        let pixels = vec![1u8; PixelFormat::Rgb24.buffer_size(16, 16)];

        assert!(matches!(
            ctx.on_frame(&view(&pixels, res)).unwrap(),
            CaptureOutcome::Enqueued { .. }
        ));
        assert!(matches!(
            ctx.on_frame(&view(&pixels, res)).unwrap(),
            CaptureOutcome::Enqueued { .. }
        ));
        assert_eq!(
            ctx.on_frame(&view(&pixels, res)).unwrap(),
            CaptureOutcome::DroppedNoBuffer
        );
        assert_eq!(ctx.pool_dropped(), 1);

        // Consuming a frame recycles its buffer back into the pool.
        drop(ctx.queue().dequeue());
        assert!(matches!(
            ctx.on_frame(&view(&pixels, res)).unwrap(),
            CaptureOutcome::Enqueued { .. }
        ));
    }

    #[test]
    fn test_queue_eviction_recycles_buffers() {
        // Queue of 1 with a pool of 2: eviction must return the old
        // frame's buffer to the pool, so captures never starve.
        let ctx = context(1, 2);
        let res = Resolution::new(16, 16);
        let pixels = vec![7u8; PixelFormat::Rgb24.buffer_size(16, 16)];

        for _ in 0..5 {
            let outcome = ctx.on_frame(&view(&pixels, res)).unwrap();
            assert!(matches!(outcome, CaptureOutcome::Enqueued { .. }));
        }
        assert_eq!(ctx.queue().dropped_count(), 4);
    }
}
