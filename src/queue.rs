//! Bounded frame handoff between the capture and encode contexts.
//!
//! The queue never blocks either side: a full queue evicts its oldest
//! frame (stale video is worthless) and the eviction is counted exactly.

use crate::types::Frame;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A frame handed to the encode context, possibly tagged with a pending
/// keyframe request.
#[derive(Debug)]
pub struct QueuedFrame {
    pub frame: Frame,
    /// The next encode of this frame must produce an intra-only chunk.
    pub force_keyframe: bool,
}

struct QueueInner {
    frames: VecDeque<Frame>,
    dropped: u64,
    keyframe_requested: bool,
}

/// Bounded single-producer/single-consumer frame queue with drop-oldest
/// overflow behavior.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames. Capacity is
    /// clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity.max(1)),
                dropped: 0,
                keyframe_requested: false,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a frame without blocking. If the queue is full the oldest
    /// frame is evicted and counted. Returns the running dropped-count.
    pub fn enqueue(&self, frame: Frame) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if inner.frames.len() >= self.capacity {
            if let Some(evicted) = inner.frames.pop_front() {
                inner.dropped += 1;
                log::debug!(
                    "Frame queue full, dropped generation {} (total dropped: {})",
                    evicted.generation_id,
                    inner.dropped
                );
            }
        }
        inner.frames.push_back(frame);
        inner.dropped
    }

    /// Dequeue the oldest frame without blocking. Consumes the keyframe
    /// latch: at most one dequeued frame per request carries
    /// `force_keyframe`.
    pub fn dequeue(&self) -> Option<QueuedFrame> {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.frames.pop_front()?;
        let force_keyframe = inner.keyframe_requested;
        inner.keyframe_requested = false;
        Some(QueuedFrame {
            frame,
            force_keyframe,
        })
    }

    /// Latch a keyframe request for the next dequeued frame.
    pub fn request_keyframe(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.keyframe_requested = true;
    }

    /// Whether a keyframe request is latched and not yet consumed.
    pub fn keyframe_pending(&self) -> bool {
        self.inner.lock().unwrap().keyframe_requested
    }

    /// Total frames evicted since creation.
    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard all queued frames, returning how many were drained.
    /// Used during session teardown.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let drained = inner.frames.len();
        inner.frames.clear();
        inner.keyframe_requested = false;
        drained
    }
}
