//! Frame queue behavior under backpressure.
//!
//! The capture side must never block: overflow evicts the oldest frame
//! and every eviction is accounted for exactly.

use framecast::queue::FrameQueue;
use framecast::testing::synthetic_frame;
use framecast::types::{PixelFormat, Resolution};

fn frame(generation_id: u64) -> framecast::types::Frame {
    synthetic_frame(generation_id, Resolution::new(16, 16), PixelFormat::Rgb24)
}

#[test]
fn capacity_three_enqueue_five_keeps_newest_three() {
    let queue = FrameQueue::new(3);
    for id in 1..=5 {
        queue.enqueue(frame(id));
    }

    let order: Vec<u64> = std::iter::from_fn(|| queue.dequeue())
        .map(|q| q.frame.generation_id)
        .collect();
    assert_eq!(order, vec![3, 4, 5]);
    assert_eq!(queue.dropped_count(), 2);
}

#[test]
fn dropped_count_equals_overflow_exactly() {
    for capacity in [1usize, 2, 3, 7] {
        for total in [0u64, 1, 5, 50, 200] {
            let queue = FrameQueue::new(capacity);
            for id in 1..=total {
                queue.enqueue(frame(id));
            }
            let expected_drops = total.saturating_sub(capacity as u64);
            assert_eq!(
                queue.dropped_count(),
                expected_drops,
                "capacity {} with {} frames",
                capacity,
                total
            );
            assert_eq!(queue.len() as u64, total.min(capacity as u64));
        }
    }
}

#[test]
fn dequeue_on_empty_returns_none_immediately() {
    let queue = FrameQueue::new(2);
    assert!(queue.dequeue().is_none());
    queue.enqueue(frame(1));
    assert!(queue.dequeue().is_some());
    assert!(queue.dequeue().is_none());
}

#[test]
fn enqueue_return_value_tracks_running_drop_count() {
    let queue = FrameQueue::new(1);
    assert_eq!(queue.enqueue(frame(1)), 0);
    assert_eq!(queue.enqueue(frame(2)), 1);
    assert_eq!(queue.enqueue(frame(3)), 2);
}

#[test]
fn keyframe_request_tags_exactly_one_frame() {
    let queue = FrameQueue::new(8);
    for id in 1..=4 {
        queue.enqueue(frame(id));
    }

    queue.request_keyframe();
    // A second request before a dequeue still yields a single tag.
    queue.request_keyframe();

    let tagged: Vec<bool> = std::iter::from_fn(|| queue.dequeue())
        .map(|q| q.force_keyframe)
        .collect();
    assert_eq!(tagged, vec![true, false, false, false]);
}

#[test]
fn generations_stay_strictly_increasing_across_overflow() {
    let queue = FrameQueue::new(4);
    let mut last_seen = 0u64;
    for id in 1..=100 {
        queue.enqueue(frame(id));
        if id % 3 == 0 {
            if let Some(q) = queue.dequeue() {
                assert!(q.frame.generation_id > last_seen);
                last_seen = q.frame.generation_id;
            }
        }
    }
    while let Some(q) = queue.dequeue() {
        assert!(q.frame.generation_id > last_seen);
        last_seen = q.frame.generation_id;
    }
}

#[test]
fn concurrent_producer_consumer_never_blocks() {
    use std::sync::Arc;

    let queue = Arc::new(FrameQueue::new(3));
    let producer_queue = queue.clone();

    let producer = std::thread::spawn(move || {
        for id in 1..=500 {
            producer_queue.enqueue(frame(id));
        }
    });

    let mut consumed = 0u64;
    let mut last_seen = 0u64;
    while !producer.is_finished() || !queue.is_empty() {
        if let Some(q) = queue.dequeue() {
            assert!(q.frame.generation_id > last_seen);
            last_seen = q.frame.generation_id;
            consumed += 1;
        }
    }
    producer.join().unwrap();

    assert_eq!(consumed + queue.dropped_count(), 500);
}
