//! Property-based tests for the fragment packetizer.
//!
//! Focus: stable invariants (fragment sizing, index contiguity, wire
//! round-trip, and lossless reassembly).

use proptest::prelude::*;

use bytes::Bytes;
use framecast::packetize::{Packetizer, Reassembler, FRAGMENT_HEADER_SIZE};
use framecast::types::{CodecId, EncodedChunk, Fragment};

fn chunk(sequence: u64, is_keyframe: bool, payload: Vec<u8>) -> EncodedChunk {
    EncodedChunk {
        sequence,
        timestamp_ms: sequence.wrapping_mul(16),
        is_keyframe,
        codec: CodecId::H264,
        payload: Bytes::from(payload),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// INVARIANT: fragment_count = ceil(len / max), indices are 0-based
    /// and contiguous, no fragment is empty, and every fragment except
    /// the last is exactly max_fragment_size.
    #[test]
    fn split_invariants_hold(
        max_size in 1usize..2048,
        sequence in any::<u64>(),
        is_keyframe in any::<bool>(),
        payload in proptest::collection::vec(any::<u8>(), 1..12_000),
    ) {
        let packetizer = Packetizer::new(max_size);
        let original = chunk(sequence, is_keyframe, payload.clone());
        let fragments = packetizer.split(&original).expect("nonempty payload must split");

        let expected_count = payload.len().div_ceil(max_size);
        prop_assert_eq!(fragments.len(), expected_count);

        for (i, frag) in fragments.iter().enumerate() {
            prop_assert_eq!(frag.fragment_index as usize, i);
            prop_assert_eq!(frag.fragment_count as usize, expected_count);
            prop_assert_eq!(frag.chunk_sequence, sequence as u32);
            prop_assert_eq!(frag.is_keyframe, is_keyframe);
            prop_assert!(!frag.payload.is_empty());
            if i + 1 < fragments.len() {
                prop_assert_eq!(frag.payload.len(), max_size);
            } else {
                prop_assert!(frag.payload.len() <= max_size);
            }
        }
    }

    /// INVARIANT: concatenating fragment payloads in index order
    /// reproduces the chunk payload byte-for-byte.
    #[test]
    fn concatenation_is_lossless(
        max_size in 1usize..512,
        payload in proptest::collection::vec(any::<u8>(), 1..8_000),
    ) {
        let packetizer = Packetizer::new(max_size);
        let original = chunk(1, false, payload.clone());
        let fragments = packetizer.split(&original).unwrap();

        let mut rebuilt = Vec::with_capacity(payload.len());
        for frag in &fragments {
            rebuilt.extend_from_slice(&frag.payload);
        }
        prop_assert_eq!(rebuilt, payload);
    }

    /// INVARIANT: wire serialization round-trips every header field and
    /// the payload.
    #[test]
    fn wire_round_trip(
        max_size in 1usize..1500,
        sequence in any::<u64>(),
        is_keyframe in any::<bool>(),
        payload in proptest::collection::vec(any::<u8>(), 1..6_000),
    ) {
        let packetizer = Packetizer::new(max_size);
        let original = chunk(sequence, is_keyframe, payload);

        for frag in packetizer.split(&original).unwrap() {
            let wire = frag.to_wire();
            prop_assert_eq!(wire.len(), FRAGMENT_HEADER_SIZE + frag.payload.len());

            let parsed = Fragment::from_wire(&wire).expect("wire data must parse");
            prop_assert_eq!(parsed.chunk_sequence, frag.chunk_sequence);
            prop_assert_eq!(parsed.fragment_index, frag.fragment_index);
            prop_assert_eq!(parsed.fragment_count, frag.fragment_count);
            prop_assert_eq!(parsed.is_keyframe, frag.is_keyframe);
            prop_assert_eq!(parsed.codec, frag.codec);
            prop_assert_eq!(parsed.timestamp_ms, frag.timestamp_ms);
            prop_assert_eq!(parsed.payload, frag.payload);
        }
    }

    /// INVARIANT: feeding all fragments of a chunk through the wire and
    /// the reassembler reproduces the original chunk.
    #[test]
    fn reassembly_after_wire_transfer(
        max_size in 1usize..700,
        is_keyframe in any::<bool>(),
        payload in proptest::collection::vec(any::<u8>(), 1..5_000),
    ) {
        let packetizer = Packetizer::new(max_size);
        let original = chunk(99, is_keyframe, payload.clone());
        let fragments = packetizer.split(&original).unwrap();
        let fragment_count = fragments.len();

        let mut reassembler = Reassembler::new();
        let mut completed = None;
        for (i, frag) in fragments.into_iter().enumerate() {
            let wire = frag.to_wire();
            let parsed = Fragment::from_wire(&wire).unwrap();
            let result = reassembler.push(parsed);
            if i + 1 < fragment_count {
                prop_assert!(result.is_none());
            } else {
                completed = result;
            }
        }

        let rebuilt = completed.expect("last fragment must complete the chunk");
        prop_assert_eq!(rebuilt.payload.as_ref(), payload.as_slice());
        prop_assert_eq!(rebuilt.is_keyframe, is_keyframe);
        prop_assert_eq!(rebuilt.codec, original.codec);
        prop_assert_eq!(rebuilt.timestamp_ms, original.timestamp_ms);
    }
}

#[test]
fn zero_length_payload_must_fail() {
    let packetizer = Packetizer::new(1200);
    let empty = chunk(1, true, Vec::new());
    assert!(packetizer.split(&empty).is_err());
}

#[test]
fn payload_many_times_fragment_size() {
    let packetizer = Packetizer::new(100);
    let original = chunk(5, true, vec![0xCD; 100 * 7 + 13]);
    let fragments = packetizer.split(&original).unwrap();
    assert_eq!(fragments.len(), 8);
    assert_eq!(fragments.last().unwrap().payload.len(), 13);
}
