//! Splits encoded chunks into transport-sized fragments.
//!
//! The split is deterministic: `fragment_count = ceil(len / max)` with
//! 0-based contiguous indices. Fragments carry an 18-byte big-endian
//! header so a receiver can reassemble the chunk byte-for-byte.
//!
//! ```text
//! ┌───────────────┬────────────┬────────────┬───────┬───────┬────────────┐
//! │ chunk_sequence│ frag_index │ frag_count │ flags │ codec │ timestamp  │
//! │ 4 bytes BE    │ 2 bytes BE │ 2 bytes BE │ 1 byte│ 1 byte│ 8 bytes BE │
//! └───────────────┴────────────┴────────────┴───────┴───────┴────────────┘
//! ```

use crate::errors::{Result, StreamError};
use crate::types::{CodecId, EncodedChunk, Fragment};
use bytes::{BufMut, Bytes, BytesMut};

/// Fixed fragment header size in bytes.
pub const FRAGMENT_HEADER_SIZE: usize = 18;

/// Flag bit: the fragment belongs to a keyframe chunk.
pub const FLAG_KEYFRAME: u8 = 0b0000_0001;

/// Splits chunks into fragments no larger than the configured payload
/// size.
#[derive(Debug, Clone, Copy)]
pub struct Packetizer {
    max_fragment_size: usize,
}

impl Packetizer {
    /// `max_fragment_size` is the payload budget per fragment, excluding
    /// the header. Clamped to at least 1.
    pub fn new(max_fragment_size: usize) -> Self {
        Self {
            max_fragment_size: max_fragment_size.max(1),
        }
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    /// Split one chunk into in-order fragments.
    ///
    /// A zero-length chunk payload is an internal encoder error, never a
    /// valid input.
    pub fn split(&self, chunk: &EncodedChunk) -> Result<Vec<Fragment>> {
        if chunk.payload.is_empty() {
            return Err(StreamError::WireFormat(
                "Zero-length chunk payload cannot be packetized".to_string(),
            ));
        }

        let count = chunk.payload.len().div_ceil(self.max_fragment_size);
        if count > u16::MAX as usize {
            return Err(StreamError::WireFormat(format!(
                "Chunk of {} bytes needs {} fragments, exceeding the index space",
                chunk.payload.len(),
                count
            )));
        }

        let chunk_sequence = chunk.sequence as u32;
        let mut fragments = Vec::with_capacity(count);
        for index in 0..count {
            let start = index * self.max_fragment_size;
            let end = (start + self.max_fragment_size).min(chunk.payload.len());
            fragments.push(Fragment {
                chunk_sequence,
                fragment_index: index as u16,
                fragment_count: count as u16,
                is_keyframe: chunk.is_keyframe,
                codec: chunk.codec,
                timestamp_ms: chunk.timestamp_ms,
                payload: chunk.payload.slice(start..end),
            });
        }
        Ok(fragments)
    }
}

impl Fragment {
    /// Serialize header + payload for the media channel.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.chunk_sequence);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.fragment_count);
        buf.put_u8(if self.is_keyframe { FLAG_KEYFRAME } else { 0 });
        buf.put_u8(self.codec.wire_id());
        buf.put_u64(self.timestamp_ms);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a fragment received from the media channel.
    pub fn from_wire(data: &[u8]) -> Result<Fragment> {
        if data.len() <= FRAGMENT_HEADER_SIZE {
            return Err(StreamError::WireFormat(format!(
                "Fragment too short: {} bytes",
                data.len()
            )));
        }
        let chunk_sequence = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let fragment_index = u16::from_be_bytes([data[4], data[5]]);
        let fragment_count = u16::from_be_bytes([data[6], data[7]]);
        let flags = data[8];
        let codec = CodecId::from_wire_id(data[9]).ok_or_else(|| {
            StreamError::WireFormat(format!("Unknown codec wire id {}", data[9]))
        })?;
        let timestamp_ms = u64::from_be_bytes([
            data[10], data[11], data[12], data[13], data[14], data[15], data[16], data[17],
        ]);

        if fragment_count == 0 || fragment_index >= fragment_count {
            return Err(StreamError::WireFormat(format!(
                "Fragment index {} out of range for count {}",
                fragment_index, fragment_count
            )));
        }

        Ok(Fragment {
            chunk_sequence,
            fragment_index,
            fragment_count,
            is_keyframe: flags & FLAG_KEYFRAME != 0,
            codec,
            timestamp_ms,
            payload: Bytes::copy_from_slice(&data[FRAGMENT_HEADER_SIZE..]),
        })
    }
}

/// Rebuilds chunks from fragments arriving in index order.
///
/// A fresh chunk starts at index 0; any gap or sequence change mid-chunk
/// discards the partial chunk (the channel is unreliable, a lost
/// fragment loses the whole chunk).
#[derive(Debug, Default)]
pub struct Reassembler {
    current: Option<PartialChunk>,
    discarded: u64,
}

#[derive(Debug)]
struct PartialChunk {
    chunk_sequence: u32,
    fragment_count: u16,
    next_index: u16,
    is_keyframe: bool,
    codec: CodecId,
    timestamp_ms: u64,
    payload: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the completed chunk when its last
    /// fragment arrives.
    pub fn push(&mut self, fragment: Fragment) -> Option<EncodedChunk> {
        if fragment.fragment_index == 0 {
            if let Some(partial) = self.current.take() {
                self.discarded += 1;
                log::debug!(
                    "Discarding incomplete chunk {} ({} of {} fragments)",
                    partial.chunk_sequence,
                    partial.next_index,
                    partial.fragment_count
                );
            }
            self.current = Some(PartialChunk {
                chunk_sequence: fragment.chunk_sequence,
                fragment_count: fragment.fragment_count,
                next_index: 0,
                is_keyframe: fragment.is_keyframe,
                codec: fragment.codec,
                timestamp_ms: fragment.timestamp_ms,
                payload: BytesMut::new(),
            });
        }

        let partial = match self.current.as_mut() {
            Some(partial)
                if partial.chunk_sequence == fragment.chunk_sequence
                    && partial.next_index == fragment.fragment_index
                    && partial.fragment_count == fragment.fragment_count =>
            {
                partial
            }
            _ => {
                // Out-of-order or orphan fragment; drop any partial state.
                if self.current.take().is_some() {
                    self.discarded += 1;
                }
                return None;
            }
        };

        partial.payload.extend_from_slice(&fragment.payload);
        partial.next_index += 1;

        if partial.next_index == partial.fragment_count {
            let done = self.current.take()?;
            return Some(EncodedChunk {
                sequence: done.chunk_sequence as u64,
                timestamp_ms: done.timestamp_ms,
                is_keyframe: done.is_keyframe,
                codec: done.codec,
                payload: done.payload.freeze(),
            });
        }
        None
    }

    /// Chunks thrown away because a fragment went missing.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sequence: u64, payload: Vec<u8>) -> EncodedChunk {
        EncodedChunk {
            sequence,
            timestamp_ms: 1234,
            is_keyframe: sequence % 2 == 0,
            codec: CodecId::H264,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn test_split_is_deterministic() {
        let packetizer = Packetizer::new(100);
        let fragments = packetizer.split(&chunk(7, vec![0xAB; 250])).unwrap();

        assert_eq!(fragments.len(), 3);
        for (i, frag) in fragments.iter().enumerate() {
            assert_eq!(frag.fragment_index as usize, i);
            assert_eq!(frag.fragment_count, 3);
            assert_eq!(frag.chunk_sequence, 7);
        }
        assert_eq!(fragments[0].payload.len(), 100);
        assert_eq!(fragments[1].payload.len(), 100);
        assert_eq!(fragments[2].payload.len(), 50);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let packetizer = Packetizer::new(100);
        let fragments = packetizer.split(&chunk(1, vec![1; 200])).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|f| !f.payload.is_empty()));
    }

    #[test]
    fn test_zero_length_chunk_is_rejected() {
        let packetizer = Packetizer::new(100);
        assert!(packetizer.split(&chunk(1, vec![])).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let packetizer = Packetizer::new(64);
        let original = chunk(42, (0..200).map(|i| i as u8).collect());
        let fragments = packetizer.split(&original).unwrap();

        for frag in &fragments {
            let wire = frag.to_wire();
            let parsed = Fragment::from_wire(&wire).unwrap();
            assert_eq!(parsed.chunk_sequence, frag.chunk_sequence);
            assert_eq!(parsed.fragment_index, frag.fragment_index);
            assert_eq!(parsed.fragment_count, frag.fragment_count);
            assert_eq!(parsed.is_keyframe, frag.is_keyframe);
            assert_eq!(parsed.codec, frag.codec);
            assert_eq!(parsed.timestamp_ms, frag.timestamp_ms);
            assert_eq!(parsed.payload, frag.payload);
        }
    }

    #[test]
    fn test_reassembly_reproduces_payload() {
        let packetizer = Packetizer::new(33);
        let original = chunk(9, (0..500).map(|i| (i * 7) as u8).collect());
        let fragments = packetizer.split(&original).unwrap();

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for frag in fragments {
            if let Some(done) = reassembler.push(frag) {
                result = Some(done);
            }
        }

        let rebuilt = result.expect("chunk should complete");
        assert_eq!(rebuilt.payload, original.payload);
        assert_eq!(rebuilt.timestamp_ms, original.timestamp_ms);
        assert_eq!(rebuilt.codec, original.codec);
    }

    #[test]
    fn test_reassembler_discards_on_gap() {
        let packetizer = Packetizer::new(10);
        let fragments = packetizer.split(&chunk(3, vec![5; 30])).unwrap();
        assert_eq!(fragments.len(), 3);

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(fragments[0].clone()).is_none());
        // Skip index 1; index 2 must not complete the chunk.
        assert!(reassembler.push(fragments[2].clone()).is_none());
        assert_eq!(reassembler.discarded(), 1);
    }

    #[test]
    fn test_truncated_wire_data_fails() {
        assert!(Fragment::from_wire(&[0u8; 4]).is_err());
        assert!(Fragment::from_wire(&[0u8; FRAGMENT_HEADER_SIZE]).is_err());
    }
}
