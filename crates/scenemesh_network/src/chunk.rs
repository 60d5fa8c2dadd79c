//! Chunked payloads.
//!
//! Large content is never built as one frame. A [`SceneUpdateSerializer`]
//! fills a caller-owned scratch buffer and hands every full (or final
//! partial) chunk to a callback; the callback returns `false` to stop the
//! serializer, e.g. because the connection system is no longer running.
//! The receiving side feeds chunks to a [`SceneUpdateReassembler`].

use std::collections::HashMap;

use tracing::error;

use crate::codec::MAX_PAYLOAD_SIZE;
use crate::error::CodecError;
use crate::identity::ParticipantId;
use crate::message::SceneId;

/// Default size of one scene-update chunk, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 300_000;

/// Largest chunk that still fits one frame next to the scene id and the
/// chunk's own length prefix.
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD_SIZE - 12;

/// Callback invoked with each completed chunk.
pub type ChunkSink<'a> = dyn FnMut(&[u8]) -> bool + 'a;

/// Produces the serialized form of a scene update in bounded pieces.
pub trait SceneUpdateSerializer {
    /// Serialize into `packet`, calling `on_chunk` for every filled part.
    ///
    /// Returns `false` as soon as `on_chunk` does.
    fn write_to_packets(&self, packet: &mut [u8], on_chunk: &mut ChunkSink<'_>) -> bool;
}

/// Incremental writer over a fixed scratch buffer.
pub struct PacketWriter<'p, 's, 'f> {
    packet: &'p mut [u8],
    used: usize,
    on_chunk: &'s mut ChunkSink<'f>,
    aborted: bool,
}

impl<'p, 's, 'f> PacketWriter<'p, 's, 'f> {
    pub fn new(packet: &'p mut [u8], on_chunk: &'s mut ChunkSink<'f>) -> Self {
        assert!(!packet.is_empty(), "chunk buffer must not be empty");
        Self {
            packet,
            used: 0,
            on_chunk,
            aborted: false,
        }
    }

    /// Append bytes, emitting chunks whenever the buffer fills up.
    pub fn write(&mut self, mut data: &[u8]) -> bool {
        while !data.is_empty() {
            if self.aborted {
                return false;
            }
            let n = (self.packet.len() - self.used).min(data.len());
            self.packet[self.used..self.used + n].copy_from_slice(&data[..n]);
            self.used += n;
            data = &data[n..];
            if self.used == self.packet.len() {
                self.flush();
            }
        }
        !self.aborted
    }

    /// Emit the final partial chunk, if any.
    pub fn finish(mut self) -> bool {
        if self.used > 0 {
            self.flush();
        }
        !self.aborted
    }

    fn flush(&mut self) {
        if !self.aborted && !(self.on_chunk)(&self.packet[..self.used]) {
            self.aborted = true;
        }
        self.used = 0;
    }
}

/// Serializes an opaque byte payload as `[u32 total length][bytes]`.
pub struct BlobSerializer<'a> {
    data: &'a [u8],
}

impl<'a> BlobSerializer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

/// The `u32` size prefix of a blob, or `None` from 4 GiB on.
fn blob_size_prefix(len: usize) -> Option<[u8; 4]> {
    u32::try_from(len).ok().map(u32::to_le_bytes)
}

impl SceneUpdateSerializer for BlobSerializer<'_> {
    fn write_to_packets(&self, packet: &mut [u8], on_chunk: &mut ChunkSink<'_>) -> bool {
        let Some(prefix) = blob_size_prefix(self.data.len()) else {
            error!("Scene update of {} bytes is too large to serialize", self.data.len());
            return false;
        };
        let mut writer = PacketWriter::new(packet, on_chunk);
        writer.write(&prefix) && writer.write(self.data) && writer.finish()
    }
}

/// Collects scene-update chunks per sender and scene, in arrival order,
/// until a [`BlobSerializer`] payload is complete.
#[derive(Debug, Default)]
pub struct SceneUpdateReassembler {
    pending: HashMap<(ParticipantId, SceneId), Vec<u8>>,
}

impl SceneUpdateReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the payload once all announced bytes arrived.
    pub fn push(
        &mut self,
        from: ParticipantId,
        scene_id: SceneId,
        chunk: &[u8],
    ) -> Result<Option<Vec<u8>>, CodecError> {
        let key = (from, scene_id);
        let buffer = self.pending.entry(key).or_default();
        buffer.extend_from_slice(chunk);

        if buffer.len() < 4 {
            return Ok(None);
        }
        let expected = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        let received = buffer.len() - 4;
        if received < expected {
            return Ok(None);
        }

        let mut buffer = self.pending.remove(&key).unwrap_or_default();
        if received > expected {
            return Err(CodecError::ChunkOverrun { expected });
        }
        buffer.drain(..4);
        Ok(Some(buffer))
    }

    /// Drop partial state for a participant, e.g. after it disconnected.
    pub fn forget_participant(&mut self, from: &ParticipantId) {
        self.pending.retain(|(id, _), _| id != from);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_chunks(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        let mut packet = vec![0u8; chunk_size];
        let ok = BlobSerializer::new(data).write_to_packets(&mut packet, &mut |c: &[u8]| {
            chunks.push(c.to_vec());
            true
        });
        assert!(ok);
        chunks
    }

    #[test]
    fn test_large_payload_splits_into_three_chunks() {
        let data: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();
        let chunks = collect_chunks(&data, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 300_000);
        assert_eq!(chunks[1].len(), 300_000);
        assert_eq!(chunks[2].len(), 100_004);

        let from = ParticipantId::from_u128(1);
        let mut reassembler = SceneUpdateReassembler::new();
        assert_eq!(reassembler.push(from, SceneId(5), &chunks[0]).unwrap(), None);
        assert_eq!(reassembler.push(from, SceneId(5), &chunks[1]).unwrap(), None);
        let complete = reassembler.push(from, SceneId(5), &chunks[2]).unwrap().unwrap();
        assert_eq!(complete, data);
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_empty_payload_is_one_chunk() {
        let chunks = collect_chunks(&[], 64);
        assert_eq!(chunks, vec![vec![0, 0, 0, 0]]);

        let mut reassembler = SceneUpdateReassembler::new();
        let out = reassembler
            .push(ParticipantId::from_u128(1), SceneId(1), &chunks[0])
            .unwrap();
        assert_eq!(out, Some(Vec::new()));
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_chunk() {
        // 4 byte header + 12 bytes data = 2 chunks of 8
        let chunks = collect_chunks(&[7u8; 12], 8);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 8));
    }

    #[test]
    fn test_tiny_chunks_split_the_header() {
        let data = b"hello world".to_vec();
        let chunks = collect_chunks(&data, 3);
        let mut reassembler = SceneUpdateReassembler::new();
        let from = ParticipantId::from_u128(9);
        let mut result = None;
        for chunk in &chunks {
            result = reassembler.push(from, SceneId(2), chunk).unwrap();
        }
        assert_eq!(result, Some(data));
    }

    #[test]
    fn test_blob_size_prefix_limit() {
        assert_eq!(blob_size_prefix(5), Some([5, 0, 0, 0]));
        assert_eq!(blob_size_prefix(u32::MAX as usize), Some([0xFF; 4]));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(blob_size_prefix(u32::MAX as usize + 1), None);
    }

    #[test]
    fn test_abort_stops_further_chunks() {
        let data = vec![1u8; 100];
        let mut calls = 0;
        let mut packet = vec![0u8; 10];
        let ok = BlobSerializer::new(&data).write_to_packets(&mut packet, &mut |_c: &[u8]| {
            calls += 1;
            calls < 2
        });
        assert!(!ok);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_interleaved_scenes_are_kept_apart() {
        let a = collect_chunks(&[1u8; 20], 8);
        let b = collect_chunks(&[2u8; 20], 8);
        let from = ParticipantId::from_u128(3);
        let mut reassembler = SceneUpdateReassembler::new();

        let mut done = Vec::new();
        for (ca, cb) in a.iter().zip(b.iter()) {
            if let Some(p) = reassembler.push(from, SceneId(1), ca).unwrap() {
                done.push((1, p));
            }
            if let Some(p) = reassembler.push(from, SceneId(2), cb).unwrap() {
                done.push((2, p));
            }
        }
        assert_eq!(done, vec![(1, vec![1u8; 20]), (2, vec![2u8; 20])]);
    }

    #[test]
    fn test_overrun_is_an_error() {
        let mut chunk = 2u32.to_le_bytes().to_vec();
        chunk.extend_from_slice(&[1, 2, 3]);
        let mut reassembler = SceneUpdateReassembler::new();
        let err = reassembler
            .push(ParticipantId::from_u128(1), SceneId(1), &chunk)
            .unwrap_err();
        assert_eq!(err, CodecError::ChunkOverrun { expected: 2 });
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_forget_participant() {
        let mut reassembler = SceneUpdateReassembler::new();
        let a = ParticipantId::from_u128(1);
        let b = ParticipantId::from_u128(2);
        reassembler.push(a, SceneId(1), &[9, 0, 0, 0, 1]).unwrap();
        reassembler.push(b, SceneId(1), &[9, 0, 0, 0, 1]).unwrap();
        reassembler.forget_participant(&a);
        assert_eq!(reassembler.pending_count(), 1);
    }
}
