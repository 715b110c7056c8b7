//! Splits continuous PCM into fixed-duration timestamped chunks.

use chrono::Utc;
use uuid::Uuid;

use voxsentinel_common::chunk_size_bytes;
use voxsentinel_common::models::AudioChunk;

/// Buffers raw PCM byte runs and emits exact fixed-size [`AudioChunk`]s.
///
/// Trailing bytes smaller than one chunk at stream end are discarded.
pub struct ChunkProducer {
    stream_id: Uuid,
    session_id: Uuid,
    chunk_ms: u32,
    chunk_bytes: usize,
    buffer: Vec<u8>,
}

impl ChunkProducer {
    pub fn new(stream_id: Uuid, session_id: Uuid, chunk_ms: u32) -> Self {
        let chunk_bytes = chunk_size_bytes(chunk_ms);
        Self {
            stream_id,
            session_id,
            chunk_ms,
            chunk_bytes,
            buffer: Vec::with_capacity(chunk_bytes * 2),
        }
    }

    /// Chunk payload size in bytes.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Appends a PCM block and drains every complete chunk now available.
    pub fn push(&mut self, block: &[u8]) -> Vec<AudioChunk> {
        self.buffer.extend_from_slice(block);

        let mut chunks = Vec::new();
        while self.buffer.len() >= self.chunk_bytes {
            let pcm: Vec<u8> = self.buffer.drain(..self.chunk_bytes).collect();
            chunks.push(AudioChunk {
                chunk_id: Uuid::new_v4(),
                stream_id: self.stream_id,
                session_id: self.session_id,
                pcm,
                timestamp: Utc::now(),
                duration_ms: self.chunk_ms,
            });
        }
        chunks
    }

    /// Bytes currently buffered below one chunk.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK_SIZE: usize = 8960; // 280 ms at 16 kHz s16 mono

    fn producer() -> ChunkProducer {
        ChunkProducer::new(Uuid::new_v4(), Uuid::new_v4(), 280)
    }

    #[test]
    fn chunk_size_matches_duration() {
        assert_eq!(producer().chunk_bytes(), CHUNK_SIZE);
    }

    #[test]
    fn exact_payload_yields_one_chunk() {
        let mut p = producer();
        let chunks = p.push(&vec![1u8; CHUNK_SIZE]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].pcm.len(), CHUNK_SIZE);
        assert_eq!(chunks[0].duration_ms, 280);
        assert_eq!(p.pending_bytes(), 0);
    }

    #[test]
    fn double_payload_yields_two_chunks_with_unique_ids() {
        let mut p = producer();
        let chunks = p.push(&vec![2u8; CHUNK_SIZE * 2]);
        assert_eq!(chunks.len(), 2);
        assert_ne!(chunks[0].chunk_id, chunks[1].chunk_id);
    }

    #[test]
    fn trailing_bytes_stay_buffered_until_dropped() {
        let mut p = producer();
        let chunks = p.push(&vec![3u8; CHUNK_SIZE + 100]);
        assert_eq!(chunks.len(), 1);
        // The remainder is never emitted; it is simply discarded with the
        // producer at end of stream.
        assert_eq!(p.pending_bytes(), 100);
    }

    #[test]
    fn small_fragments_accumulate() {
        let mut p = producer();
        let mut total = Vec::new();
        for _ in 0..9 {
            total.extend(p.push(&[4u8; 1000]));
        }
        // 9000 bytes = one full chunk + 40 pending.
        assert_eq!(total.len(), 1);
        assert_eq!(p.pending_bytes(), 40);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut p = producer();
        assert!(p.push(&[]).is_empty());
    }
}
