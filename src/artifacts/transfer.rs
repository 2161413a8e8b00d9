//! Chunked artifact transfer with per-chunk compression.
//!
//! A transfer is a sequence of `ArtifactChunk` frames with strictly
//! increasing sequence numbers starting at 0; the frame with
//! `is_last = true` completes it and carries the whole-artifact
//! checksum. The receiver decompresses each chunk, reassembles the
//! payload, and verifies the SHA-256 over the decompressed bytes before
//! accepting it.

use async_stream::try_stream;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::artifacts::cache::{checksum, compress, decompress, ArtifactError, CompressionKind};
use crate::ids::ArtifactId;

/// Default chunk payload size before compression.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// One frame of a chunked artifact transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactChunk {
    pub artifact_id: ArtifactId,
    /// Chunk payload, possibly compressed.
    pub data: Vec<u8>,
    /// 0-based, strictly increasing within a transfer.
    pub sequence: u64,
    pub is_last: bool,
    /// Codec of this chunk's `data`; authoritative per chunk.
    #[serde(default)]
    pub compression: CompressionKind,
    /// Payload length before compression.
    pub original_size: u64,
    /// Whole-artifact SHA-256, carried on the final chunk.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Splits `data` into transfer chunks, compressing each one.
///
/// The final chunk carries `is_last = true` and the whole-artifact
/// checksum. Empty artifacts produce a single empty final chunk.
pub fn chunk_stream(
    artifact_id: ArtifactId,
    data: Vec<u8>,
    chunk_size: usize,
    compression: CompressionKind,
) -> impl Stream<Item = Result<ArtifactChunk, ArtifactError>> {
    try_stream! {
        let total_checksum = checksum(&data);
        let chunk_size = chunk_size.max(1);
        let total_chunks = data.len().div_ceil(chunk_size).max(1);

        for (index, raw) in split_chunks(&data, chunk_size, total_chunks).enumerate() {
            let packed = compress(compression, raw)?;
            let is_last = index + 1 == total_chunks;
            yield ArtifactChunk {
                artifact_id: artifact_id.clone(),
                data: packed,
                sequence: index as u64,
                is_last,
                compression,
                original_size: raw.len() as u64,
                checksum: is_last.then(|| total_checksum.clone()),
            };
        }
    }
}

fn split_chunks(
    data: &[u8],
    chunk_size: usize,
    total_chunks: usize,
) -> impl Iterator<Item = &[u8]> {
    // chunks() yields nothing for empty input; an empty transfer still
    // needs its final frame.
    let empty: &[u8] = &[];
    data.chunks(chunk_size)
        .chain(std::iter::once(empty).take(usize::from(data.is_empty())))
        .take(total_chunks)
}

/// Reassembles a chunked transfer and verifies its integrity.
pub struct ChunkAssembler {
    artifact_id: ArtifactId,
    next_sequence: u64,
    buffer: Vec<u8>,
    declared_checksum: Option<String>,
    completed: bool,
}

impl ChunkAssembler {
    /// Starts an assembler for one transfer.
    ///
    /// `declared_checksum` may come from a control message preceding the
    /// transfer; otherwise the final chunk must carry it.
    pub fn new(artifact_id: ArtifactId, declared_checksum: Option<String>) -> Self {
        Self {
            artifact_id,
            next_sequence: 0,
            buffer: Vec::new(),
            declared_checksum,
            completed: false,
        }
    }

    /// Feeds one chunk. Returns the complete, verified payload when the
    /// final chunk has been consumed.
    ///
    /// Out-of-order chunks and checksum mismatches poison the transfer;
    /// the partial buffer is discarded.
    pub fn push(&mut self, chunk: ArtifactChunk) -> Result<Option<Vec<u8>>, ArtifactError> {
        if self.completed {
            return Err(ArtifactError::AfterLast(self.artifact_id.clone()));
        }
        if chunk.sequence != self.next_sequence {
            let expected = self.next_sequence;
            self.buffer.clear();
            return Err(ArtifactError::OutOfOrder {
                artifact_id: self.artifact_id.clone(),
                expected,
                got: chunk.sequence,
            });
        }
        self.next_sequence += 1;

        let raw = decompress(chunk.compression, &chunk.data)?;
        self.buffer.extend_from_slice(&raw);

        if !chunk.is_last {
            return Ok(None);
        }

        self.completed = true;
        let expected = chunk
            .checksum
            .or_else(|| self.declared_checksum.clone())
            .ok_or_else(|| ArtifactError::MissingChecksum(self.artifact_id.clone()))?;
        let actual = checksum(&self.buffer);
        if actual != expected {
            self.buffer.clear();
            return Err(ArtifactError::Corrupt {
                artifact_id: self.artifact_id.clone(),
                expected,
                actual,
            });
        }

        Ok(Some(std::mem::take(&mut self.buffer)))
    }

    /// Returns whether the final chunk has been consumed.
    pub fn is_complete(&self) -> bool {
        self.completed
    }
}
