//! Content-addressed artifact cache and chunked transfer.

pub mod cache;
pub mod transfer;

pub use cache::{
    checksum, compress, decompress, ArtifactCache, ArtifactError, ArtifactKind, CachePartition,
    CachedArtifact, CompressionKind,
};
pub use transfer::{chunk_stream, ArtifactChunk, ChunkAssembler, DEFAULT_CHUNK_SIZE};
