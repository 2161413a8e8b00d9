//! Content-addressed artifact cache.
//!
//! Entries are keyed by artifact id and guarded by a SHA-256 checksum
//! over the uncompressed bytes. The cache answers worker cache queries
//! with a `{cached, missing}` partition so only missing artifacts get
//! streamed.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::ids::ArtifactId;

/// Errors that can occur during artifact operations.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The assembled bytes do not hash to the declared checksum.
    #[error("artifact {artifact_id} corrupt: expected {expected}, got {actual}")]
    Corrupt {
        artifact_id: ArtifactId,
        expected: String,
        actual: String,
    },

    /// No entry for the artifact id.
    #[error("artifact {0} not found")]
    NotFound(ArtifactId),

    /// A chunk arrived out of order.
    #[error("artifact {artifact_id} chunk out of order: expected sequence {expected}, got {got}")]
    OutOfOrder {
        artifact_id: ArtifactId,
        expected: u64,
        got: u64,
    },

    /// A chunk arrived after the final chunk.
    #[error("artifact {0} received data after the final chunk")]
    AfterLast(ArtifactId),

    /// The transfer carried no declared checksum to verify against.
    #[error("artifact {0} transfer declared no checksum")]
    MissingChecksum(ArtifactId),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),
}

/// Classification of a cached artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    Library,
    Dataset,
    Config,
    Resource,
    Image,
    Archive,
}

/// Compression applied to a stored or transferred payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionKind {
    None,
    Gzip,
    Zstd,
}

impl Default for CompressionKind {
    fn default() -> Self {
        Self::None
    }
}

/// Compresses `data` with the given codec.
pub fn compress(kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>, ArtifactError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| ArtifactError::Compression(format!("gzip encode: {e}")))
        }
        CompressionKind::Zstd => zstd::encode_all(data, 0)
            .map_err(|e| ArtifactError::Compression(format!("zstd encode: {e}"))),
    }
}

/// Decompresses `data` with the given codec.
pub fn decompress(kind: CompressionKind, data: &[u8]) -> Result<Vec<u8>, ArtifactError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ArtifactError::Compression(format!("gzip decode: {e}")))?;
            Ok(out)
        }
        CompressionKind::Zstd => zstd::decode_all(data)
            .map_err(|e| ArtifactError::Compression(format!("zstd decode: {e}"))),
    }
}

/// Computes the lowercase hex SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Metadata of a cached artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub artifact_id: ArtifactId,
    /// SHA-256 hex over the uncompressed bytes.
    pub checksum: String,
    /// Uncompressed byte length.
    pub size: u64,
    /// Codec of the stored bytes.
    pub compression: CompressionKind,
    /// Stored byte length (equals `size` when uncompressed).
    pub stored_size: u64,
    pub cached_at: DateTime<Utc>,
    pub kind: ArtifactKind,
}

struct CacheEntry {
    meta: CachedArtifact,
    data: Vec<u8>,
}

/// Partition of a cache query into verified hits and misses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePartition {
    pub cached: Vec<ArtifactId>,
    pub missing: Vec<ArtifactId>,
}

/// In-memory content-addressed cache, bounded by total stored bytes.
///
/// Oldest entries are evicted first when an insert would exceed the
/// bound.
pub struct ArtifactCache {
    entries: RwLock<HashMap<ArtifactId, CacheEntry>>,
    max_bytes: u64,
}

impl ArtifactCache {
    /// Creates a cache bounded at `max_bytes` of stored payload.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    /// Inserts uncompressed bytes and returns the entry metadata.
    pub fn insert(
        &self,
        artifact_id: ArtifactId,
        kind: ArtifactKind,
        data: Vec<u8>,
    ) -> CachedArtifact {
        let meta = CachedArtifact {
            artifact_id: artifact_id.clone(),
            checksum: checksum(&data),
            size: data.len() as u64,
            compression: CompressionKind::None,
            stored_size: data.len() as u64,
            cached_at: Utc::now(),
            kind,
        };

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Self::evict_for(&mut entries, data.len() as u64, self.max_bytes);
        entries.insert(
            artifact_id,
            CacheEntry {
                meta: meta.clone(),
                data,
            },
        );
        meta
    }

    fn evict_for(entries: &mut HashMap<ArtifactId, CacheEntry>, incoming: u64, max_bytes: u64) {
        let mut used: u64 = entries.values().map(|entry| entry.meta.stored_size).sum();
        while used + incoming > max_bytes && !entries.is_empty() {
            let oldest = entries
                .iter()
                .min_by_key(|(id, entry)| (entry.meta.cached_at, (*id).clone()))
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    if let Some(evicted) = entries.remove(&id) {
                        debug!(artifact_id = %id, "evicted artifact from cache");
                        used -= evicted.meta.stored_size;
                    }
                }
                None => break,
            }
        }
    }

    /// Returns the metadata for an artifact.
    pub fn get_meta(&self, artifact_id: &ArtifactId) -> Option<CachedArtifact> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(artifact_id)
            .map(|entry| entry.meta.clone())
    }

    /// Returns the uncompressed bytes for an artifact.
    pub fn get_bytes(&self, artifact_id: &ArtifactId) -> Result<Vec<u8>, ArtifactError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get(artifact_id)
            .ok_or_else(|| ArtifactError::NotFound(artifact_id.clone()))?;
        decompress(entry.meta.compression, &entry.data)
    }

    /// Returns whether a verified entry for the id exists.
    ///
    /// An entry whose stored bytes no longer hash to its recorded
    /// checksum does not count as cached.
    pub fn contains_valid(&self, artifact_id: &ArtifactId) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(artifact_id) {
            Some(entry) => match decompress(entry.meta.compression, &entry.data) {
                Ok(raw) => checksum(&raw) == entry.meta.checksum,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Splits the queried ids into verified cache hits and misses,
    /// preserving the query order.
    pub fn partition(&self, artifact_ids: &[ArtifactId]) -> CachePartition {
        let mut cached = Vec::new();
        let mut missing = Vec::new();
        for id in artifact_ids {
            if self.contains_valid(id) {
                cached.push(id.clone());
            } else {
                missing.push(id.clone());
            }
        }
        CachePartition { cached, missing }
    }

    /// Removes an entry.
    pub fn remove(&self, artifact_id: &ArtifactId) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(artifact_id)
            .is_some()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_sha256_hex() {
        let sum = checksum(b"Hello, World!");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, checksum(b"Hello, World!"));
        assert_ne!(sum, checksum(b"hello, world!"));
    }

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"some artifact payload, repeated payload payload".to_vec();
        let packed = compress(CompressionKind::Gzip, &data).unwrap();
        let unpacked = decompress(CompressionKind::Gzip, &packed).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_zstd_roundtrip() {
        let data = vec![7u8; 4096];
        let packed = compress(CompressionKind::Zstd, &data).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = decompress(CompressionKind::Zstd, &packed).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn test_none_passthrough() {
        let data = b"raw".to_vec();
        assert_eq!(compress(CompressionKind::None, &data).unwrap(), data);
        assert_eq!(decompress(CompressionKind::None, &data).unwrap(), data);
    }

    #[test]
    fn test_insert_and_retrieve() {
        let cache = ArtifactCache::new(1024 * 1024);
        let id = ArtifactId::new("lib-a");
        let meta = cache.insert(id.clone(), ArtifactKind::Library, b"bytes".to_vec());

        assert_eq!(meta.size, 5);
        assert_eq!(meta.checksum, checksum(b"bytes"));
        assert!(cache.contains_valid(&id));
        assert_eq!(cache.get_bytes(&id).unwrap(), b"bytes");
        assert!(matches!(
            cache.get_bytes(&ArtifactId::new("ghost")),
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[test]
    fn test_partition_preserves_query_order() {
        let cache = ArtifactCache::new(1024 * 1024);
        let x = ArtifactId::new("x");
        let y = ArtifactId::new("y");
        let z = ArtifactId::new("z");
        cache.insert(x.clone(), ArtifactKind::Library, b"x-bytes".to_vec());
        cache.insert(y.clone(), ArtifactKind::Dataset, b"y-bytes".to_vec());

        let partition = cache.partition(&[x.clone(), y.clone(), z.clone()]);
        assert_eq!(partition.cached, vec![x, y]);
        assert_eq!(partition.missing, vec![z]);
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let cache = ArtifactCache::new(10);
        let a = ArtifactId::new("a");
        let b = ArtifactId::new("b");
        cache.insert(a.clone(), ArtifactKind::Config, vec![0u8; 6]);
        cache.insert(b.clone(), ArtifactKind::Config, vec![1u8; 6]);

        assert!(!cache.contains_valid(&a));
        assert!(cache.contains_valid(&b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache = ArtifactCache::new(1024);
        let id = ArtifactId::new("a");
        cache.insert(id.clone(), ArtifactKind::Config, b"v".to_vec());

        assert!(cache.remove(&id));
        assert!(!cache.remove(&id));
        assert!(cache.is_empty());
    }
}
