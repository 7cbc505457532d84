//! Payload encoding: compression plus inline/blob routing.
//!
//! Content is always gzip-compressed before it leaves the device. Compressed
//! payloads below the inline threshold travel inside the record; larger ones
//! go to the blob store and the record keeps only the locator.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::entity::{Payload, RemoteRecord};
use crate::hash::ContentHash;
use crate::remote::{BlobStore, RemoteError};

/// Compressed payloads smaller than this are stored inline.
pub const INLINE_THRESHOLD: usize = 100 * 1024;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Compression IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt payload: {0}")]
    Corrupt(String),

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Blob store error: {0}")]
    Blob(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, PayloadError>;

pub fn compress(content: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(encoder.finish()?)
}

pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut output)
        .map_err(|e| PayloadError::Corrupt(e.to_string()))?;
    Ok(output)
}

/// Compress `content` and decide where it lives.
#[instrument(skip(content, blobs), fields(size = content.len()))]
pub async fn encode<B: BlobStore + ?Sized>(
    content: &[u8],
    inline_threshold: usize,
    blobs: &B,
) -> Result<Payload> {
    let compressed = compress(content)?;
    if compressed.len() < inline_threshold {
        debug!("inline payload, {} compressed bytes", compressed.len());
        return Ok(Payload::Inline(compressed));
    }
    let compressed_len = compressed.len();
    let locator = blobs.upload(compressed).await?;
    debug!("blob payload {}, {} compressed bytes", locator, compressed_len);
    Ok(Payload::BlobRef(locator))
}

/// Fetch, decompress, and verify the content a record describes.
#[instrument(skip(record, blobs), fields(path = %record.path))]
pub async fn decode<B: BlobStore + ?Sized>(record: &RemoteRecord, blobs: &B) -> Result<Vec<u8>> {
    let content = match &record.payload {
        Payload::Inline(bytes) => decompress(bytes)?,
        Payload::BlobRef(locator) => decompress(&blobs.download(locator).await?)?,
    };

    let actual = ContentHash::from_bytes(&content);
    if actual != record.content_hash {
        return Err(PayloadError::HashMismatch {
            expected: record.content_hash.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fixtures::remote;
    use crate::remote::InMemoryBlobStore;
    use rand::RngCore;

    fn incompressible(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        rand::rng().fill_bytes(&mut bytes);
        bytes
    }

    #[test]
    fn test_compress_round_trip() {
        for content in [&b""[..], b"hello", &[0u8; 10_000][..]] {
            assert_eq!(decompress(&compress(content).unwrap()).unwrap(), content);
        }
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(matches!(
            decompress(b"definitely not gzip"),
            Err(PayloadError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_small_content_is_inlined() {
        let blobs = InMemoryBlobStore::new();
        let payload = encode(b"# note\n", INLINE_THRESHOLD, &blobs).await.unwrap();
        assert!(matches!(payload, Payload::Inline(_)));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_large_content_goes_to_blob_store_and_back() {
        let blobs = InMemoryBlobStore::new();
        let content = incompressible(INLINE_THRESHOLD + 1024);

        let payload = encode(&content, INLINE_THRESHOLD, &blobs).await.unwrap();
        assert!(matches!(payload, Payload::BlobRef(_)));
        assert_eq!(blobs.len(), 1);

        let record = RemoteRecord {
            payload,
            ..remote("big.bin", &content, 1)
        };
        assert_eq!(decode(&record, &blobs).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_large_but_compressible_content_stays_inline() {
        let blobs = InMemoryBlobStore::new();
        let content = vec![b'a'; INLINE_THRESHOLD * 4];
        let payload = encode(&content, INLINE_THRESHOLD, &blobs).await.unwrap();
        assert!(matches!(payload, Payload::Inline(_)));
    }

    #[tokio::test]
    async fn test_decode_detects_hash_mismatch() {
        let blobs = InMemoryBlobStore::new();
        let record = RemoteRecord {
            payload: Payload::Inline(compress(b"tampered").unwrap()),
            ..remote("a.md", b"original", 1)
        };
        assert!(matches!(
            decode(&record, &blobs).await,
            Err(PayloadError::HashMismatch { .. })
        ));
    }
}
