//! Document compression for snapshots and `upload_state` payloads.
//!
//! Small documents are not worth compressing: anything whose encoded JSON is
//! below the configured threshold is stored raw with `method = "none"`. The
//! codec itself is pluggable behind [`CompressionProvider`].

use graphpad_proto::{AppState, CompressedBlob, CompressionMethod};

use crate::error::{ErrorKind, RelayError, Result};

/// A pluggable codec identified by its method tag.
pub trait CompressionProvider: Send + Sync {
    fn method(&self) -> CompressionMethod;
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Identity codec. Useful in tests and as an explicit "store raw" choice.
pub struct NoopProvider;

impl CompressionProvider for NoopProvider {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block codec with the uncompressed size prepended.
pub struct Lz4Provider;

impl CompressionProvider for Lz4Provider {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Lz4
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(raw))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| RelayError::internal("lz4 decompression failed", e))
    }
}

/// Threshold-gated wrapper around the active provider.
pub struct Compression {
    provider: Box<dyn CompressionProvider>,
    threshold: usize,
}

impl Compression {
    pub fn new(provider: Box<dyn CompressionProvider>, threshold: usize) -> Self {
        Self { provider, threshold }
    }

    pub fn lz4(threshold: usize) -> Self {
        Self::new(Box::new(Lz4Provider), threshold)
    }

    /// Encode a document, compressing only when the encoded form reaches
    /// the threshold.
    pub fn pack(&self, doc: &AppState) -> Result<CompressedBlob> {
        let raw = serde_json::to_vec(doc)
            .map_err(|e| RelayError::internal("document serialization failed", e))?;
        if raw.len() < self.threshold {
            return Ok(CompressedBlob {
                method: CompressionMethod::None,
                data: raw,
            });
        }
        Ok(CompressedBlob {
            method: self.provider.method(),
            data: self.provider.compress(&raw)?,
        })
    }

    /// Decode a blob produced by [`pack`](Self::pack). The stored method tag
    /// must be `none` or match the active provider.
    pub fn unpack(&self, blob: &CompressedBlob) -> Result<AppState> {
        let raw = if blob.method == CompressionMethod::None {
            blob.data.clone()
        } else if blob.method == self.provider.method() {
            self.provider.decompress(&blob.data).map_err(|e| {
                RelayError::new(ErrorKind::Internal, "stored payload failed to decompress")
                    .with_context("method", blob.method)
                    .with_source(e)
            })?
        } else {
            return Err(RelayError::new(
                ErrorKind::Internal,
                format!(
                    "stored compression method {} does not match active provider {}",
                    blob.method,
                    self.provider.method()
                ),
            ));
        };
        serde_json::from_slice(&raw)
            .map_err(|e| RelayError::internal("stored document failed to parse", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with_payload(bytes: usize) -> AppState {
        // "x" repeated inside a string field inflates the encoded size
        // predictably
        serde_json::from_value(json!({
            "version": 1,
            "idGen": "0",
            "pages": [],
            "padding": "x".repeat(bytes)
        }))
        .unwrap()
    }

    fn encoded_len(doc: &AppState) -> usize {
        serde_json::to_vec(doc).unwrap().len()
    }

    #[test]
    fn test_round_trip() {
        let compression = Compression::lz4(500);
        let doc = doc_with_payload(2_000);
        let blob = compression.pack(&doc).unwrap();
        assert_eq!(blob.method, CompressionMethod::Lz4);
        assert_eq!(compression.unpack(&blob).unwrap(), doc);
    }

    #[test]
    fn test_threshold_boundary() {
        let compression = Compression::lz4(500);

        let mut doc = doc_with_payload(0);
        let base = encoded_len(&doc);
        // grow the padding until the encoded document is exactly one byte
        // under the threshold
        doc = doc_with_payload(499 - base);
        assert_eq!(encoded_len(&doc), 499);
        assert_eq!(
            compression.pack(&doc).unwrap().method,
            CompressionMethod::None
        );

        doc = doc_with_payload(500 - base);
        assert_eq!(encoded_len(&doc), 500);
        assert_eq!(
            compression.pack(&doc).unwrap().method,
            CompressionMethod::Lz4
        );
    }

    #[test]
    fn test_small_payload_stays_raw_and_unpacks() {
        let compression = Compression::lz4(500);
        let doc = doc_with_payload(10);
        let blob = compression.pack(&doc).unwrap();
        assert_eq!(blob.method, CompressionMethod::None);
        assert_eq!(compression.unpack(&blob).unwrap(), doc);
    }

    #[test]
    fn test_method_mismatch_is_internal() {
        let lz4 = Compression::lz4(0);
        let doc = doc_with_payload(10);
        let blob = lz4.pack(&doc).unwrap();
        assert_eq!(blob.method, CompressionMethod::Lz4);

        let noop_only = Compression::new(Box::new(NoopProvider), 0);
        let err = noop_only.unpack(&blob).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn test_corrupt_payload_carries_cause() {
        let compression = Compression::lz4(0);
        // valid 5-byte size prefix, garbage block data
        let blob = CompressedBlob {
            method: CompressionMethod::Lz4,
            data: vec![5, 0, 0, 0, 0xff],
        };
        let err = compression.unpack(&blob).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.source.is_some());
    }
}
