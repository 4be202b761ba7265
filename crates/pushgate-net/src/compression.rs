//! Conditional LZ4 compression for data frame payloads.
//!
//! Large payloads are compressed with LZ4 before transmission, while small ones
//! skip compression to avoid overhead. Whether a payload is compressed is
//! recorded in the frame header flags, not in the payload itself.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Controls when payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum payload size (bytes) before compression is applied. Default: 1024.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 1024,
            enabled: true,
        }
    }
}

/// Compress `data` if the config calls for it.
///
/// Returns `None` when the payload should travel uncompressed, including the
/// case where LZ4 would not make it smaller.
pub fn compress_payload(data: &[u8], config: &CompressionConfig) -> Option<Vec<u8>> {
    if !config.enabled || data.len() < config.threshold {
        return None;
    }
    let compressed = compress_prepend_size(data);
    (compressed.len() < data.len()).then_some(compressed)
}

/// Decompress a payload produced by [`compress_payload`].
///
/// The size prefix is checked against `max_len` before anything is allocated.
pub fn decompress_payload(data: &[u8], max_len: usize) -> Result<Vec<u8>, CompressionError> {
    let Some(prefix) = data.get(..4) else {
        return Err(CompressionError::MissingSizePrefix);
    };
    let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if declared > max_len {
        return Err(CompressionError::TooLarge {
            size: declared,
            max: max_len,
        });
    }

    decompress_size_prepended(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
}

/// Errors that can occur during payload decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The payload is too short to hold the LZ4 size prefix.
    #[error("compressed payload is missing its size prefix")]
    MissingSizePrefix,
    /// The declared decompressed size exceeds the allowed maximum.
    #[error("decompressed size {size} exceeds maximum {max}")]
    TooLarge {
        /// Declared decompressed size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_not_compressed() {
        let config = CompressionConfig::default();
        assert!(compress_payload(b"tiny", &config).is_none());
    }

    #[test]
    fn test_disabled_config_never_compresses() {
        let config = CompressionConfig {
            threshold: 0,
            enabled: false,
        };
        assert!(compress_payload(&[7u8; 4096], &config).is_none());
    }

    #[test]
    fn test_repetitive_payload_compresses_and_restores() {
        let config = CompressionConfig::default();
        let data = vec![42u8; 8192];
        let compressed = compress_payload(&data, &config).expect("should compress");
        assert!(compressed.len() < data.len());
        let restored = decompress_payload(&compressed, 8192).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_declared_size_over_limit_rejected() {
        let config = CompressionConfig::default();
        let compressed = compress_payload(&vec![1u8; 4096], &config).unwrap();
        let result = decompress_payload(&compressed, 1024);
        assert!(matches!(
            result,
            Err(CompressionError::TooLarge { size: 4096, max: 1024 })
        ));
    }

    #[test]
    fn test_missing_prefix_rejected() {
        assert!(matches!(
            decompress_payload(&[1, 2], 1024),
            Err(CompressionError::MissingSizePrefix)
        ));
    }

    #[test]
    fn test_garbage_body_rejected() {
        let mut data = 64u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0xFF; 8]);
        assert!(matches!(
            decompress_payload(&data, 1024),
            Err(CompressionError::DecompressFailed(_))
        ));
    }
}
