//! Payload compression for stored agent code.
//!
//! Payloads above the threshold are gzipped, base64-encoded and tagged with
//! [`COMPRESSION_PREFIX`] so readers can tell them apart from plain code.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{Result, SynthesisError};

/// Marker prepended to compressed payloads
pub const COMPRESSION_PREFIX: &str = "gzip+base64:";

/// A payload ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub data: String,
    pub compressed: bool,
    pub original_size: usize,
}

impl EncodedPayload {
    /// Stored size over original size, `1.00` when uncompressed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.data.len() as f64 / self.original_size as f64
    }
}

/// Compress `code` when it is larger than `threshold` bytes.
pub fn encode(code: &str, threshold: usize) -> Result<EncodedPayload> {
    if code.len() <= threshold {
        return Ok(EncodedPayload {
            data: code.to_string(),
            compressed: false,
            original_size: code.len(),
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(code.as_bytes())?;
    let gzipped = encoder.finish()?;

    Ok(EncodedPayload {
        data: format!("{COMPRESSION_PREFIX}{}", STANDARD.encode(gzipped)),
        compressed: true,
        original_size: code.len(),
    })
}

/// Recover the original code from a stored payload. Untagged payloads are
/// returned unchanged.
pub fn decode(data: &str) -> Result<String> {
    let Some(encoded) = data.strip_prefix(COMPRESSION_PREFIX) else {
        return Ok(data.to_string());
    };

    let gzipped = STANDARD
        .decode(encoded)
        .map_err(|e| SynthesisError::Encoding(format!("invalid base64 payload: {e}")))?;

    let mut code = String::new();
    GzDecoder::new(gzipped.as_slice())
        .read_to_string(&mut code)
        .map_err(|e| SynthesisError::Encoding(format!("invalid gzip payload: {e}")))?;
    Ok(code)
}
