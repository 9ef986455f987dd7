//! Deflate compression for tunnel frame payloads.
//!
//! Frames flag compression in their header instead of with a marker byte,
//! so these helpers work on bare payloads. The stream format is zlib
//! ("deflate" as the console's HTTP stack names it).
//!
//! # Usage
//!
//! ```ignore
//! let packed = deflate(body)?;
//! let body = inflate(&packed)?;
//! ```

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{RelayError, Result};

/// Compress `data` into a zlib stream.
///
/// # Errors
///
/// Returns [`RelayError::Compression`] if encoding fails.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| RelayError::Compression(format!("deflate write failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| RelayError::Compression(format!("deflate finish failed: {e}")))
}

/// Decompress a zlib stream.
///
/// # Errors
///
/// Returns [`RelayError::Compression`] if the stream is corrupt or truncated.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| RelayError::Compression(format!("inflate failed: {e}")))?;
    Ok(decompressed)
}
