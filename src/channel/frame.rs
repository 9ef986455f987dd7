//! Tunnel frame codec.
//!
//! ```text
//! [u8 type] [u8 format] [u8 compressed] [u8 reserved] [u32 BE length] [payload]
//! ```
//!
//! Frame types:
//! - `0x01`: Header (request/response metadata)
//! - `0x02`: Body
//!
//! Payload formats:
//! - `0x01`: JSON
//! - `0x02`: UTF-8 string
//! - `0x03`: binary
//!
//! When `compressed` is `1` the payload is a zlib stream.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;

use super::compression::{deflate, inflate};
use crate::error::{RelayError, Result};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Maximum payload accepted from the console (16 MB).
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Metadata half of a request or response.
    Header = 1,
    /// Body half of a request or response.
    Body = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Header),
            2 => Ok(Self::Body),
            other => Err(RelayError::Protocol(format!("unknown frame type {other:#04x}"))),
        }
    }
}

/// Payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadFormat {
    /// JSON document.
    Json = 1,
    /// UTF-8 text.
    String = 2,
    /// Opaque bytes.
    Binary = 3,
}

impl TryFrom<u8> for PayloadFormat {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Json),
            2 => Ok(Self::String),
            3 => Ok(Self::Binary),
            other => Err(RelayError::Protocol(format!("unknown payload format {other:#04x}"))),
        }
    }
}

/// One frame as it travels on the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFrame {
    /// Header or body.
    pub frame_type: FrameType,
    /// How the (decompressed) payload is encoded.
    pub format: PayloadFormat,
    /// Whether `payload` is a zlib stream.
    pub compressed: bool,
    /// Payload exactly as on the wire.
    pub payload: Vec<u8>,
}

impl TunnelFrame {
    /// Build a frame from plain data, compressing it when asked.
    pub fn new(frame_type: FrameType, format: PayloadFormat, data: &[u8], compress: bool) -> Result<Self> {
        let payload = if compress { deflate(data)? } else { data.to_vec() };
        Ok(Self {
            frame_type,
            format,
            compressed: compress,
            payload,
        })
    }

    /// Serialize header and payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            RelayError::InvalidInput(format!("frame payload too large: {} bytes", self.payload.len()))
        })?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.frame_type as u8);
        out.push(self.format as u8);
        out.push(u8::from(self.compressed));
        out.push(0);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Payload with compression undone.
    pub fn data(&self) -> Result<Vec<u8>> {
        if self.compressed {
            inflate(&self.payload)
        } else {
            Ok(self.payload.clone())
        }
    }

    /// Payload parsed as JSON, whatever its declared format.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data()?)?)
    }
}

/// Reassembles frames from data channel messages.
///
/// A message may carry several frames, and a frame may span messages.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every frame now complete.
    ///
    /// # Errors
    ///
    /// [`RelayError::Protocol`] on an unknown type or format byte, or an
    /// oversized length.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<TunnelFrame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while self.buf.len() >= HEADER_LEN {
            let frame_type = FrameType::try_from(self.buf[0])?;
            let format = PayloadFormat::try_from(self.buf[1])?;
            let compressed = match self.buf[2] {
                0 => false,
                1 => true,
                other => {
                    return Err(RelayError::Protocol(format!(
                        "invalid compression flag {other:#04x}"
                    )))
                }
            };
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if len > MAX_PAYLOAD {
                return Err(RelayError::Protocol(format!("frame too large: {len} bytes")));
            }
            if self.buf.len() < HEADER_LEN + len {
                break;
            }

            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(len).to_vec();
            frames.push(TunnelFrame {
                frame_type,
                format,
                compressed,
                payload,
            });
        }

        Ok(frames)
    }

    /// Whether part of a frame is still buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = TunnelFrame::new(FrameType::Body, PayloadFormat::Binary, b"abc", false).unwrap();
        assert_eq!(frame.encode().unwrap(), vec![2, 3, 0, 0, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_compressed_frame_flags_and_data() {
        let frame =
            TunnelFrame::new(FrameType::Header, PayloadFormat::Json, br#"{"id":"x"}"#, true).unwrap();
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..4], &[1, 1, 1, 0]);
        let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!(len, bytes.len() - HEADER_LEN);

        let value: serde_json::Value = frame.json().unwrap();
        assert_eq!(value["id"], "x");
    }

    #[test]
    fn test_reader_handles_two_frames_in_one_message() {
        let header = TunnelFrame::new(FrameType::Header, PayloadFormat::Json, b"{}", true).unwrap();
        let body = TunnelFrame::new(FrameType::Body, PayloadFormat::Binary, b"[1]", false).unwrap();
        let mut message = header.encode().unwrap();
        message.extend(body.encode().unwrap());

        let frames = FrameReader::new().feed(&message).unwrap();
        assert_eq!(frames, vec![header, body]);
    }

    #[test]
    fn test_reader_handles_split_frames() {
        let frame = TunnelFrame::new(FrameType::Body, PayloadFormat::String, b"hello", false).unwrap();
        let bytes = frame.encode().unwrap();

        let mut reader = FrameReader::new();
        assert!(reader.feed(&bytes[..3]).unwrap().is_empty());
        assert!(reader.feed(&bytes[3..10]).unwrap().is_empty());
        assert!(reader.has_partial());
        assert_eq!(reader.feed(&bytes[10..]).unwrap(), vec![frame]);
        assert!(!reader.has_partial());
    }

    #[test]
    fn test_reader_rejects_unknown_type() {
        let err = FrameReader::new().feed(&[9, 1, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn test_reader_rejects_unknown_format() {
        let err = FrameReader::new().feed(&[1, 7, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn test_reader_rejects_oversized_length() {
        let err = FrameReader::new().feed(&[1, 1, 0, 0, 0x7f, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
