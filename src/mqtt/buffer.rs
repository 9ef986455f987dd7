//! Buffered packet reader over a [`ByteSource`].
//!
//! Reads suspend until enough bytes are buffered and never return partial
//! data. Every read takes `&mut self`, so at most one read can be pending.

use bytes::{Buf, BytesMut};

use super::codec::BusFrame;
use super::transport::ByteSource;
use crate::error::{RelayError, Result};

/// Accumulates inbound chunks and hands out whole packets.
#[derive(Debug)]
pub struct InputBuffer<S> {
    source: S,
    bytes: BytesMut,
}

impl<S: ByteSource> InputBuffer<S> {
    /// Wrap a byte source with an empty buffer.
    pub fn new(source: S) -> Self {
        Self {
            source,
            bytes: BytesMut::new(),
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.bytes.len()
    }

    /// Pull chunks until at least `n` bytes are buffered.
    ///
    /// Returns `false` if the source ended before any byte arrived and
    /// `allow_eof` is set.
    async fn fill(&mut self, n: usize, allow_eof: bool) -> Result<bool> {
        while self.bytes.len() < n {
            match self.source.next_chunk().await? {
                Some(chunk) => self.bytes.extend_from_slice(&chunk),
                None if allow_eof && self.bytes.is_empty() => return Ok(false),
                None => return Err(RelayError::ConnectionClosed),
            }
        }
        Ok(true)
    }

    /// Wait for the first byte of the next packet without consuming it.
    ///
    /// Returns `None` when the source closed cleanly between packets.
    pub async fn peek_byte(&mut self) -> Result<Option<u8>> {
        if !self.fill(1, true).await? {
            return Ok(None);
        }
        Ok(Some(self.bytes[0]))
    }

    /// Extract exactly `n` bytes.
    pub async fn extract_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.fill(n, false).await?;
        Ok(self.bytes.split_to(n).to_vec())
    }

    /// Extract one byte.
    pub async fn extract_byte(&mut self) -> Result<u8> {
        self.fill(1, false).await?;
        Ok(self.bytes.get_u8())
    }

    /// Extract a variable-length remaining-length field.
    pub async fn extract_remaining_length(&mut self) -> Result<usize> {
        let mut value = 0usize;
        let mut multiplier = 1usize;
        for _ in 0..4 {
            let byte = self.extract_byte().await?;
            value += (byte as usize & 0x7F) * multiplier;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            multiplier *= 128;
        }
        Err(RelayError::Protocol(
            "remaining length longer than 4 bytes".to_string(),
        ))
    }

    /// Extract one complete packet frame, or `None` at a clean end of stream.
    pub async fn extract_frame(&mut self) -> Result<Option<BusFrame>> {
        let Some(control) = self.peek_byte().await? else {
            return Ok(None);
        };
        self.bytes.advance(1);
        let length = self.extract_remaining_length().await?;
        let payload = self.extract_bytes(length).await?;
        Ok(Some(BusFrame::new(control, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::transport::memory_transport;

    #[tokio::test]
    async fn test_extract_waits_for_full_length() {
        let (_sink, source, peer) = memory_transport();
        let mut buffer = InputBuffer::new(source);

        let feeder = tokio::spawn(async move {
            for chunk in [vec![1u8], vec![2, 3], vec![4, 5, 6]] {
                peer.to_client.send(chunk).unwrap();
                tokio::task::yield_now().await;
            }
            peer
        });

        assert_eq!(buffer.extract_bytes(5).await.unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(buffer.buffered(), 1);
        assert_eq!(buffer.extract_byte().await.unwrap(), 6);
        let _peer = feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_split_across_chunks() {
        let (_sink, source, peer) = memory_transport();
        let mut buffer = InputBuffer::new(source);

        // PUBLISH, remaining length 130 (two-byte form), split mid-length.
        let mut bytes = vec![0x30, 0x82, 0x01];
        bytes.extend(std::iter::repeat(0xAB).take(130));
        peer.to_client.send(bytes[..2].to_vec()).unwrap();
        peer.to_client.send(bytes[2..70].to_vec()).unwrap();
        peer.to_client.send(bytes[70..].to_vec()).unwrap();

        let frame = buffer.extract_frame().await.unwrap().unwrap();
        assert_eq!(frame.packet_type, 0x30);
        assert_eq!(frame.payload.len(), 130);
        assert_eq!(buffer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_clean_eof_between_frames() {
        let (_sink, source, peer) = memory_transport();
        let mut buffer = InputBuffer::new(source);
        peer.to_client.send(vec![0x20, 0x02, 0x00, 0x00]).unwrap();
        drop(peer);

        assert!(buffer.extract_frame().await.unwrap().is_some());
        assert!(buffer.extract_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_connection_closed() {
        let (_sink, source, peer) = memory_transport();
        let mut buffer = InputBuffer::new(source);
        peer.to_client.send(vec![0x90, 0x03, 0x00]).unwrap();
        drop(peer);

        assert_eq!(buffer.extract_frame().await, Err(RelayError::ConnectionClosed));
    }
}
