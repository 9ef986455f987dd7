//! Byte transport seam for the bus client.
//!
//! The broker is reached over a WebSocket in production ([`crate::ws`]);
//! tests use the in-memory pair from [`memory_transport`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};

/// Outbound half: writes one encoded packet per call.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one packet's bytes.
    async fn send_frame(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Close the transport. Further sends fail.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half: yields byte chunks with no regard for packet boundaries.
#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk of bytes, or `None` once the peer has closed.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// [`FrameSink`] over an unbounded channel.
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// [`ByteSource`] over an unbounded channel.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// The far end of an in-memory transport, as seen by a fake broker.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Bytes the client wrote, one packet per message.
    pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Bytes delivered to the client, arbitrarily chunked.
    pub to_client: mpsc::UnboundedSender<Vec<u8>>,
}

/// Build a connected in-memory transport.
pub fn memory_transport() -> (MemorySink, MemorySource, MemoryPeer) {
    let (client_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, client_rx) = mpsc::unbounded_channel();
    (
        MemorySink { tx: Some(client_tx) },
        MemorySource { rx: client_rx },
        MemoryPeer { from_client, to_client },
    )
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, bytes: Vec<u8>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(RelayError::ConnectionClosed)?;
        tx.send(bytes)
            .map_err(|_| RelayError::Transport("peer dropped".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_round_trip() {
        let (mut sink, mut source, mut peer) = memory_transport();
        sink.send_frame(vec![1, 2]).await.unwrap();
        assert_eq!(peer.from_client.recv().await, Some(vec![1, 2]));

        peer.to_client.send(vec![3]).unwrap();
        assert_eq!(source.next_chunk().await.unwrap(), Some(vec![3]));

        drop(peer);
        assert_eq!(source.next_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_sends() {
        let (mut sink, _source, _peer) = memory_transport();
        sink.close().await.unwrap();
        assert_eq!(sink.send_frame(vec![0]).await, Err(RelayError::ConnectionClosed));
    }
}
