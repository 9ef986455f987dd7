//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. The broker session is the only consumer: the
//! halves implement [`FrameSink`] and [`ByteSource`] so the bus client can
//! run on them directly.
//!
//! # Architecture
//!
//! A single [`connect`] function handles URL→request building, header
//! insertion (including the sub-protocol) and TLS negotiation. It returns a
//! ([`WsWriter`], [`WsReader`]) pair.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::error::RelayError;
use crate::mqtt::{ByteSource, FrameSink};

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping or pong; tungstenite answers pings itself.
    Control,
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Binary(data))
            .await
            .context("WebSocket send_binary failed")
    }

    /// Flush pending writes and close the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Raw `Frame` variants are skipped internally.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text)));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data)));
                }
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {
                    return Some(Ok(WsMessage::Control));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames are never yielded on read
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_frame(&mut self, bytes: Vec<u8>) -> crate::error::Result<()> {
        self.send_binary(bytes)
            .await
            .map_err(|e| RelayError::Transport(format!("{e:#}")))
    }

    async fn close(&mut self) -> crate::error::Result<()> {
        WsWriter::close(self)
            .await
            .map_err(|e| RelayError::Transport(format!("{e:#}")))
    }
}

#[async_trait]
impl ByteSource for WsReader {
    async fn next_chunk(&mut self) -> crate::error::Result<Option<Vec<u8>>> {
        loop {
            match self.recv().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data)),
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(WsMessage::Control)) => continue,
                Some(Ok(WsMessage::Close { code, reason })) => {
                    log::debug!("[MQTT] WebSocket closed by broker: {code} {reason}");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(RelayError::Transport(format!("{e:#}"))),
                None => return Ok(None),
            }
        }
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake within `deadline`.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// the handshake fails or it does not finish in time.
pub async fn connect(
    url: &str,
    headers: &[(&str, &str)],
    deadline: Duration,
) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .context("invalid WebSocket URL")?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) =
        tokio::time::timeout(deadline, tokio_tungstenite::connect_async(request))
            .await
            .context("WebSocket connect timed out")?
            .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Connect with a `Sec-WebSocket-Protocol` offer.
pub async fn connect_with_protocol(
    url: &str,
    protocol: &str,
    deadline: Duration,
) -> Result<(WsWriter, WsReader)> {
    connect(url, &[("Sec-WebSocket-Protocol", protocol)], deadline).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect("not-a-url", &[], Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect_with_protocol("wss://127.0.0.1:1/mqtt", "mqttv3.1", Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_header_rejected_before_connecting() {
        let result = connect("ws://127.0.0.1:1/mqtt", &[("bad header", "x")], Duration::from_secs(1)).await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("invalid header name"), "{err}");
    }
}
