//! API channels tunneled over the peer connection.
//!
//! Each [`ApiChannel`] owns one data channel of the device's shared peer
//! connection and runs one request at a time over it.
//!
//! # Architecture
//!
//! ```text
//! ApiChannel
//!     │
//!     ├── ApiRequest ──encode──► [Header frame][Body frame] ──► DataChannel
//!     │
//!     └── FrameReader ◄──────── [Header frame][Body frame] ◄── DataChannel
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut channel = ApiChannel::open(peer.as_ref(), "api:1", &registry, timeouts).await?;
//! let vouchers = channel.get("/proxy/network/api/s/default/stat/voucher").await?;
//! channel.close().await;
//! ```
//!
//! A failed call (wrong id, non-200 status, malformed frame, timeout)
//! closes that channel only. The peer connection and the bus stay usable
//! for new channels.

pub mod compression;
pub mod frame;
pub mod request;

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::constants::{API_CHANNEL_PREFIX, CHANNEL_OPEN_TIMEOUT, RPC_RESPONSE_TIMEOUT};
use crate::error::{with_deadline, RelayError, Result};
use crate::webrtc::{DataChannel, PeerConnection};
use frame::{FrameReader, FrameType, TunnelFrame};
use request::ResponseHeader;

pub use compression::{deflate, inflate};
pub use frame::PayloadFormat;
pub use request::ApiRequest;

/// HTTP status the console answers a successful call with.
const HTTP_SUCCESS: u16 = 200;

/// Deadlines applied by an [`ApiChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimeouts {
    /// Wait for the data channel to open.
    pub open: Duration,
    /// Wait for a complete response.
    pub response: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            open: CHANNEL_OPEN_TIMEOUT,
            response: RPC_RESPONSE_TIMEOUT,
        }
    }
}

/// Open API channels of one device, plus the label sequence.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    open: Arc<Mutex<BTreeSet<String>>>,
    sequence: Arc<AtomicU32>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next channel label: `api:1`, `api:2`, ...
    pub fn next_label(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{API_CHANNEL_PREFIX}:{n}")
    }

    /// Labels of channels currently open.
    pub fn open_labels(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Number of channels currently open.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no channel is open.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lease(&self, label: &str) -> ChannelLease {
        self.lock().insert(label.to_string());
        ChannelLease {
            registry: self.clone(),
            label: label.to_string(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.open.lock().expect("channel registry mutex poisoned")
    }
}

/// Registry entry removed when the channel goes away.
#[derive(Debug)]
struct ChannelLease {
    registry: ChannelRegistry,
    label: String,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.label);
    }
}

/// One request/response tunnel to the console.
pub struct ApiChannel {
    label: String,
    channel: Option<Box<dyn DataChannel>>,
    reader: FrameReader,
    pending: VecDeque<TunnelFrame>,
    response_timeout: Duration,
    lease: Option<ChannelLease>,
}

impl std::fmt::Debug for ApiChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiChannel")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl ApiChannel {
    /// Create a data channel named `label` on `peer`, wait for it to open and
    /// register it in `registry`.
    ///
    /// # Errors
    ///
    /// [`RelayError::Timeout`] if the channel does not open in time, or the
    /// error reported by the peer connection.
    pub async fn open(
        peer: &dyn PeerConnection,
        label: &str,
        registry: &ChannelRegistry,
        timeouts: ChannelTimeouts,
    ) -> Result<Self> {
        let mut channel = peer.create_data_channel(label).await?;
        let opened = with_deadline(timeouts.open, &format!("channel {label} to open"), channel.wait_open()).await;
        if let Err(e) = opened {
            channel.close().await;
            return Err(e);
        }

        log::debug!("[RPC] Channel {label} open");
        let mut api = Self::new(channel, timeouts.response);
        api.lease = Some(registry.lease(label));
        Ok(api)
    }

    /// Wrap an already open data channel.
    pub fn new(channel: Box<dyn DataChannel>, response_timeout: Duration) -> Self {
        Self {
            label: channel.label().to_string(),
            channel: Some(channel),
            reader: FrameReader::new(),
            pending: VecDeque::new(),
            response_timeout,
            lease: None,
        }
    }

    /// Channel label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the channel can still carry requests.
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// `GET path`.
    pub async fn get(&mut self, path: &str) -> Result<serde_json::Value> {
        let request = ApiRequest::get(path)?;
        self.send(&request).await
    }

    /// `POST path` with `body` as JSON.
    pub async fn post<T: Serialize>(&mut self, path: &str, body: &T) -> Result<serde_json::Value> {
        let request = ApiRequest::post(path, body)?;
        self.send(&request).await
    }

    /// Send `request` and wait for its response body.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Correlation`] if the response id differs or the status
    ///   is not 200 (the body is not parsed then)
    /// - [`RelayError::Protocol`] on a malformed or out-of-order frame
    /// - [`RelayError::Timeout`] if no complete response arrives in time
    /// - [`RelayError::ConnectionClosed`] if the channel closed
    ///
    /// Any error closes this channel.
    pub async fn send(&mut self, request: &ApiRequest) -> Result<serde_json::Value> {
        let result = self.exchange(request).await;
        if let Err(e) = &result {
            log::warn!("[RPC] {} {} on {} failed: {e}", request.method(), request.path(), self.label);
            self.close().await;
        }
        result
    }

    async fn exchange(&mut self, request: &ApiRequest) -> Result<serde_json::Value> {
        let bytes = request.encode()?;
        let channel = self.channel.as_mut().ok_or(RelayError::ConnectionClosed)?;
        log::debug!("[RPC] {} {} ({})", request.method(), request.path(), request.id());
        channel.send(&bytes).await?;

        let what = format!("response to {}", request.id());
        with_deadline(self.response_timeout, &what, self.read_response(request.id())).await
    }

    async fn read_response(&mut self, id: &str) -> Result<serde_json::Value> {
        let header = self.next_frame(FrameType::Header).await?;
        let body = self.next_frame(FrameType::Body).await?;

        let header: ResponseHeader = header.json()?;
        if header.id.as_deref() != Some(id) {
            return Err(RelayError::Correlation(format!(
                "Invalid response id expected {id} but got {}",
                header.id.as_deref().unwrap_or("none")
            )));
        }
        match header.status_code {
            Some(HTTP_SUCCESS) => {}
            status => {
                let status = status.map_or_else(|| "no status".to_string(), |s| s.to_string());
                return Err(RelayError::Correlation(format!(
                    "Fetching failed {status} {}",
                    header.status_message.unwrap_or_default()
                )));
            }
        }

        body.json()
    }

    async fn next_frame(&mut self, expected: FrameType) -> Result<TunnelFrame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                if frame.frame_type != expected {
                    return Err(RelayError::Protocol(format!(
                        "expected {expected:?} frame, got {:?}",
                        frame.frame_type
                    )));
                }
                return Ok(frame);
            }

            let channel = self.channel.as_mut().ok_or(RelayError::ConnectionClosed)?;
            let message = channel.recv().await?.ok_or(RelayError::ConnectionClosed)?;
            self.pending.extend(self.reader.feed(&message)?);
        }
    }

    /// Close the data channel and leave the registry. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
            log::debug!("[RPC] Channel {} closed", self.label);
        }
        self.pending.clear();
        self.lease = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_channel_pair, RemoteChannel};

    fn response(id: &str, status: u16, message: &str, body: &[u8]) -> Vec<u8> {
        let header = serde_json::json!({
            "id": id,
            "type": "httpResponse",
            "statusCode": status,
            "statusMessage": message,
        });
        let mut bytes = TunnelFrame::new(FrameType::Header, PayloadFormat::Json, &serde_json::to_vec(&header).unwrap(), true)
            .unwrap()
            .encode()
            .unwrap();
        bytes.extend(
            TunnelFrame::new(FrameType::Body, PayloadFormat::Binary, body, true)
                .unwrap()
                .encode()
                .unwrap(),
        );
        bytes
    }

    async fn request_id(remote: &mut RemoteChannel) -> (String, serde_json::Value) {
        let bytes = remote.recv().await.expect("request");
        let frames = FrameReader::new().feed(&bytes).unwrap();
        let header: serde_json::Value = frames[0].json().unwrap();
        (header["id"].as_str().unwrap().to_string(), header)
    }

    fn channel() -> (ApiChannel, RemoteChannel) {
        let (local, remote) = fake_channel_pair("api:1");
        (ApiChannel::new(Box::new(local), Duration::from_secs(5)), remote)
    }

    #[tokio::test]
    async fn test_successful_get_returns_json_body() {
        let (mut api, mut remote) = channel();
        let console = tokio::spawn(async move {
            let (id, header) = request_id(&mut remote).await;
            assert_eq!(header["method"], "GET");
            assert_eq!(header["path"], "/proxy/network/api/self");
            remote.send(response(&id, 200, "OK", br#"{"meta":{"rc":"ok"},"data":[]}"#));
            remote
        });

        let value = api.get("/proxy/network/api/self").await.unwrap();
        assert_eq!(value["meta"]["rc"], "ok");
        assert!(api.is_open());
        console.await.unwrap();
    }

    #[tokio::test]
    async fn test_not_found_is_correlation_error_without_parsing_body() {
        let (mut api, mut remote) = channel();
        tokio::spawn(async move {
            let (id, _) = request_id(&mut remote).await;
            remote.send(response(&id, 404, "Not Found", b"<html>not json</html>"));
            remote
        });

        let err = api.get("/missing").await.unwrap_err();
        match err {
            RelayError::Correlation(message) => assert!(message.contains("Not Found"), "{message}"),
            other => panic!("expected correlation error, got {other:?}"),
        }
        assert!(!api.is_open(), "failed channel closes");
    }

    #[tokio::test]
    async fn test_mismatched_id_is_correlation_error() {
        let (mut api, mut remote) = channel();
        tokio::spawn(async move {
            let _ = request_id(&mut remote).await;
            remote.send(response("someone-else", 200, "OK", b"{}"));
            remote
        });

        let err = api.post("/x", &serde_json::json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, RelayError::Correlation(_)));
    }

    #[tokio::test]
    async fn test_response_split_across_messages() {
        let (mut api, mut remote) = channel();
        tokio::spawn(async move {
            let (id, _) = request_id(&mut remote).await;
            let bytes = response(&id, 200, "OK", br#"{"data":[1,2,3]}"#);
            for chunk in bytes.chunks(5) {
                remote.send(chunk.to_vec());
            }
            remote
        });

        let value = api.get("/split").await.unwrap();
        assert_eq!(value["data"], serde_json::json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_body_before_header_is_protocol_error() {
        let (mut api, mut remote) = channel();
        tokio::spawn(async move {
            let _ = request_id(&mut remote).await;
            remote.send(
                TunnelFrame::new(FrameType::Body, PayloadFormat::Binary, b"{}", false)
                    .unwrap()
                    .encode()
                    .unwrap(),
            );
            remote
        });

        let err = api.get("/x").await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_console_times_out() {
        let (mut api, _remote) = channel();
        let err = api.get("/slow").await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)));
        assert!(!api.is_open());
    }

    #[tokio::test]
    async fn test_closed_remote_is_connection_closed() {
        let (mut api, remote) = channel();
        drop(remote);
        let err = api.get("/x").await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed | RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn test_sequential_requests_reuse_channel() {
        let (mut api, mut remote) = channel();
        tokio::spawn(async move {
            for n in 0..2 {
                let (id, _) = request_id(&mut remote).await;
                remote.send(response(&id, 200, "OK", format!("{{\"n\":{n}}}").as_bytes()));
            }
            remote
        });

        assert_eq!(api.get("/a").await.unwrap()["n"], 0);
        assert_eq!(api.get("/b").await.unwrap()["n"], 1);
    }

    #[test]
    fn test_registry_labels_and_leases() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.next_label(), "api:1");
        assert_eq!(registry.next_label(), "api:2");

        let lease = registry.lease("api:1");
        assert_eq!(registry.open_labels(), vec!["api:1".to_string()]);
        drop(lease);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_registry_entry() {
        let registry = ChannelRegistry::new();
        let (mut api, _remote) = channel();
        api.lease = Some(registry.lease("api:1"));
        assert_eq!(registry.len(), 1);

        api.close().await;
        api.close().await;
        assert!(registry.is_empty());
        assert!(matches!(api.get("/x").await, Err(RelayError::ConnectionClosed)));
    }
}
