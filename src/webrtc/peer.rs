//! Peer-connection capability.
//!
//! ICE, DTLS and SCTP live behind these traits. The negotiator and the
//! tunnel only see SDP strings, candidate strings and byte messages, so they
//! run unchanged against [`super::rtc`] in production and against scripted
//! fakes in tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// One ICE server entry, serialized the way browsers expect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// `turn:` / `turns:` / `stun:` URIs.
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Aggregate connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Nothing started yet.
    New,
    /// ICE/DTLS in progress.
    Connecting,
    /// Transport up.
    Connected,
    /// Connectivity lost, may recover.
    Disconnected,
    /// Gave up.
    Failed,
    /// Closed locally.
    Closed,
}

/// Events raised by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local offer is needed (first data channel created).
    NegotiationNeeded,
    /// A local candidate (`candidate:...`), or `None` when gathering ended.
    LocalCandidate(Option<String>),
    /// The connection state changed.
    StateChanged(PeerState),
}

/// Receiver half of a peer connection's event stream.
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Offer/answer and data channel operations on one peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create a local offer and return its SDP.
    async fn create_offer(&self) -> Result<String>;

    /// Install `sdp` (an offer) as the local description.
    async fn set_local_description(&self, sdp: &str) -> Result<()>;

    /// Install `sdp` (an answer) as the remote description.
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;

    /// Add a remote candidate (`candidate:...`).
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;

    /// Open a data channel with the given label.
    async fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>>;

    /// Current connection state.
    fn connection_state(&self) -> PeerState;

    /// ICE servers the connection was configured with.
    fn ice_servers(&self) -> Vec<IceServer>;

    /// Close the connection and every channel on it.
    fn close(&self);
}

/// One reliable, ordered message channel.
#[async_trait]
pub trait DataChannel: Send {
    /// Channel label.
    fn label(&self) -> &str;

    /// Wait until the channel can carry messages.
    async fn wait_open(&mut self) -> Result<()>;

    /// Send one message.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Next message, or `Ok(None)` once the channel closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// Close this channel only.
    async fn close(&mut self);
}

/// Factory for peer connections.
pub trait PeerConnector: Send + Sync {
    /// Create a connection configured with `ice_servers`.
    fn create(&self, ice_servers: Vec<IceServer>) -> Result<(Arc<dyn PeerConnection>, PeerEvents)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_server_wire_shape() {
        let server = IceServer {
            urls: vec!["turn:turn.example.com:3478?transport=udp".to_string()],
            username: Some("user".to_string()),
            credential: Some("pass".to_string()),
        };
        let json = serde_json::to_value(&server).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "urls": ["turn:turn.example.com:3478?transport=udp"],
                "username": "user",
                "credential": "pass"
            })
        );
    }

    #[test]
    fn test_ice_server_without_credentials() {
        let server: IceServer = serde_json::from_str(r#"{"urls":["stun:s"]}"#).unwrap();
        assert_eq!(server.username, None);
        assert_eq!(serde_json::to_string(&server).unwrap(), r#"{"urls":["stun:s"]}"#);
    }
}
