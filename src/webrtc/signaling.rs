//! Signaling over the bus.
//!
//! One [`Signaling`] value covers one negotiation session with one device.
//! Outbound events go to the device's connect topic; inbound events arrive
//! on the client's session topic. Every published event carries a
//! per-session sequence number starting at 1.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::peer::IceServer;
use crate::error::Result;
use crate::mqtt::{MqttClient, Subscription};

/// Topic names for one negotiation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingTopics {
    /// `client/<identity>/+`: general client channel.
    pub channel: String,
    /// `client/<identity>/<device>/connect/<session>-1`: replies from the device.
    pub session: String,
    /// `client/<identity>/device/<device>/connect/<session>-1`: events to the device.
    pub publish: String,
}

impl SignalingTopics {
    /// Build the topic set for `identity` talking to `device`.
    pub fn new(identity: &str, device: &str, session: &str) -> Self {
        Self {
            channel: format!("client/{identity}/+"),
            session: format!("client/{identity}/{device}/connect/{session}-1"),
            publish: format!("client/{identity}/device/{device}/connect/{session}-1"),
        }
    }
}

/// Event sent to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundSignal {
    /// Local offer plus the TURN servers the device should use.
    Offer {
        /// Sequence number.
        seq: u32,
        /// Offer SDP.
        offer: String,
        /// ICE servers.
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServer>,
    },
    /// One local candidate.
    #[serde(rename = "icecandidate")]
    IceCandidate {
        /// Sequence number.
        seq: u32,
        /// `candidate:...` line.
        candidate: String,
    },
}

/// Event received from the device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundSignal {
    /// Remote answer SDP.
    Answer {
        /// Answer SDP.
        answer: String,
    },
    /// One remote candidate; `None` marks the end of trickling.
    #[serde(rename = "icecandidate")]
    IceCandidate {
        /// Candidate line, possibly prefixed with `a=`.
        #[serde(default)]
        candidate: Option<String>,
    },
    /// The device finished sending candidates.
    SdpComplete,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

impl InboundSignal {
    /// Parse a raw bus payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Normalise a remote candidate line: strip an `a=` attribute prefix.
pub fn normalize_candidate(candidate: &str) -> &str {
    candidate.strip_prefix("a=").unwrap_or(candidate)
}

/// Publish/subscribe helper for one negotiation session.
#[derive(Debug, Clone)]
pub struct Signaling {
    bus: MqttClient,
    topics: SignalingTopics,
    seq: Arc<AtomicU32>,
}

impl Signaling {
    /// Start a new session with a random id.
    pub fn new(bus: MqttClient, identity: &str, device: &str) -> Self {
        let session = uuid::Uuid::new_v4().to_string();
        Self::with_session(bus, identity, device, &session)
    }

    /// Start a session with a caller-chosen id.
    pub fn with_session(bus: MqttClient, identity: &str, device: &str, session: &str) -> Self {
        Self {
            bus,
            topics: SignalingTopics::new(identity, device, session),
            seq: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Topic names in use.
    pub fn topics(&self) -> &SignalingTopics {
        &self.topics
    }

    /// Subscribe the general client channel and log what arrives on it
    /// until the subscription ends.
    pub async fn watch_channel(&self) -> Result<JoinHandle<()>> {
        let mut channel = self.bus.subscribe(&self.topics.channel).await?;
        Ok(tokio::spawn(async move {
            while let Some(message) = channel.recv().await {
                log::debug!(
                    "[Signaling] Channel message on {}: {}",
                    message.topic,
                    String::from_utf8_lossy(&message.payload)
                );
            }
        }))
    }

    /// Subscribe the session reply topic.
    pub async fn open_session(&self) -> Result<Subscription> {
        self.bus.subscribe(&self.topics.session).await
    }

    /// Drop the session reply subscription.
    pub async fn close_session(&self) -> Result<()> {
        self.bus.unsubscribe(&self.topics.session).await
    }

    /// Next sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish the local offer.
    pub async fn publish_offer(&self, sdp: &str, ice_servers: &[IceServer]) -> Result<()> {
        let signal = OutboundSignal::Offer {
            seq: self.next_seq(),
            offer: sdp.to_string(),
            ice_servers: ice_servers.to_vec(),
        };
        log::debug!("[Signaling] Publishing offer");
        self.publish(&signal).await
    }

    /// Publish one local candidate.
    pub async fn publish_candidate(&self, candidate: &str) -> Result<()> {
        let signal = OutboundSignal::IceCandidate {
            seq: self.next_seq(),
            candidate: candidate.to_string(),
        };
        log::debug!("[Signaling] Publishing candidate {candidate}");
        self.publish(&signal).await
    }

    async fn publish(&self, signal: &OutboundSignal) -> Result<()> {
        let payload = serde_json::to_vec(signal)?;
        self.bus.publish(&self.topics.publish, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::connect_bus;

    #[test]
    fn test_topics() {
        let topics = SignalingTopics::new("me", "dev1", "s1");
        assert_eq!(topics.channel, "client/me/+");
        assert_eq!(topics.session, "client/me/dev1/connect/s1-1");
        assert_eq!(topics.publish, "client/me/device/dev1/connect/s1-1");
    }

    #[test]
    fn test_offer_wire_shape() {
        let signal = OutboundSignal::Offer {
            seq: 1,
            offer: "v=0".to_string(),
            ice_servers: vec![IceServer {
                urls: vec!["turn:t".to_string()],
                username: Some("u".to_string()),
                credential: Some("c".to_string()),
            }],
        };
        assert_eq!(
            serde_json::to_value(&signal).unwrap(),
            serde_json::json!({
                "event": "offer",
                "seq": 1,
                "offer": "v=0",
                "iceServers": [{"urls": ["turn:t"], "username": "u", "credential": "c"}]
            })
        );
    }

    #[test]
    fn test_candidate_wire_shape() {
        let signal = OutboundSignal::IceCandidate {
            seq: 4,
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&signal).unwrap(),
            r#"{"event":"icecandidate","seq":4,"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host"}"#
        );
    }

    #[test]
    fn test_parse_inbound() {
        assert_eq!(
            InboundSignal::parse(br#"{"event":"answer","answer":"v=0"}"#).unwrap(),
            InboundSignal::Answer { answer: "v=0".to_string() }
        );
        assert_eq!(
            InboundSignal::parse(br#"{"event":"icecandidate","candidate":"a=candidate:1"}"#)
                .unwrap(),
            InboundSignal::IceCandidate { candidate: Some("a=candidate:1".to_string()) }
        );
        assert_eq!(
            InboundSignal::parse(br#"{"event":"icecandidate","candidate":null}"#).unwrap(),
            InboundSignal::IceCandidate { candidate: None }
        );
        assert_eq!(
            InboundSignal::parse(br#"{"event":"sdpcomplete"}"#).unwrap(),
            InboundSignal::SdpComplete
        );
        assert_eq!(
            InboundSignal::parse(br#"{"event":"stats","x":1}"#).unwrap(),
            InboundSignal::Unknown
        );
        assert!(InboundSignal::parse(b"not json").is_err());
    }

    #[test]
    fn test_normalize_candidate() {
        assert_eq!(normalize_candidate("a=candidate:1 1"), "candidate:1 1");
        assert_eq!(normalize_candidate("candidate:1 1"), "candidate:1 1");
    }

    #[tokio::test]
    async fn test_sequence_numbers_start_at_one_and_grow() {
        let (bus, mut broker) = connect_bus().await;
        let signaling = Signaling::with_session(bus, "me", "dev1", "s1");

        signaling.publish_offer("v=0", &[]).await.unwrap();
        signaling.publish_candidate("candidate:x").await.unwrap();

        let (topic, payload) = broker.published().await;
        assert_eq!(topic, "client/me/device/dev1/connect/s1-1");
        let offer: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(offer["seq"], 1);
        assert_eq!(offer["event"], "offer");

        let (_, payload) = broker.published().await;
        let candidate: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(candidate["seq"], 2);
        assert_eq!(candidate["candidate"], "candidate:x");
    }

    #[tokio::test]
    async fn test_session_subscription_receives_replies() {
        let (bus, broker) = connect_bus().await;
        let signaling = Signaling::with_session(bus, "me", "dev1", "s1");

        let mut session = signaling.open_session().await.unwrap();
        broker.inject("client/me/dev1/connect/s1-1", br#"{"event":"sdpcomplete"}"#);
        let message = session.recv().await.unwrap();
        assert_eq!(InboundSignal::parse(&message.payload).unwrap(), InboundSignal::SdpComplete);

        signaling.close_session().await.unwrap();
        assert!(session.recv().await.is_none());
        assert!(broker.unsubscribed().contains(&"client/me/dev1/connect/s1-1".to_string()));
    }
}
