//! In-memory fakes for driving the relay without a network.
//!
//! - [`TestBroker`]: acknowledges everything a bus client sends and records
//!   subscriptions and publishes
//! - [`FakeConnector`] / [`FakePeer`]: scripted peer connections
//! - [`fake_channel_pair`]: a data channel and its far end
//! - [`spawn_console`]: answers offers and serves API channels like a console
//! - [`session_credentials`]: a fixed credential set

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::frame::{FrameReader, FrameType, PayloadFormat, TunnelFrame};
use crate::cloud::{SessionCredentials, TurnCredentials};
use crate::error::{RelayError, Result};
use crate::mqtt::codec::FrameDecoder;
use crate::mqtt::{memory_transport, ConnectOptions, MemoryPeer, MqttClient, Packet};
use crate::webrtc::{DataChannel, IceServer, PeerConnection, PeerConnector, PeerEvent, PeerEvents, PeerState};

/// Subscribe/unsubscribe history seen by a [`TestBroker`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerLog {
    /// Filters subscribed, in order.
    pub subscribed: Vec<String>,
    /// Filters unsubscribed, in order.
    pub unsubscribed: Vec<String>,
}

/// Broker that acknowledges every request from one client.
#[derive(Debug)]
pub struct TestBroker {
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    published: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
    log: Arc<Mutex<BrokerLog>>,
    task: JoinHandle<()>,
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestBroker {
    /// Serve the far end of an in-memory transport.
    pub fn spawn(peer: MemoryPeer) -> Self {
        let MemoryPeer { mut from_client, to_client } = peer;
        let (published_tx, published) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(BrokerLog::default()));

        let task = tokio::spawn({
            let to_client = to_client.clone();
            let log = Arc::clone(&log);
            async move {
                let mut decoder = FrameDecoder::new();
                while let Some(bytes) = from_client.recv().await {
                    let Ok(frames) = decoder.feed(&bytes) else {
                        return;
                    };
                    for frame in frames {
                        let Ok(packet) = Packet::from_frame(&frame) else {
                            return;
                        };
                        let reply = match packet {
                            Packet::Connect { .. } => Some(Packet::ConnAck),
                            Packet::Subscribe { packet_id, topic, .. } => {
                                log.lock().expect("broker log mutex poisoned").subscribed.push(topic);
                                Some(Packet::SubAck { packet_id, granted_qos: 1 })
                            }
                            Packet::Unsubscribe { packet_id, topic } => {
                                log.lock().expect("broker log mutex poisoned").unsubscribed.push(topic);
                                Some(Packet::UnsubAck { packet_id })
                            }
                            Packet::Publish { topic, packet_id, payload, .. } => {
                                let _ = published_tx.send((topic, payload));
                                packet_id.map(|packet_id| Packet::PubAck { packet_id })
                            }
                            _ => None,
                        };
                        let Some(reply) = reply else { continue };
                        let Ok(bytes) = reply.encode() else { return };
                        if to_client.send(bytes).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Self {
            to_client,
            published,
            log,
            task,
        }
    }

    /// Next message the client published, as `(topic, payload)`.
    ///
    /// # Panics
    ///
    /// If the client went away.
    pub async fn published(&mut self) -> (String, Vec<u8>) {
        self.published.recv().await.expect("client published nothing more")
    }

    /// Deliver a QoS 0 publish to the client.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let packet = Packet::Publish {
            topic: topic.to_string(),
            qos: 0,
            packet_id: None,
            payload: payload.to_vec(),
        };
        if let Ok(bytes) = packet.encode() {
            let _ = self.to_client.send(bytes);
        }
    }

    /// Filters subscribed so far.
    pub fn subscribed(&self) -> Vec<String> {
        self.log_handle().lock().expect("broker log mutex poisoned").subscribed.clone()
    }

    /// Filters unsubscribed so far.
    pub fn unsubscribed(&self) -> Vec<String> {
        self.log_handle().lock().expect("broker log mutex poisoned").unsubscribed.clone()
    }

    /// Shared view of the subscription history.
    pub fn log_handle(&self) -> Arc<Mutex<BrokerLog>> {
        Arc::clone(&self.log)
    }
}

/// Connect a bus client to a fresh [`TestBroker`].
///
/// # Panics
///
/// If the handshake fails.
pub async fn connect_bus() -> (MqttClient, TestBroker) {
    let (sink, source, peer) = memory_transport();
    let broker = TestBroker::spawn(peer);
    let options = ConnectOptions {
        client_id: "mqttjs_0000beef".to_string(),
        ..ConnectOptions::default()
    };
    let bus = MqttClient::connect(sink, source, options)
        .await
        .expect("bus connects to test broker");
    (bus, broker)
}

/// Credentials for identity `us-east-1:identity` with one TURN server.
pub fn session_credentials() -> SessionCredentials {
    SessionCredentials {
        access_key_id: "ASIAEXAMPLE".to_string(),
        secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
        session_token: "token/with+chars=".to_string(),
        region: "us-east-1".to_string(),
        identity_id: "us-east-1:identity".to_string(),
        turn_credentials: TurnCredentials {
            username: "turn-user".to_string(),
            password: "turn-pass".to_string(),
            uris: vec!["turn:turn.example.com:3478?transport=udp".to_string()],
        },
    }
}

/// Local end of an in-memory data channel.
#[derive(Debug)]
pub struct FakeChannel {
    label: String,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Far end of an in-memory data channel.
#[derive(Debug)]
pub struct RemoteChannel {
    label: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl RemoteChannel {
    /// Channel label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next message from the local end, `None` once it closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Send a message to the local end.
    pub fn send(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(bytes);
    }
}

/// Build a connected data channel pair.
pub fn fake_channel_pair(label: &str) -> (FakeChannel, RemoteChannel) {
    let (local_tx, remote_rx) = mpsc::unbounded_channel();
    let (remote_tx, local_rx) = mpsc::unbounded_channel();
    (
        FakeChannel {
            label: label.to_string(),
            tx: Some(local_tx),
            rx: local_rx,
        },
        RemoteChannel {
            label: label.to_string(),
            rx: remote_rx,
            tx: remote_tx,
        },
    )
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn wait_open(&mut self) -> Result<()> {
        if self.tx.is_none() {
            return Err(RelayError::ConnectionClosed);
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(RelayError::ConnectionClosed)?;
        tx.send(data.to_vec())
            .map_err(|_| RelayError::Transport("remote channel dropped".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

/// How a [`FakePeer`] behaves.
#[derive(Debug, Clone)]
pub struct PeerScript {
    /// Local candidates raised after the local description is set.
    pub local_candidates: Vec<String>,
    /// Report `Connected` once an answer is installed.
    pub connect_on_answer: bool,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            local_candidates: vec![
                "candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host".to_string(),
            ],
            connect_on_answer: true,
        }
    }
}

/// Everything a [`FakePeer`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct PeerRecord {
    /// Local description installed.
    pub local_sdp: Option<String>,
    /// Remote description installed.
    pub remote_sdp: Option<String>,
    /// Remote candidates added, with the time they were applied.
    pub remote_candidates: Vec<(String, Instant)>,
    /// Labels of data channels created.
    pub channels: Vec<String>,
    /// ICE servers the connection was created with.
    pub ice_servers: Vec<IceServer>,
    /// Whether `close` was called.
    pub closed: bool,
}

/// Scripted peer connection.
pub struct FakePeer {
    events: mpsc::UnboundedSender<PeerEvent>,
    script: PeerScript,
    record: Arc<Mutex<PeerRecord>>,
    remotes: mpsc::UnboundedSender<RemoteChannel>,
    state: Arc<Mutex<PeerState>>,
    negotiation_requested: AtomicBool,
}

impl std::fmt::Debug for FakePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakePeer").finish_non_exhaustive()
    }
}

impl FakePeer {
    fn record(&self) -> std::sync::MutexGuard<'_, PeerRecord> {
        self.record.lock().expect("peer record mutex poisoned")
    }

    fn set_state(&self, state: PeerState) {
        *self.state.lock().expect("peer state mutex poisoned") = state;
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<String> {
        Ok("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n".to_string())
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        self.record().local_sdp = Some(sdp.to_string());
        self.set_state(PeerState::Connecting);
        for candidate in &self.script.local_candidates {
            let _ = self.events.send(PeerEvent::LocalCandidate(Some(candidate.clone())));
        }
        let _ = self.events.send(PeerEvent::LocalCandidate(None));
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        if !sdp.starts_with("v=0") {
            return Err(RelayError::Negotiation("Invalid SDP answer".to_string()));
        }
        self.record().remote_sdp = Some(sdp.to_string());
        if self.script.connect_on_answer {
            self.set_state(PeerState::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        self.record()
            .remote_candidates
            .push((candidate.to_string(), Instant::now()));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>> {
        if self.record().closed {
            return Err(RelayError::ConnectionClosed);
        }
        self.record().channels.push(label.to_string());
        let (local, remote) = fake_channel_pair(label);
        let _ = self.remotes.send(remote);
        if !self.negotiation_requested.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(PeerEvent::NegotiationNeeded);
        }
        Ok(Box::new(local))
    }

    fn connection_state(&self) -> PeerState {
        *self.state.lock().expect("peer state mutex poisoned")
    }

    fn ice_servers(&self) -> Vec<IceServer> {
        self.record().ice_servers.clone()
    }

    fn close(&self) {
        self.record().closed = true;
        *self.state.lock().expect("peer state mutex poisoned") = PeerState::Closed;
    }
}

/// Creates [`FakePeer`]s and keeps a handle on the latest one.
pub struct FakeConnector {
    script: PeerScript,
    record: Arc<Mutex<PeerRecord>>,
    remotes: mpsc::UnboundedSender<RemoteChannel>,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    state: Mutex<Option<Arc<Mutex<PeerState>>>>,
}

impl std::fmt::Debug for FakeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeConnector").finish_non_exhaustive()
    }
}

impl FakeConnector {
    /// Create a connector and the stream of far ends of every data channel
    /// its peers open.
    pub fn new(script: PeerScript) -> (Self, mpsc::UnboundedReceiver<RemoteChannel>) {
        let (remotes, remotes_rx) = mpsc::unbounded_channel();
        (
            Self {
                script,
                record: Arc::new(Mutex::new(PeerRecord::default())),
                remotes,
                events: Mutex::new(None),
                state: Mutex::new(None),
            },
            remotes_rx,
        )
    }

    /// Snapshot of what the latest peer was asked to do.
    pub fn record(&self) -> PeerRecord {
        self.record.lock().expect("peer record mutex poisoned").clone()
    }

    /// Raise an event on the latest peer.
    pub fn emit(&self, event: PeerEvent) {
        if let Some(events) = self.events.lock().expect("events mutex poisoned").as_ref() {
            let _ = events.send(event);
        }
    }

    /// Move the latest peer to `state` and report the change.
    pub fn set_peer_state(&self, state: PeerState) {
        if let Some(current) = self.state.lock().expect("state mutex poisoned").as_ref() {
            *current.lock().expect("peer state mutex poisoned") = state;
        }
        self.emit(PeerEvent::StateChanged(state));
    }
}

impl PeerConnector for FakeConnector {
    fn create(&self, ice_servers: Vec<IceServer>) -> Result<(Arc<dyn PeerConnection>, PeerEvents)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *self.record.lock().expect("peer record mutex poisoned") = PeerRecord {
            ice_servers,
            ..PeerRecord::default()
        };
        *self.events.lock().expect("events mutex poisoned") = Some(events_tx.clone());
        let state = Arc::new(Mutex::new(PeerState::New));
        *self.state.lock().expect("state mutex poisoned") = Some(Arc::clone(&state));

        let peer = FakePeer {
            events: events_tx,
            script: self.script.clone(),
            record: Arc::clone(&self.record),
            remotes: self.remotes.clone(),
            state,
            negotiation_requested: AtomicBool::new(false),
        };
        Ok((Arc::new(peer), events_rx))
    }
}

/// Console-side request handler: `(method, path, body) -> (status, json)`.
pub type ConsoleHandler =
    Arc<dyn Fn(&str, &str, &[u8]) -> (u16, serde_json::Value) + Send + Sync>;

/// Signaling topic the device answers on for a given publish topic.
pub fn reply_topic(publish_topic: &str) -> String {
    publish_topic.replacen("/device/", "/", 1)
}

/// Play the console: answer every offer on the bus and serve every API
/// channel with `handler`. Returns the broker once the bus goes quiet.
pub fn spawn_console(
    mut broker: TestBroker,
    mut remotes: mpsc::UnboundedReceiver<RemoteChannel>,
    handler: ConsoleHandler,
) -> JoinHandle<TestBroker> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = broker.published.recv() => {
                    let Some((topic, payload)) = message else { break };
                    let Ok(event) = serde_json::from_slice::<serde_json::Value>(&payload) else {
                        continue;
                    };
                    if event["event"] == "offer" {
                        let reply = reply_topic(&topic);
                        broker.inject(&reply, br#"{"event":"answer","answer":"v=0\r\no=- 2 2 IN IP4 0.0.0.0\r\n"}"#);
                        broker.inject(
                            &reply,
                            br#"{"event":"icecandidate","candidate":"a=candidate:2 1 udp 1 10.0.0.2 40000 typ host"}"#,
                        );
                        broker.inject(&reply, br#"{"event":"sdpcomplete"}"#);
                    }
                }
                remote = remotes.recv() => {
                    let Some(remote) = remote else { break };
                    tokio::spawn(serve_channel(remote, Arc::clone(&handler)));
                }
            }
        }
        broker
    })
}

async fn serve_channel(mut remote: RemoteChannel, handler: ConsoleHandler) {
    let mut reader = FrameReader::new();
    let mut frames = VecDeque::new();
    while let Some(bytes) = remote.recv().await {
        let Ok(decoded) = reader.feed(&bytes) else { return };
        frames.extend(decoded);
        while frames.len() >= 2 {
            let (Some(header), Some(body)) = (frames.pop_front(), frames.pop_front()) else {
                return;
            };
            let Ok(header) = header.json::<serde_json::Value>() else { return };
            let Ok(body) = body.data() else { return };
            let method = header["method"].as_str().unwrap_or_default();
            let path = header["path"].as_str().unwrap_or_default();
            let (status, reply) = handler(method, path, &body);

            let response_header = serde_json::json!({
                "id": header["id"],
                "type": "httpResponse",
                "statusCode": status,
                "statusMessage": if status == 200 { "OK" } else { "Error" },
            });
            let Ok(reply) = encode_response(&response_header, &reply) else { return };
            remote.send(reply);
        }
    }
}

fn encode_response(header: &serde_json::Value, body: &serde_json::Value) -> Result<Vec<u8>> {
    let mut bytes =
        TunnelFrame::new(FrameType::Header, PayloadFormat::Json, &serde_json::to_vec(header)?, true)?.encode()?;
    bytes.extend(TunnelFrame::new(FrameType::Body, PayloadFormat::Binary, &serde_json::to_vec(body)?, true)?.encode()?);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_topic() {
        assert_eq!(
            reply_topic("client/me/device/dev1/connect/s-1"),
            "client/me/dev1/connect/s-1"
        );
    }

    #[tokio::test]
    async fn test_broker_records_traffic() {
        let (bus, mut broker) = connect_bus().await;
        let _sub = bus.subscribe("a/+").await.unwrap();
        bus.publish("a/b", b"x".to_vec()).await.unwrap();
        bus.unsubscribe("a/+").await.unwrap();

        assert_eq!(broker.published().await, ("a/b".to_string(), b"x".to_vec()));
        assert_eq!(broker.subscribed(), vec!["a/+".to_string()]);
        assert_eq!(broker.unsubscribed(), vec!["a/+".to_string()]);
    }
}
