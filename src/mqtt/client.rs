//! MQTT bus client.
//!
//! One [`MqttClient`] is one logical bus session. A single pump task owns
//! the [`InputBuffer`] and processes packets strictly in arrival order;
//! callers await their acknowledgement on a oneshot registered under a
//! [`Correlation`] key before the request is written.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting -> AwaitingConnectAck -> Ready -> Closed
//! ```
//!
//! Any protocol or transport failure in the pump moves the session to
//! `Closed`: every pending waiter fails with the error that ended the
//! session (a refused CONNACK surfaces as [`RelayError::Protocol`]) and every
//! [`Subscription`] stream ends. Operations started after that see
//! [`RelayError::ConnectionClosed`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::buffer::InputBuffer;
use super::codec::{BusFrame, Packet};
use super::topic;
use super::transport::{ByteSource, FrameSink};
use crate::constants::{BUS_ACK_TIMEOUT, MQTT_CLIENT_ID_PREFIX, MQTT_SDK_USERNAME};
use crate::error::{with_deadline, RelayError, Result};

/// Session options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client identifier sent in CONNECT.
    pub client_id: String,
    /// Optional CONNECT username.
    pub username: Option<String>,
    /// Deadline for each acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            username: Some(MQTT_SDK_USERNAME.to_string()),
            ack_timeout: BUS_ACK_TIMEOUT,
        }
    }
}

/// `mqttjs_` followed by 8 random hex digits.
pub fn generate_client_id() -> String {
    format!("{MQTT_CLIENT_ID_PREFIX}{:08x}", rand::random::<u32>())
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Transport attached, CONNECT not yet written.
    Connecting,
    /// CONNECT written, waiting for CONNACK.
    AwaitingConnectAck,
    /// Session usable.
    Ready,
    /// Torn down; all operations fail.
    Closed,
}

/// Key a waiter is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Correlation {
    /// The single CONNACK of the session.
    ConnAck,
    /// SUBACK / PUBACK / UNSUBACK for a packet id.
    Id(u16),
}

impl std::fmt::Display for Correlation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnAck => write!(f, "#conAck"),
            Self::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Payload as UTF-8 text.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| RelayError::Protocol(format!("non UTF-8 payload on {}: {e}", self.topic)))
    }

    /// Payload parsed as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Stream of messages for one topic filter. Ends when the filter is
/// unsubscribed or the session closes.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// The topic filter this stream was opened for.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

type Waiter = oneshot::Sender<Result<()>>;

/// Correlation and dispatch state shared by callers and the pump.
#[derive(Debug)]
struct Session {
    state: BusState,
    next_id: u16,
    waiters: HashMap<Correlation, Waiter>,
    handlers: HashMap<String, mpsc::UnboundedSender<BusMessage>>,
}

impl Session {
    fn new(first_id: u16) -> Self {
        Self {
            state: BusState::Connecting,
            next_id: first_id,
            waiters: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Next packet id, wrapping 0xFFFF -> 0 and skipping ids still pending.
    fn allocate_id(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX as u32 {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.waiters.contains_key(&Correlation::Id(id)) {
                return Ok(id);
            }
        }
        Err(RelayError::InvalidInput(
            "every packet id has a pending acknowledgement".to_string(),
        ))
    }

    fn register(&mut self, key: Correlation) -> Result<oneshot::Receiver<Result<()>>> {
        if self.state == BusState::Closed {
            return Err(RelayError::ConnectionClosed);
        }
        if self.waiters.contains_key(&key) {
            return Err(RelayError::InvalidInput(format!(
                "a waiter for {key} is already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key, tx);
        Ok(rx)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            BusState::Ready => Ok(()),
            BusState::Closed => Err(RelayError::ConnectionClosed),
            state => Err(RelayError::InvalidInput(format!("bus not ready ({state:?})"))),
        }
    }

    /// Close the session, failing every pending waiter with `reason`.
    fn shut_down(&mut self, reason: &RelayError) {
        self.state = BusState::Closed;
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(reason.clone()));
        }
        self.handlers.clear();
    }
}

struct Inner {
    client_id: String,
    ack_timeout: Duration,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    session: Mutex<Session>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().expect("bus session mutex poisoned")
    }

    async fn write(&self, packet: &Packet) -> Result<()> {
        let bytes = packet.encode()?;
        self.sink.lock().await.send_frame(bytes).await
    }

    /// Handle one inbound packet. An error here is fatal for the session.
    async fn dispatch(&self, frame: &BusFrame) -> Result<()> {
        match Packet::from_frame(frame)? {
            Packet::ConnAck => self.resolve(Correlation::ConnAck),
            Packet::SubAck { packet_id, .. }
            | Packet::PubAck { packet_id }
            | Packet::UnsubAck { packet_id } => self.resolve(Correlation::Id(packet_id)),
            Packet::Publish { topic, packet_id, payload, .. } => {
                if let Some(packet_id) = packet_id {
                    self.write(&Packet::PubAck { packet_id }).await?;
                }
                self.deliver(BusMessage { topic, payload });
            }
            other => {
                return Err(RelayError::Protocol(format!(
                    "unexpected packet from broker: {other:?}"
                )))
            }
        }
        Ok(())
    }

    fn resolve(&self, key: Correlation) {
        let waiter = self.session().waiters.remove(&key);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(()));
            }
            None => log::warn!("[MQTT] Received unsolicited acknowledgement {key}"),
        }
    }

    /// Hand `message` to every matching subscription. A filter whose
    /// stream was dropped stays registered until it is unsubscribed, so the
    /// broker-side subscription is still released by
    /// [`MqttClient::unsubscribe`].
    fn deliver(&self, message: BusMessage) {
        let session = self.session();
        let mut delivered = false;
        for (pattern, tx) in &session.handlers {
            if pattern != &message.topic && !topic::matches(pattern, &message.topic) {
                continue;
            }
            if tx.send(message.clone()).is_ok() {
                delivered = true;
            } else {
                log::debug!("[MQTT] Stream for {pattern} was dropped");
            }
        }
        if !delivered {
            log::warn!(
                "[MQTT] Dropping message on {}: no live subscription",
                message.topic
            );
        }
    }

    fn tear_down(&self, reason: &RelayError) {
        let mut session = self.session();
        if session.state == BusState::Closed {
            return;
        }
        match reason {
            RelayError::ConnectionClosed => log::info!("[MQTT] Broker closed the connection"),
            other => log::error!("[MQTT] Session failed: {other}"),
        }
        session.shut_down(reason);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

async fn run_pump<S: ByteSource>(inner: Weak<Inner>, mut input: InputBuffer<S>) {
    let reason = loop {
        let frame = match input.extract_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break RelayError::ConnectionClosed,
            Err(e) => break e,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(e) = inner.dispatch(&frame).await {
            break e;
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.tear_down(&reason);
        if let Err(e) = inner.sink.lock().await.close().await {
            log::debug!("[MQTT] Transport close after failure: {e}");
        }
    }
}

/// Handle to one bus session. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MqttClient {
    /// Start the pump on `source`, write CONNECT and wait for CONNACK.
    ///
    /// # Errors
    ///
    /// [`RelayError::Protocol`] if the broker refuses the session,
    /// [`RelayError::Timeout`] if no CONNACK arrives in time. The transport
    /// is closed on failure.
    pub async fn connect<W, R>(sink: W, source: R, options: ConnectOptions) -> Result<Self>
    where
        W: FrameSink + 'static,
        R: ByteSource + 'static,
    {
        let inner = Arc::new(Inner {
            client_id: options.client_id.clone(),
            ack_timeout: options.ack_timeout,
            sink: tokio::sync::Mutex::new(Box::new(sink)),
            session: Mutex::new(Session::new(rand::random())),
            pump: Mutex::new(None),
        });
        let handle = tokio::spawn(run_pump(Arc::downgrade(&inner), InputBuffer::new(source)));
        *inner.pump.lock().expect("bus pump mutex poisoned") = Some(handle);

        let client = Self { inner };
        let ack = {
            let mut session = client.inner.session();
            let ack = session.register(Correlation::ConnAck)?;
            session.state = BusState::AwaitingConnectAck;
            ack
        };

        log::debug!("[MQTT] Connecting as {}", options.client_id);
        let connect = Packet::Connect {
            client_id: options.client_id,
            username: options.username,
        };
        if let Err(e) = client.exchange(&connect, Correlation::ConnAck, ack).await {
            client.close().await;
            return Err(e);
        }

        client.inner.session().state = BusState::Ready;
        log::info!("[MQTT] Connected as {}", client.inner.client_id);
        Ok(client)
    }

    /// Current session state.
    pub fn state(&self) -> BusState {
        self.inner.session().state
    }

    /// Client identifier of this session.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Subscribe to a topic filter (`+` and `#` allowed) at QoS 1.
    ///
    /// The returned stream is live before the SUBSCRIBE is written, so no
    /// message published right after the SUBACK is lost.
    ///
    /// # Errors
    ///
    /// [`RelayError::InvalidInput`] if `pattern` is already subscribed and
    /// its stream is still held.
    pub async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (packet_id, ack) = {
            let mut session = self.inner.session();
            session.ensure_ready()?;
            if session.handlers.get(pattern).is_some_and(|existing| !existing.is_closed()) {
                return Err(RelayError::InvalidInput(format!(
                    "topic {pattern} already subscribed"
                )));
            }
            let packet_id = session.allocate_id()?;
            let ack = session.register(Correlation::Id(packet_id))?;
            session.handlers.insert(pattern.to_string(), tx);
            (packet_id, ack)
        };

        log::debug!("[MQTT] Subscribing to {pattern} (#{packet_id})");
        let packet = Packet::Subscribe {
            packet_id,
            topic: pattern.to_string(),
            qos: 1,
        };
        if let Err(e) = self.exchange(&packet, Correlation::Id(packet_id), ack).await {
            self.inner.session().handlers.remove(pattern);
            return Err(e);
        }

        Ok(Subscription {
            pattern: pattern.to_string(),
            rx,
        })
    }

    /// Unsubscribe a topic filter. Unknown filters are a no-op.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let (packet_id, ack) = {
            let mut session = self.inner.session();
            if !session.handlers.contains_key(pattern) {
                return Ok(());
            }
            session.ensure_ready()?;
            let packet_id = session.allocate_id()?;
            (packet_id, session.register(Correlation::Id(packet_id))?)
        };

        log::debug!("[MQTT] Unsubscribing from {pattern} (#{packet_id})");
        let packet = Packet::Unsubscribe {
            packet_id,
            topic: pattern.to_string(),
        };
        self.exchange(&packet, Correlation::Id(packet_id), ack).await?;
        self.inner.session().handlers.remove(pattern);
        Ok(())
    }

    /// Publish at QoS 1 and wait for the PUBACK.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let (packet_id, ack) = {
            let mut session = self.inner.session();
            session.ensure_ready()?;
            let packet_id = session.allocate_id()?;
            (packet_id, session.register(Correlation::Id(packet_id))?)
        };

        let packet = Packet::Publish {
            topic: topic.to_string(),
            qos: 1,
            packet_id: Some(packet_id),
            payload: payload.into(),
        };
        self.exchange(&packet, Correlation::Id(packet_id), ack).await
    }

    /// Tear the session down: fail all waiters, end all subscriptions and
    /// close the transport. Idempotent.
    pub async fn close(&self) {
        self.inner.session().shut_down(&RelayError::ConnectionClosed);
        let pump = self.inner.pump.lock().expect("bus pump mutex poisoned").take();
        if let Some(handle) = pump {
            handle.abort();
        }
        if let Err(e) = self.inner.sink.lock().await.close().await {
            log::debug!("[MQTT] Transport close failed: {e}");
        }
    }

    /// Write `packet` and wait for the acknowledgement under `key`.
    async fn exchange(
        &self,
        packet: &Packet,
        key: Correlation,
        ack: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        if let Err(e) = self.inner.write(packet).await {
            self.inner.session().waiters.remove(&key);
            if e.is_fatal() {
                self.inner.tear_down(&e);
            }
            return Err(e);
        }

        let result = with_deadline(self.inner.ack_timeout, &key.to_string(), async {
            ack.await.unwrap_or(Err(RelayError::ConnectionClosed))
        })
        .await;
        if matches!(result, Err(RelayError::Timeout(_))) {
            self.inner.session().waiters.remove(&key);
        }
        result
    }
}
