//! One console reached through the relay.
//!
//! This module handles:
//! - Building the signed broker URL from session credentials
//! - Bringing up the bus and negotiating the peer connection
//! - Opening API channels on the shared peer connection
//! - The voucher calls of the network application
//!
//! A [`CloudDevice`] connects lazily: the first API call connects, later
//! calls reuse the connection while both the bus and the peer connection are
//! up. A session whose broker went away, or whose peer connection failed or
//! closed, is torn down and renegotiated on the next call.
//! [`CloudDevice::close`] tears everything down; a later call connects again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channel::{ApiChannel, ChannelRegistry, ChannelTimeouts};
use crate::cloud::{CloudAccess, SessionCredentials};
use crate::constants::{
    BUS_ACK_TIMEOUT, DEFAULT_API_BASE, DEFAULT_SITE, DEFAULT_VOUCHER_EXPIRE_MINUTES, IOT_SERVICE,
    MQTT_PATH, MQTT_SUBPROTOCOL, WS_CONNECT_TIMEOUT,
};
use crate::error::{RelayError, Result};
use crate::mqtt::{BusState, ByteSource, ConnectOptions, FrameSink, MqttClient};
use crate::sigv4::{self, AuthMode, CanonicalRequest};
use crate::webrtc::{
    DataChannel, NegotiatedPeer, NegotiationConfig, Negotiator, PeerConnection, PeerConnector,
    PeerEvent, PeerEvents, PeerState, RtcConnector, Signaling,
};
use crate::ws;

/// Per-device settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    /// Base path of the network application (`/proxy/network`).
    pub api_base: String,
    /// Site name used by the voucher calls.
    pub site: String,
    /// Negotiation deadline and candidate pacing.
    pub negotiation: NegotiationConfig,
    /// Channel open and response deadlines.
    pub channels: ChannelTimeouts,
    /// Deadline for each bus acknowledgement.
    pub bus_ack_timeout: Duration,
    /// Deadline for the broker WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            site: DEFAULT_SITE.to_string(),
            negotiation: NegotiationConfig::default(),
            channels: ChannelTimeouts::default(),
            bus_ack_timeout: BUS_ACK_TIMEOUT,
            connect_timeout: WS_CONNECT_TIMEOUT,
        }
    }
}

/// Parameters of a new hotspot voucher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherSpec {
    /// Number of vouchers.
    pub count: u32,
    /// Uses per voucher; 0 is unlimited.
    pub quota: u32,
    /// Lifetime in minutes.
    pub expire_minutes: u32,
    /// Free-form note.
    pub note: Option<String>,
}

impl Default for VoucherSpec {
    fn default() -> Self {
        Self {
            count: 1,
            quota: 0,
            expire_minutes: DEFAULT_VOUCHER_EXPIRE_MINUTES,
            note: None,
        }
    }
}

#[derive(Serialize)]
struct CreateVoucher<'a> {
    cmd: &'static str,
    n: u32,
    quota: u32,
    expire: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<&'a str>,
}

/// Live bus session and peer connection.
struct Connection {
    bus: MqttClient,
    peer: Arc<dyn PeerConnection>,
    placeholder: Box<dyn DataChannel>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.bus.state() != BusState::Closed
            && !matches!(
                self.peer.connection_state(),
                PeerState::Failed | PeerState::Closed
            )
    }

    async fn shut_down(mut self) {
        self.placeholder.close().await;
        self.peer.close();
        self.bus.close().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// A console reached through the cloud relay.
pub struct CloudDevice {
    id: String,
    broker_host: String,
    credentials: SessionCredentials,
    settings: DeviceSettings,
    connector: Arc<dyn PeerConnector>,
    connection: Mutex<Option<Connection>>,
    registry: ChannelRegistry,
}

impl std::fmt::Debug for CloudDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudDevice")
            .field("id", &self.id)
            .field("broker_host", &self.broker_host)
            .field("open_channels", &self.registry.open_labels())
            .finish_non_exhaustive()
    }
}

impl CloudDevice {
    /// A device behind `broker_host`, reached with `credentials`.
    pub fn new(
        id: impl Into<String>,
        broker_host: impl Into<String>,
        credentials: SessionCredentials,
        settings: DeviceSettings,
    ) -> Self {
        Self {
            id: id.into(),
            broker_host: broker_host.into(),
            credentials,
            settings,
            connector: Arc::new(RtcConnector),
            connection: Mutex::new(None),
            registry: ChannelRegistry::new(),
        }
    }

    /// Look up the broker host and session credentials through `cloud`.
    pub async fn from_cloud(
        cloud: &CloudAccess,
        id: &str,
        settings: DeviceSettings,
    ) -> anyhow::Result<Self> {
        let config = cloud.access_config().await?;
        let credentials = cloud.credentials().await?;
        Ok(Self::new(id, config.unifi_cloud_access.iot.host, credentials, settings))
    }

    /// Use `connector` for peer connections instead of rustrtc.
    pub fn with_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Device id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// API channels currently open.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Whether the bus and peer connection are up.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.as_ref().is_some_and(Connection::is_alive)
    }

    /// Pre-signed WebSocket URL of the broker.
    pub fn broker_url(&self) -> Result<String> {
        let request = CanonicalRequest::new(
            AuthMode::Query,
            self.broker_host.as_str(),
            self.credentials.access_key_id.as_str(),
            self.credentials.region.as_str(),
            IOT_SERVICE,
        )
        .with_scheme("wss")
        .with_path(MQTT_PATH)
        .with_session_token(Some(self.credentials.session_token.clone()));
        sigv4::signed_url(&request, &self.credentials.secret_key)
    }

    /// Connect the bus over a WebSocket to the broker and negotiate the peer
    /// connection. A no-op when already connected; a dead session is
    /// replaced.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if self.keep_live(&mut connection).await {
            return Ok(());
        }

        let url = self.broker_url()?;
        log::info!("[Device] Connecting to {} via {}", self.id, self.broker_host);
        let (writer, reader) =
            ws::connect_with_protocol(&url, MQTT_SUBPROTOCOL, self.settings.connect_timeout)
                .await
                .map_err(|e| RelayError::Transport(format!("{e:#}")))?;

        *connection = Some(self.establish(writer, reader).await?);
        Ok(())
    }

    /// Like [`connect`](Self::connect), over a caller-supplied bus transport.
    pub async fn connect_over<W, R>(&self, sink: W, source: R) -> Result<()>
    where
        W: FrameSink + 'static,
        R: ByteSource + 'static,
    {
        let mut connection = self.connection.lock().await;
        if self.keep_live(&mut connection).await {
            return Ok(());
        }
        *connection = Some(self.establish(sink, source).await?);
        Ok(())
    }

    /// Whether `connection` holds a live session. A dead one is torn down
    /// and cleared.
    async fn keep_live(&self, connection: &mut Option<Connection>) -> bool {
        match connection.take() {
            Some(live) if live.is_alive() => {
                *connection = Some(live);
                true
            }
            Some(dead) => {
                log::warn!(
                    "[Device] Session to {} is down (bus {:?}, peer {:?}), reconnecting",
                    self.id,
                    dead.bus.state(),
                    dead.peer.connection_state()
                );
                dead.shut_down().await;
                false
            }
            None => false,
        }
    }

    async fn establish<W, R>(&self, sink: W, source: R) -> Result<Connection>
    where
        W: FrameSink + 'static,
        R: ByteSource + 'static,
    {
        let options = ConnectOptions {
            ack_timeout: self.settings.bus_ack_timeout,
            ..ConnectOptions::default()
        };
        let bus = MqttClient::connect(sink, source, options).await?;
        let signaling = Signaling::new(bus.clone(), &self.credentials.identity_id, &self.id);

        let watcher = match signaling.watch_channel().await {
            Ok(watcher) => watcher,
            Err(e) => {
                bus.close().await;
                return Err(e);
            }
        };

        let negotiator = Negotiator::new(self.settings.negotiation);
        let negotiated = negotiator
            .negotiate(&signaling, self.connector.as_ref(), self.credentials.ice_servers())
            .await;
        let NegotiatedPeer {
            peer,
            events,
            placeholder,
        } = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                watcher.abort();
                bus.close().await;
                return Err(e);
            }
        };

        let monitor = tokio::spawn(watch_peer(self.id.clone(), events));
        log::info!("[Device] Connected to {}", self.id);
        Ok(Connection {
            bus,
            peer,
            placeholder,
            tasks: vec![watcher, monitor],
        })
    }

    /// Open a new API channel, connecting first if needed.
    pub async fn open_api_channel(&self) -> Result<ApiChannel> {
        self.connect().await?;
        let peer = {
            let connection = self.connection.lock().await;
            connection
                .as_ref()
                .map(|c| Arc::clone(&c.peer))
                .ok_or(RelayError::ConnectionClosed)?
        };
        let label = self.registry.next_label();
        ApiChannel::open(peer.as_ref(), &label, &self.registry, self.settings.channels).await
    }

    /// Run `f` on a fresh API channel and close the channel afterwards,
    /// whatever `f` returned.
    pub async fn with_channel<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut ApiChannel) -> BoxFuture<'c, Result<T>>,
    {
        let mut channel = self.open_api_channel().await?;
        let result = f(&mut channel).await;
        channel.close().await;
        result
    }

    /// `GET path` on a channel of its own.
    pub async fn get(&self, path: &str) -> Result<Value> {
        let path = path.to_string();
        self.with_channel(move |channel| Box::pin(async move { channel.get(&path).await }))
            .await
    }

    /// `POST path` with `body` on a channel of its own.
    pub async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<Value> {
        let path = path.to_string();
        let body = serde_json::to_value(body)?;
        self.with_channel(move |channel| Box::pin(async move { channel.post(&path, &body).await }))
            .await
    }

    /// Every voucher of the site.
    pub async fn vouchers(&self) -> Result<Value> {
        let response = self.get(&self.site_path("stat/voucher")).await?;
        response_data(response)
    }

    /// Vouchers created at `create_time` (seconds since the epoch).
    pub async fn voucher_by_create_time(&self, create_time: i64) -> Result<Value> {
        let body = serde_json::json!({ "create_time": create_time });
        let response = self.post(&self.site_path("stat/voucher"), &body).await?;
        response_data(response)
    }

    /// Create vouchers and return them as stored.
    pub async fn create_voucher(&self, spec: &VoucherSpec) -> Result<Value> {
        let command = CreateVoucher {
            cmd: "create-voucher",
            n: spec.count,
            quota: spec.quota,
            expire: spec.expire_minutes,
            note: spec.note.as_deref(),
        };
        let response = self.post(&self.site_path("cmd/hotspot"), &command).await?;
        let create_time = response["data"][0]["create_time"].as_i64().ok_or_else(|| {
            RelayError::Protocol("voucher creation returned no create_time".to_string())
        })?;
        log::info!("[Device] Created {} voucher(s) at {create_time}", spec.count);
        self.voucher_by_create_time(create_time).await
    }

    /// Revoke the voucher with id `id`.
    pub async fn revoke_voucher(&self, id: &str) -> Result<Value> {
        let body = serde_json::json!({ "_id": id, "cmd": "delete-voucher" });
        let response = self.post(&self.site_path("cmd/hotspot"), &body).await?;
        response_data(response)
    }

    fn site_path(&self, endpoint: &str) -> String {
        format!("{}/api/s/{}/{endpoint}", self.settings.api_base, self.settings.site)
    }

    /// Close the peer connection (and every channel on it) and the bus.
    /// Idempotent.
    pub async fn close(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };

        let open = self.registry.open_labels();
        if !open.is_empty() {
            log::debug!("[Device] Closing with channels open: {}", open.join(", "));
        }
        connection.shut_down().await;
        log::info!("[Device] Disconnected from {}", self.id);
    }
}

/// The `data` member of a network application response.
fn response_data(mut response: Value) -> Result<Value> {
    response
        .get_mut("data")
        .map(Value::take)
        .ok_or_else(|| RelayError::Protocol("response has no data member".to_string()))
}

async fn watch_peer(device: String, mut events: PeerEvents) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::StateChanged(
                state @ (PeerState::Disconnected | PeerState::Failed | PeerState::Closed),
            ) => {
                log::warn!("[Device] {device} peer connection {state:?}");
            }
            PeerEvent::StateChanged(state) => {
                log::debug!("[Device] {device} peer connection {state:?}");
            }
            PeerEvent::LocalCandidate(_) | PeerEvent::NegotiationNeeded => {}
        }
    }
}
