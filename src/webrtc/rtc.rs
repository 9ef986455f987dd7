//! `rustrtc` implementation of the peer-connection capability.
//!
//! rustrtc has no negotiation-needed callback; the first data channel
//! created before a local description exists raises
//! [`PeerEvent::NegotiationNeeded`] instead. Candidate and state
//! subscriptions are forwarded into the [`PeerEvents`] stream by a task
//! owned by the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustrtc::transports::ice::IceCandidate;
use rustrtc::transports::sctp::DataChannel as RtcChannel;
use rustrtc::{DataChannelEvent, RtcConfiguration, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::peer::{
    DataChannel, IceServer, PeerConnection, PeerConnector, PeerEvent, PeerEvents, PeerState,
};
use crate::error::{RelayError, Result};

/// Creates rustrtc peer connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcConnector;

impl PeerConnector for RtcConnector {
    fn create(&self, ice_servers: Vec<IceServer>) -> Result<(Arc<dyn PeerConnection>, PeerEvents)> {
        let config = RtcConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| rustrtc::IceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    credential_type: rustrtc::IceCredentialType::Password,
                })
                .collect(),
            ..Default::default()
        };
        let pc = rustrtc::PeerConnection::new(config);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let forwarder = spawn_forwarder(&pc, events_tx.clone());

        let connection = RtcPeerConnection {
            pc,
            ice_servers,
            events: events_tx,
            negotiation_requested: AtomicBool::new(false),
            forwarder,
        };
        Ok((Arc::new(connection), events_rx))
    }
}

fn map_state(state: rustrtc::PeerConnectionState) -> PeerState {
    match state {
        rustrtc::PeerConnectionState::Connected => PeerState::Connected,
        rustrtc::PeerConnectionState::Disconnected => PeerState::Disconnected,
        rustrtc::PeerConnectionState::Failed => PeerState::Failed,
        rustrtc::PeerConnectionState::Closed => PeerState::Closed,
        rustrtc::PeerConnectionState::New => PeerState::New,
        _ => PeerState::Connecting,
    }
}

fn spawn_forwarder(
    pc: &rustrtc::PeerConnection,
    events: mpsc::UnboundedSender<PeerEvent>,
) -> JoinHandle<()> {
    let mut ice_rx = pc.subscribe_ice_candidates();
    let mut state_rx = pc.subscribe_peer_state();

    tokio::spawn(async move {
        let mut gathering = true;
        loop {
            tokio::select! {
                candidate = ice_rx.recv(), if gathering => {
                    let event = match candidate {
                        Ok(candidate) => {
                            PeerEvent::LocalCandidate(Some(format!("candidate:{}", candidate.to_sdp())))
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("[WebRTC] Dropped {n} local candidates");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            gathering = false;
                            PeerEvent::LocalCandidate(None)
                        }
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = map_state(*state_rx.borrow());
                    log::info!("[WebRTC] Connection state changed: {state:?}");
                    if events.send(PeerEvent::StateChanged(state)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

struct RtcPeerConnection {
    pc: rustrtc::PeerConnection,
    ice_servers: Vec<IceServer>,
    events: mpsc::UnboundedSender<PeerEvent>,
    negotiation_requested: AtomicBool,
    forwarder: JoinHandle<()>,
}

impl Drop for RtcPeerConnection {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer()
            .await
            .map_err(|e| RelayError::Negotiation(format!("Failed to create offer: {e}")))?;
        Ok(offer.to_sdp_string())
    }

    async fn set_local_description(&self, sdp: &str) -> Result<()> {
        let offer = SessionDescription::parse(SdpType::Offer, sdp)
            .map_err(|e| RelayError::Negotiation(format!("Invalid local SDP: {e}")))?;
        self.pc
            .set_local_description(offer)
            .map_err(|e| RelayError::Negotiation(format!("Failed to set local description: {e}")))
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        let answer = SessionDescription::parse(SdpType::Answer, sdp)
            .map_err(|e| RelayError::Negotiation(format!("Invalid SDP answer: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| RelayError::Negotiation(format!("Failed to set remote description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        let sdp = candidate.trim_start_matches("candidate:");
        let candidate = IceCandidate::from_sdp(sdp)
            .map_err(|e| RelayError::Negotiation(format!("Failed to parse ICE candidate: {e}")))?;
        self.pc
            .add_ice_candidate(candidate)
            .map_err(|e| RelayError::Negotiation(format!("Failed to add ICE candidate: {e}")))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Box<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .map_err(|e| RelayError::Negotiation(format!("Failed to create data channel: {e}")))?;

        if !self.negotiation_requested.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(PeerEvent::NegotiationNeeded);
        }

        Ok(Box::new(RtcDataChannel {
            pc: self.pc.clone(),
            dc,
            label: label.to_string(),
            pending: VecDeque::new(),
            open: false,
            closed: false,
        }))
    }

    fn connection_state(&self) -> PeerState {
        map_state(*self.pc.subscribe_peer_state().borrow())
    }

    fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.clone()
    }

    fn close(&self) {
        self.forwarder.abort();
        self.pc.close();
    }
}

struct RtcDataChannel {
    pc: rustrtc::PeerConnection,
    dc: Arc<RtcChannel>,
    label: String,
    pending: VecDeque<Vec<u8>>,
    open: bool,
    closed: bool,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn wait_open(&mut self) -> Result<()> {
        while !self.open {
            match self.dc.recv().await {
                Some(DataChannelEvent::Open) => {
                    log::debug!("[WebRTC] Data channel {} open", self.label);
                    self.open = true;
                }
                Some(DataChannelEvent::Message(data)) => {
                    self.open = true;
                    self.pending.push_back(data.to_vec());
                }
                Some(DataChannelEvent::Close) | None => {
                    self.closed = true;
                    return Err(RelayError::ConnectionClosed);
                }
            }
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RelayError::ConnectionClosed);
        }
        self.pc
            .send_data(self.dc.id, data)
            .await
            .map_err(|e| RelayError::Transport(format!("Data channel send failed: {e}")))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(data) = self.pending.pop_front() {
            return Ok(Some(data));
        }
        if self.closed {
            return Ok(None);
        }
        loop {
            match self.dc.recv().await {
                Some(DataChannelEvent::Message(data)) => return Ok(Some(data.to_vec())),
                Some(DataChannelEvent::Open) => self.open = true,
                Some(DataChannelEvent::Close) | None => {
                    self.closed = true;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        // rustrtc tears SCTP streams down with the association; locally the
        // channel stops carrying traffic.
        self.closed = true;
        self.pending.clear();
    }
}
