//! Offer/answer negotiation driven over [`Signaling`].
//!
//! # State machine
//!
//! ```text
//! Idle --negotiation needed--> OfferSent --answer--> HasAnswer --connected--> Connected
//!   any --failed/closed--> Failed
//! ```
//!
//! # Candidate pacing
//!
//! Every candidate, local or remote, waits until a remote answer exists,
//! re-checking every [`Pacing::poll_interval`]. Candidates of type `relay`
//! then wait a further [`Pacing::relay_delay`]; the console does not pair
//! them otherwise. Paced candidates run as independent tasks so a delayed
//! one never holds up the answer that releases it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use super::peer::{DataChannel, IceServer, PeerConnection, PeerConnector, PeerEvent, PeerEvents, PeerState};
use super::signaling::{normalize_candidate, InboundSignal, Signaling};
use crate::constants::{
    CANDIDATE_POLL_INTERVAL, NEGOTIATION_TIMEOUT, PLACEHOLDER_CHANNEL_LABEL, RELAY_CANDIDATE_DELAY,
};
use crate::error::{with_deadline, RelayError, Result};
use crate::mqtt::Subscription;

/// Where a negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing sent yet.
    Idle,
    /// Offer published, waiting for the answer.
    OfferSent,
    /// Answer installed, waiting for connectivity.
    HasAnswer,
    /// Transport up.
    Connected,
    /// The peer connection failed or closed.
    Failed,
}

/// Fixed candidate delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Re-check interval while no answer exists.
    pub poll_interval: Duration,
    /// Extra delay for `typ relay` candidates.
    pub relay_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            poll_interval: CANDIDATE_POLL_INTERVAL,
            relay_delay: RELAY_CANDIDATE_DELAY,
        }
    }
}

/// Negotiation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationConfig {
    /// Candidate delays.
    pub pacing: Pacing,
    /// Deadline for the whole negotiation.
    pub timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::default(),
            timeout: NEGOTIATION_TIMEOUT,
        }
    }
}

/// Hold `candidate` back until a remote answer exists, plus the relay delay
/// for relay candidates.
///
/// Returns `false` if the negotiation went away while waiting; the
/// candidate should then be dropped.
pub async fn pace_candidate(candidate: &str, answered: &watch::Receiver<bool>, pacing: &Pacing) -> bool {
    loop {
        if *answered.borrow() {
            break;
        }
        if answered.has_changed().is_err() {
            return false;
        }
        log::debug!("[Negotiator] Delaying candidate, no remote answer received yet: {candidate}");
        tokio::time::sleep(pacing.poll_interval).await;
    }

    if candidate.contains("typ relay") {
        log::debug!("[Negotiator] Delaying relay candidate: {candidate}");
        tokio::time::sleep(pacing.relay_delay).await;
    }
    true
}

/// A connected peer, ready for API channels.
pub struct NegotiatedPeer {
    /// The connection.
    pub peer: Arc<dyn PeerConnection>,
    /// Its remaining event stream.
    pub events: PeerEvents,
    /// The channel that triggered negotiation; keep it open.
    pub placeholder: Box<dyn DataChannel>,
}

impl std::fmt::Debug for NegotiatedPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedPeer")
            .field("state", &self.peer.connection_state())
            .field("placeholder", &self.placeholder.label())
            .finish_non_exhaustive()
    }
}

/// Drives one negotiation.
#[derive(Debug)]
pub struct Negotiator {
    config: NegotiationConfig,
    state: watch::Sender<NegotiationState>,
}

impl Negotiator {
    /// Create an idle negotiator.
    pub fn new(config: NegotiationConfig) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self { config, state }
    }

    /// Current state.
    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    /// Create a peer connection with `ice_servers` and negotiate it with the
    /// device behind `signaling`.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Negotiation`] if the connection fails or closes
    /// - [`RelayError::Timeout`] if it is not connected in time
    /// - bus errors from subscribing or publishing
    ///
    /// The peer connection is closed on failure.
    pub async fn negotiate(
        &self,
        signaling: &Signaling,
        connector: &dyn PeerConnector,
        ice_servers: Vec<IceServer>,
    ) -> Result<NegotiatedPeer> {
        let mut session = signaling.open_session().await?;
        let (peer, mut events) = match connector.create(ice_servers) {
            Ok(created) => created,
            Err(e) => {
                let _ = signaling.close_session().await;
                return Err(e);
            }
        };

        let result = async {
            let placeholder = peer.create_data_channel(PLACEHOLDER_CHANNEL_LABEL).await?;
            with_deadline(
                self.config.timeout,
                "peer connection",
                self.run(signaling, &peer, &mut events, &mut session),
            )
            .await?;
            Ok::<_, RelayError>(placeholder)
        }
        .await;

        match result {
            Ok(placeholder) => {
                if let Err(e) = signaling.close_session().await {
                    log::warn!("[Negotiator] Failed to unsubscribe session topic: {e}");
                }
                log::info!("[Negotiator] Peer connection established");
                Ok(NegotiatedPeer {
                    peer,
                    events,
                    placeholder,
                })
            }
            Err(e) => {
                log::warn!("[Negotiator] Negotiation failed: {e}");
                self.state.send_replace(NegotiationState::Failed);
                peer.close();
                let _ = signaling.close_session().await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        signaling: &Signaling,
        peer: &Arc<dyn PeerConnection>,
        events: &mut PeerEvents,
        session: &mut Subscription,
    ) -> Result<()> {
        let (answered_tx, answered_rx) = watch::channel(false);
        let mut paced: JoinSet<Result<()>> = JoinSet::new();
        let pacing = self.config.pacing;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(RelayError::Negotiation("peer connection went away".to_string()));
                    };
                    match event {
                        PeerEvent::NegotiationNeeded => {
                            if self.state() != NegotiationState::Idle {
                                continue;
                            }
                            let offer = peer.create_offer().await?;
                            peer.set_local_description(&offer).await?;
                            signaling.publish_offer(&offer, &peer.ice_servers()).await?;
                            self.state.send_replace(NegotiationState::OfferSent);
                        }
                        PeerEvent::LocalCandidate(Some(candidate)) => {
                            let signaling = signaling.clone();
                            let answered = answered_rx.clone();
                            paced.spawn(async move {
                                if pace_candidate(&candidate, &answered, &pacing).await {
                                    signaling.publish_candidate(&candidate).await?;
                                }
                                Ok(())
                            });
                        }
                        PeerEvent::LocalCandidate(None) => {
                            log::debug!("[Negotiator] Local candidate gathering complete");
                        }
                        PeerEvent::StateChanged(PeerState::Connected) => {
                            self.state.send_replace(NegotiationState::Connected);
                            break;
                        }
                        PeerEvent::StateChanged(state @ (PeerState::Failed | PeerState::Closed)) => {
                            self.state.send_replace(NegotiationState::Failed);
                            return Err(RelayError::Negotiation(format!(
                                "Failed to connect to server ({state:?})"
                            )));
                        }
                        PeerEvent::StateChanged(state) => {
                            log::debug!("[Negotiator] Peer state {state:?}");
                        }
                    }
                }
                message = session.recv() => {
                    let Some(message) = message else {
                        return Err(RelayError::ConnectionClosed);
                    };
                    let signal = match InboundSignal::parse(&message.payload) {
                        Ok(signal) => signal,
                        Err(e) => {
                            log::warn!("[Negotiator] Ignoring malformed signal on {}: {e}", message.topic);
                            continue;
                        }
                    };
                    match signal {
                        InboundSignal::Answer { answer } => {
                            if *answered_tx.borrow() {
                                log::warn!("[Negotiator] Ignoring duplicate answer");
                                continue;
                            }
                            peer.set_remote_description(&answer).await?;
                            answered_tx.send_replace(true);
                            if self.state() != NegotiationState::Connected {
                                self.state.send_replace(NegotiationState::HasAnswer);
                            }
                            log::debug!("[Negotiator] Remote answer installed");
                        }
                        InboundSignal::IceCandidate { candidate: Some(candidate) } => {
                            let candidate = normalize_candidate(&candidate).to_string();
                            let peer = Arc::clone(peer);
                            let answered = answered_rx.clone();
                            paced.spawn(async move {
                                if pace_candidate(&candidate, &answered, &pacing).await {
                                    if let Err(e) = peer.add_ice_candidate(&candidate).await {
                                        log::warn!("[Negotiator] Remote candidate rejected: {e}");
                                    }
                                }
                                Ok(())
                            });
                        }
                        InboundSignal::IceCandidate { candidate: None } | InboundSignal::SdpComplete => {
                            log::debug!("[Negotiator] Remote candidates complete");
                        }
                        InboundSignal::Unknown => {
                            log::debug!("[Negotiator] Ignoring unknown event on {}", message.topic);
                        }
                    }
                }
                Some(joined) = paced.join_next(), if !paced.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) if e.is_fatal() => return Err(e),
                        Ok(Err(e)) => log::warn!("[Negotiator] Candidate not delivered: {e}"),
                        Err(e) => log::warn!("[Negotiator] Candidate task failed: {e}"),
                    }
                }
            }
        }

        // Candidates still in flight finish on their own; the answer they
        // wait for is already in place.
        paced.detach_all();
        Ok(())
    }
}
