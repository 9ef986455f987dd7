//! Peer connection to the console.
//!
//! - [`peer`]: the capability traits the rest of the crate codes against
//! - [`rtc`]: the rustrtc implementation
//! - [`signaling`]: offer/candidate messages on the bus
//! - [`negotiator`]: the offer/answer state machine with candidate pacing

pub mod negotiator;
pub mod peer;
pub mod rtc;
pub mod signaling;

pub use negotiator::{
    pace_candidate, NegotiatedPeer, NegotiationConfig, NegotiationState, Negotiator, Pacing,
};
pub use peer::{
    DataChannel, IceServer, PeerConnection, PeerConnector, PeerEvent, PeerEvents, PeerState,
};
pub use rtc::RtcConnector;
pub use signaling::{InboundSignal, OutboundSignal, Signaling, SignalingTopics};
