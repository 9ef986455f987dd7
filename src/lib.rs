//! unifi-relay - command channel to UniFi consoles through the vendor cloud.
//!
//! A console behind NAT is reached by negotiating a WebRTC peer connection
//! over a signed MQTT broker session, then tunneling HTTP-like requests over
//! data channels of that connection.
//!
//! # Architecture
//!
//! ```text
//! CloudAccess ──credentials──► CloudDevice
//!                                  │
//!                                  ├── sigv4 ──► signed wss URL ──► ws ──► MqttClient
//!                                  │                                          │
//!                                  ├── Negotiator ◄──── Signaling ◄───────────┘
//!                                  │       │
//!                                  │       └──► PeerConnection (rustrtc)
//!                                  │
//!                                  └── ApiChannel ──frames──► DataChannel
//! ```
//!
//! # Modules
//!
//! - [`sigv4`] - request signing for the broker URL and gateway calls
//! - [`mqtt`] - MQTT 3.1.1 client used as the signaling bus
//! - [`webrtc`] - peer capability, signaling and negotiation
//! - [`channel`] - framed request/response tunnel
//! - [`device`] - one console: connect, API calls, vouchers
//! - [`cloud`] - sign-in, session credentials, console list
//! - [`config`] - configuration loading

pub mod channel;
pub mod cloud;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod mqtt;
pub mod sigv4;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod webrtc;
pub mod ws;

// Re-export commonly used types
pub use channel::{ApiChannel, ApiRequest};
pub use cloud::{CloudAccess, CloudSettings, LoginOutcome, MfaFactor, SessionCredentials};
pub use config::RelayConfig;
pub use device::{CloudDevice, DeviceSettings, VoucherSpec};
pub use error::{RelayError, Result};
pub use mqtt::MqttClient;
