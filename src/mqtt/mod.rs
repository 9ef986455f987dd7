//! MQTT 3.1.1 client used as the signaling bus.
//!
//! - [`codec`]: packet encode/decode
//! - [`buffer`]: suspending reads over a chunked byte source
//! - [`client`]: session, correlation and topic dispatch
//! - [`topic`]: filter matching
//! - [`transport`]: the byte transport seam

pub mod buffer;
pub mod client;
pub mod codec;
pub mod topic;
pub mod transport;

pub use client::{BusMessage, BusState, ConnectOptions, Correlation, MqttClient, Subscription};
pub use codec::{BusFrame, Packet};
pub use transport::{memory_transport, ByteSource, FrameSink, MemoryPeer};
