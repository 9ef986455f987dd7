//! Protocol constants and default timings for unifi-relay.
//!
//! This module centralizes the magic numbers of the relay stack so the
//! signing, bus, negotiation and tunnel layers agree on them. Constants are
//! grouped by domain.
//!
//! # Categories
//!
//! - **Timeouts**: deadlines on every awaited reply
//! - **Pacing**: candidate delays during negotiation
//! - **Bus**: MQTT session identity and sub-protocol
//! - **Cloud**: endpoints used to obtain session credentials

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Deadline for a bus acknowledgement (CONNACK, SUBACK, PUBACK, UNSUBACK).
pub const BUS_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the whole offer/answer/candidate exchange.
///
/// Relay candidates alone are held back for a second, and TURN allocation on
/// the appliance side regularly takes several more.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a single tunneled API response (both frames).
pub const RPC_RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for a data channel to report itself open.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client request timeout for cloud API calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket connect timeout for the broker endpoint.
pub const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Candidate pacing
// ============================================================================

/// Poll interval while a candidate waits for the remote answer.
pub const CANDIDATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Extra hold applied to every `typ relay` candidate.
pub const RELAY_CANDIDATE_DELAY: Duration = Duration::from_millis(1000);

// ============================================================================
// Bus
// ============================================================================

/// WebSocket sub-protocol announced to the broker.
pub const MQTT_SUBPROTOCOL: &str = "mqttv3.1";

/// Prefix of generated MQTT client ids.
pub const MQTT_CLIENT_ID_PREFIX: &str = "mqttjs_";

/// Username sent in CONNECT; the broker uses it for SDK metrics only.
pub const MQTT_SDK_USERNAME: &str = "?SDK=NodeJSv2&Version=1.15.5";

/// Path of the broker's WebSocket endpoint.
pub const MQTT_PATH: &str = "/mqtt";

/// Signing service for the broker URL.
pub const IOT_SERVICE: &str = "iotdevicegateway";

/// Signing service for API gateway calls.
pub const API_GATEWAY_SERVICE: &str = "execute-api";

// ============================================================================
// Tunnel
// ============================================================================

/// Label of the data channel created only to trigger negotiation.
pub const PLACEHOLDER_CHANNEL_LABEL: &str = "placeholder";

/// Label prefix of tunneled API channels (`api:1`, `api:2`, ...).
pub const API_CHANNEL_PREFIX: &str = "api";

/// Content type advertised on every tunneled request.
pub const RPC_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Base path of the network application on the appliance.
pub const DEFAULT_API_BASE: &str = "/proxy/network";

/// Default site name.
pub const DEFAULT_SITE: &str = "default";

// ============================================================================
// Cloud
// ============================================================================

/// Cloud access configuration document.
pub const CLOUD_ACCESS_CONFIG_URL: &str = "https://config.ubnt.com/cloudAccessConfig.json";

/// Single sign-on API base.
pub const SSO_BASE_URL: &str = "https://sso.ui.com";

/// Voucher lifetime in minutes when none is given (one day).
pub const DEFAULT_VOUCHER_EXPIRE_MINUTES: u32 = 1440;
