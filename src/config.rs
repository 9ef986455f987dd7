//! Configuration loading.
//!
//! Reads `config.json` from the unifi-relay config directory and applies
//! `UNIFI_RELAY_*` environment overrides on top. A missing file is not an
//! error; defaults apply. Session credentials are never stored here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::channel::ChannelTimeouts;
use crate::cloud::CloudSettings;
use crate::constants::{
    BUS_ACK_TIMEOUT, CANDIDATE_POLL_INTERVAL, CHANNEL_OPEN_TIMEOUT, CLOUD_ACCESS_CONFIG_URL,
    DEFAULT_API_BASE, DEFAULT_SITE, HTTP_REQUEST_TIMEOUT, NEGOTIATION_TIMEOUT,
    RELAY_CANDIDATE_DELAY, RPC_RESPONSE_TIMEOUT, SSO_BASE_URL, WS_CONNECT_TIMEOUT,
};
use crate::device::DeviceSettings;
use crate::webrtc::{NegotiationConfig, Pacing};

const CONFIG_FILE: &str = "config.json";

/// Configuration for unifi-relay. Durations are in milliseconds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Cloud access configuration document.
    pub access_config_url: String,
    /// SSO API base.
    pub sso_base_url: String,
    /// Site used by the voucher calls.
    pub site: String,
    /// Base path of the network application on the console.
    pub api_base: String,
    /// Cloud HTTP request timeout.
    pub request_timeout_ms: u64,
    /// Broker WebSocket handshake timeout.
    pub connect_timeout_ms: u64,
    /// Bus acknowledgement timeout.
    pub bus_ack_timeout_ms: u64,
    /// Whole-negotiation timeout.
    pub negotiation_timeout_ms: u64,
    /// Data channel open timeout.
    pub channel_open_timeout_ms: u64,
    /// Tunneled response timeout.
    pub response_timeout_ms: u64,
    /// Re-check interval for candidates waiting on the answer.
    pub candidate_poll_interval_ms: u64,
    /// Extra hold for relay candidates.
    pub relay_candidate_delay_ms: u64,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            access_config_url: CLOUD_ACCESS_CONFIG_URL.to_string(),
            sso_base_url: SSO_BASE_URL.to_string(),
            site: DEFAULT_SITE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_ms: millis(HTTP_REQUEST_TIMEOUT),
            connect_timeout_ms: millis(WS_CONNECT_TIMEOUT),
            bus_ack_timeout_ms: millis(BUS_ACK_TIMEOUT),
            negotiation_timeout_ms: millis(NEGOTIATION_TIMEOUT),
            channel_open_timeout_ms: millis(CHANNEL_OPEN_TIMEOUT),
            response_timeout_ms: millis(RPC_RESPONSE_TIMEOUT),
            candidate_poll_interval_ms: millis(CANDIDATE_POLL_INTERVAL),
            relay_candidate_delay_ms: millis(RELAY_CANDIDATE_DELAY),
        }
    }
}

impl RelayConfig {
    /// Returns the configuration directory path.
    ///
    /// Directory selection priority:
    /// 1. `UNIFI_RELAY_CONFIG_DIR` env var
    /// 2. Platform config dir (Linux: ~/.config/unifi-relay)
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("UNIFI_RELAY_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("unifi-relay"))
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir`, or defaults when there is none.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            log::debug!("No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", config_path.display()))
    }

    /// Apply `UNIFI_RELAY_*` overrides looked up through `var`. Unparseable
    /// numbers are ignored with a warning.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("UNIFI_RELAY_ACCESS_CONFIG_URL") {
            self.access_config_url = url;
        }
        if let Some(url) = var("UNIFI_RELAY_SSO_BASE_URL") {
            self.sso_base_url = url;
        }
        if let Some(site) = var("UNIFI_RELAY_SITE") {
            self.site = site;
        }
        if let Some(base) = var("UNIFI_RELAY_API_BASE") {
            self.api_base = base;
        }

        let numeric = [
            ("UNIFI_RELAY_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms),
            ("UNIFI_RELAY_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms),
            ("UNIFI_RELAY_BUS_ACK_TIMEOUT_MS", &mut self.bus_ack_timeout_ms),
            ("UNIFI_RELAY_NEGOTIATION_TIMEOUT_MS", &mut self.negotiation_timeout_ms),
            ("UNIFI_RELAY_CHANNEL_OPEN_TIMEOUT_MS", &mut self.channel_open_timeout_ms),
            ("UNIFI_RELAY_RESPONSE_TIMEOUT_MS", &mut self.response_timeout_ms),
            ("UNIFI_RELAY_CANDIDATE_POLL_INTERVAL_MS", &mut self.candidate_poll_interval_ms),
            ("UNIFI_RELAY_RELAY_CANDIDATE_DELAY_MS", &mut self.relay_candidate_delay_ms),
        ];
        for (name, field) in numeric {
            if let Some(value) = var(name) {
                match value.parse::<u64>() {
                    Ok(ms) => *field = ms,
                    Err(_) => log::warn!("Ignoring {name}={value}: not a number of milliseconds"),
                }
            }
        }
    }

    /// Settings for the cloud HTTP client.
    pub fn cloud_settings(&self) -> CloudSettings {
        CloudSettings {
            access_config_url: self.access_config_url.clone(),
            sso_base_url: self.sso_base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Settings for a console connection.
    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            api_base: self.api_base.trim_end_matches('/').to_string(),
            site: self.site.clone(),
            negotiation: NegotiationConfig {
                pacing: Pacing {
                    poll_interval: Duration::from_millis(self.candidate_poll_interval_ms),
                    relay_delay: Duration::from_millis(self.relay_candidate_delay_ms),
                },
                timeout: Duration::from_millis(self.negotiation_timeout_ms),
            },
            channels: ChannelTimeouts {
                open: Duration::from_millis(self.channel_open_timeout_ms),
                response: Duration::from_millis(self.response_timeout_ms),
            },
            bus_ack_timeout: Duration::from_millis(self.bus_ack_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}
