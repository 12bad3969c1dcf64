//! Node configuration.
//!
//! Values come from a YAML file, then `LORA_LINK_*` environment variables,
//! then command line flags (applied in `main`). A missing or unreadable
//! file falls back to defaults.

use anyhow::{bail, Context, Result};
use link_engine::{AutoAsaConfig, LinkConfig, RfConfig, PROFILE_COUNT};
use link_wire::Address;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Automatic profile selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAsaSection {
    pub enabled: bool,
    /// humantime duration, e.g. `10s`
    pub interval: String,
    pub hysteresis_db: f32,
}

impl Default for AutoAsaSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: "10s".to_string(),
            hysteresis_db: 3.0,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Own link address
    pub address: u8,
    /// Peer for heartbeats, startup negotiation and automatic selection
    pub peer: u8,
    /// Profile applied at start
    pub initial_profile: u8,
    /// UDP socket of the simulated radio
    pub bind: SocketAddr,
    /// UDP sockets of the other simulated radios
    pub peers: Vec<SocketAddr>,
    /// RSSI reported for every received packet, dBm
    pub rssi: f32,
    /// SNR reported for every received packet, dB
    pub snr: f32,
    pub frequency_mhz: f32,
    pub tx_power_dbm: i8,
    /// Heartbeat period; no heartbeats when unset
    pub heartbeat_interval: Option<String>,
    /// Diagnostics log period
    pub stats_interval: String,
    /// Profile to negotiate with the peer right after start
    pub request_profile: Option<u8>,
    pub auto_asa: AutoAsaSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let rf = RfConfig::default();
        Self {
            address: Address::MASTER.0,
            peer: Address::SLAVE.0,
            initial_profile: 0,
            bind: SocketAddr::from(([127, 0, 0, 1], 7001)),
            peers: vec![SocketAddr::from(([127, 0, 0, 1], 7002))],
            rssi: -80.0,
            snr: 9.0,
            frequency_mhz: rf.frequency_mhz,
            tx_power_dbm: rf.tx_power_dbm,
            heartbeat_interval: None,
            stats_interval: "30s".to_string(),
            request_profile: None,
            auto_asa: AutoAsaSection::default(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<NodeConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        info!(
            "Node configuration: address={}, peer={}, profile={}, bind={}, peers={:?}",
            config.address, config.peer, config.initial_profile, config.bind, config.peers
        );
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        if let Some(address) = env_parse::<u8>("LORA_LINK_ADDRESS") {
            self.address = address;
            info!("Address overridden by environment: {}", address);
        }
        if let Some(peer) = env_parse::<u8>("LORA_LINK_PEER") {
            self.peer = peer;
            info!("Peer overridden by environment: {}", peer);
        }
        if let Some(profile) = env_parse::<u8>("LORA_LINK_PROFILE") {
            self.initial_profile = profile;
            info!("Initial profile overridden by environment: {}", profile);
        }
        if let Some(bind) = env_parse::<SocketAddr>("LORA_LINK_BIND") {
            self.bind = bind;
            info!("Bind address overridden by environment: {}", bind);
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if Address(self.address).is_broadcast() {
            bail!("address {} is reserved for broadcast", self.address);
        }
        if self.address == self.peer {
            bail!("address and peer are both {}", self.address);
        }
        if self.initial_profile as usize >= PROFILE_COUNT {
            bail!("initial profile {} out of range 0..{}", self.initial_profile, PROFILE_COUNT);
        }
        if let Some(profile) = self.request_profile {
            if profile as usize >= PROFILE_COUNT {
                bail!("requested profile {} out of range 0..{}", profile, PROFILE_COUNT);
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Result<Option<Duration>> {
        self.heartbeat_interval
            .as_deref()
            .map(|s| parse_duration("heartbeat_interval", s))
            .transpose()
    }

    pub fn stats_interval(&self) -> Result<Duration> {
        parse_duration("stats_interval", &self.stats_interval)
    }

    /// Engine configuration for this node
    pub fn to_link_config(&self) -> Result<LinkConfig> {
        Ok(LinkConfig {
            address: Address(self.address),
            default_peer: Address(self.peer),
            initial_profile: self.initial_profile,
            rf: RfConfig {
                frequency_mhz: self.frequency_mhz,
                tx_power_dbm: self.tx_power_dbm,
                ..RfConfig::default()
            },
            auto_asa: AutoAsaConfig {
                enabled: self.auto_asa.enabled,
                interval: parse_duration("auto_asa.interval", &self.auto_asa.interval)?,
                hysteresis_db: self.auto_asa.hysteresis_db,
            },
            ..LinkConfig::default()
        })
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {}: {:?}", field, value))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", name, value);
            None
        }
    }
}
