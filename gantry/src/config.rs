use std::path::Path;

use gantry_core::{GantryError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub peer: PeerSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub hall: HallSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Peer type, e.g. `gateway` or `hall`; the first half of the full name.
    #[serde(rename = "type")]
    pub peer_type: String,
    pub id: i32,
    /// Address other peers dial, published into discovery.
    pub address: String,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// `etcd` or `memory`. Memory is single-process, for development.
    #[serde(default = "default_store_mode")]
    pub mode: String,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_listen")]
    pub listen_addr: String,
    /// Peer type the upstream pool tracks.
    #[serde(default = "default_hall_type")]
    pub hall_type: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallSettings {
    #[serde(default = "default_hall_listen")]
    pub listen_addr: String,
    /// Identifies the running binary; newer wins at gateway selection.
    /// Deploy tooling stamps this; 0 falls back to process start time.
    #[serde(default)]
    pub build_time: i64,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    /// Service name registered on start.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Suffix the service name with the peer id on registration.
    #[serde(default)]
    pub as_app_service: bool,
}

fn default_lease_ttl() -> i64 {
    10
}

fn default_store_mode() -> String {
    "etcd".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_gateway_listen() -> String {
    "0.0.0.0:7000".to_string()
}

fn default_hall_type() -> String {
    "hall".to_string()
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_hall_listen() -> String {
    "0.0.0.0:7100".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_service_name() -> String {
    "hall".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            mode: default_store_mode(),
            endpoints: default_endpoints(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listen_addr: default_gateway_listen(),
            hall_type: default_hall_type(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for HallSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_hall_listen(),
            build_time: 0,
            app_version: default_app_version(),
            service_name: default_service_name(),
            as_app_service: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|err| GantryError::Internal(format!("bad config: {err}")))
    }

    pub fn example(peer_type: &str) -> Self {
        Self {
            peer: PeerSettings {
                peer_type: peer_type.to_string(),
                id: 1,
                address: "127.0.0.1:7100".to_string(),
                lease_ttl_secs: default_lease_ttl(),
            },
            store: StoreSettings::default(),
            gateway: GatewaySettings::default(),
            hall: HallSettings::default(),
        }
    }
}
