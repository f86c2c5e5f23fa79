//! Configuration management for the StockMesh node

use serde::Deserialize;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use uuid::Uuid;

/// Capability a peer must advertise to receive inventory batches
pub const WAREHOUSES_CAPABILITY: &str = "warehouses";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub discovery: DiscoveryConfig,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How many consecutive ports to try after `port` when it is taken
    pub port_fallback_attempts: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Listen for and send multicast announcements
    pub multicast_enabled: bool,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub announce_interval: Duration,
    /// Peers not heard from within this window are evicted
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_concurrency: usize,
    pub probe_subnet: bool,
    /// Addresses probed directly, for networks that drop multicast
    pub favorites: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub debounce: Duration,
    pub max_batch_window: Duration,
    pub request_timeout: Duration,
    pub session_timeout: Duration,
    pub periodic_interval: Duration,
    pub max_offline_batches: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8765,
                port_fallback_attempts: 3,
            },
            device: DeviceConfig {
                id: Uuid::new_v4().to_string(),
                name: default_device_name(),
                capabilities: default_capabilities(),
            },
            discovery: DiscoveryConfig::default(),
            sync: SyncConfig::default(),
            database: DatabaseConfig {
                url: "sqlite:./stockmesh.db".to_string(),
            },
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            multicast_enabled: true,
            multicast_group: Ipv4Addr::new(239, 255, 42, 99),
            multicast_port: 41234,
            announce_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_secs(120),
            probe_concurrency: 32,
            probe_subnet: false,
            favorites: Vec::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            debounce: Duration::from_secs(2),
            max_batch_window: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
            periodic_interval: Duration::from_secs(60),
            max_offline_batches: 256,
        }
    }
}

impl Config {
    /// Build configuration from `STOCKMESH_*` environment variables.
    ///
    /// Only the device id is persisted state worth failing over; everything
    /// else falls back to defaults when unset or unparsable.
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        let device_id = match env::var("STOCKMESH_DEVICE_ID") {
            Ok(id) if !id.trim().is_empty() => id,
            Ok(_) | Err(env::VarError::NotPresent) => defaults.device.id.clone(),
            Err(e) => return Err(e),
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("STOCKMESH_HOST").unwrap_or(defaults.server.host),
                port: parse_var("STOCKMESH_PORT").unwrap_or(defaults.server.port),
                port_fallback_attempts: parse_var("STOCKMESH_PORT_FALLBACK_ATTEMPTS")
                    .unwrap_or(defaults.server.port_fallback_attempts),
            },
            device: DeviceConfig {
                id: device_id,
                name: env::var("STOCKMESH_DEVICE_NAME").unwrap_or(defaults.device.name),
                capabilities: env::var("STOCKMESH_CAPABILITIES")
                    .map(|v| split_csv(&v))
                    .unwrap_or(defaults.device.capabilities),
            },
            discovery: DiscoveryConfig {
                multicast_enabled: parse_var("STOCKMESH_MULTICAST")
                    .unwrap_or(defaults.discovery.multicast_enabled),
                multicast_group: parse_var("STOCKMESH_MULTICAST_GROUP")
                    .unwrap_or(defaults.discovery.multicast_group),
                multicast_port: parse_var("STOCKMESH_MULTICAST_PORT")
                    .unwrap_or(defaults.discovery.multicast_port),
                announce_interval: secs_var("STOCKMESH_ANNOUNCE_INTERVAL_SECS")
                    .unwrap_or(defaults.discovery.announce_interval),
                stale_after: secs_var("STOCKMESH_PEER_STALE_SECS")
                    .unwrap_or(defaults.discovery.stale_after),
                sweep_interval: secs_var("STOCKMESH_SWEEP_INTERVAL_SECS")
                    .unwrap_or(defaults.discovery.sweep_interval),
                probe_timeout: millis_var("STOCKMESH_PROBE_TIMEOUT_MS")
                    .unwrap_or(defaults.discovery.probe_timeout),
                probe_interval: secs_var("STOCKMESH_PROBE_INTERVAL_SECS")
                    .unwrap_or(defaults.discovery.probe_interval),
                probe_concurrency: parse_var("STOCKMESH_PROBE_CONCURRENCY")
                    .unwrap_or(defaults.discovery.probe_concurrency),
                probe_subnet: parse_var("STOCKMESH_PROBE_SUBNET")
                    .unwrap_or(defaults.discovery.probe_subnet),
                favorites: env::var("STOCKMESH_FAVORITES")
                    .map(|v| split_csv(&v).iter().filter_map(|a| a.parse().ok()).collect())
                    .unwrap_or_default(),
            },
            sync: SyncConfig {
                debounce: millis_var("STOCKMESH_DEBOUNCE_MS").unwrap_or(defaults.sync.debounce),
                max_batch_window: millis_var("STOCKMESH_MAX_BATCH_WINDOW_MS")
                    .unwrap_or(defaults.sync.max_batch_window),
                request_timeout: millis_var("STOCKMESH_REQUEST_TIMEOUT_MS")
                    .unwrap_or(defaults.sync.request_timeout),
                session_timeout: secs_var("STOCKMESH_SESSION_TIMEOUT_SECS")
                    .unwrap_or(defaults.sync.session_timeout),
                periodic_interval: secs_var("STOCKMESH_SYNC_INTERVAL_SECS")
                    .unwrap_or(defaults.sync.periodic_interval),
                max_offline_batches: parse_var("STOCKMESH_MAX_OFFLINE_BATCHES")
                    .unwrap_or(defaults.sync.max_offline_batches),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
        })
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.device.capabilities.iter().any(|c| c == capability)
    }
}

fn default_device_name() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "stockmesh-device".to_string())
}

fn default_capabilities() -> Vec<String> {
    vec![WAREHOUSES_CAPABILITY.to_string(), "sync".to_string()]
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn secs_var(key: &str) -> Option<Duration> {
    parse_var::<u64>(key).map(Duration::from_secs)
}

fn millis_var(key: &str) -> Option<Duration> {
    parse_var::<u64>(key).map(Duration::from_millis)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.discovery.stale_after, Duration::from_secs(600));
        assert_eq!(config.sync.debounce, Duration::from_secs(2));
        assert_eq!(config.sync.max_batch_window, Duration::from_secs(10));
        assert!(config.has_capability(WAREHOUSES_CAPABILITY));
    }

    #[test]
    fn test_split_csv_skips_blanks() {
        assert_eq!(
            split_csv(" warehouses, ,sync ,"),
            vec!["warehouses".to_string(), "sync".to_string()]
        );
    }
}
