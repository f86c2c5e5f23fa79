//! Discovery data types

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device seen on the local network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDevice {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub address: IpAddr,
    pub port: u16,
    pub capabilities: BTreeSet<String>,
    /// Local time of the most recent sighting
    #[serde(rename = "lastSeenAt")]
    pub last_seen_at: DateTime<Utc>,
}

impl PeerDevice {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// `http://host:port`, with IPv6 hosts bracketed
    pub fn base_url(&self) -> String {
        format!("http://{}", self.socket_addr())
    }
}

/// Multicast announcement datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Announcement {
    /// Decode and sanity-check a datagram
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        let announcement: Announcement =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid announcement: {}", e))?;

        if announcement.id.trim().is_empty() {
            return Err("announcement without id".to_string());
        }
        if announcement.port == 0 {
            return Err(format!("announcement from {} without port", announcement.id));
        }
        Ok(announcement)
    }

    /// Peer entry for this announcement.
    ///
    /// An unspecified announced address is replaced by the datagram's
    /// source address.
    pub fn into_peer(self, source: IpAddr, seen_at: DateTime<Utc>) -> PeerDevice {
        let address = if self.ip.is_unspecified() { source } else { self.ip };
        PeerDevice {
            id: self.id,
            display_name: self.name,
            address,
            port: self.port,
            capabilities: self.capabilities.into_iter().collect(),
            last_seen_at: seen_at,
        }
    }
}

/// Response body of `GET /info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    pub capabilities: Vec<String>,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl DeviceInfo {
    /// Peer entry for a device that answered a probe at `probed`
    pub fn into_peer(self, probed: SocketAddr, seen_at: DateTime<Utc>) -> PeerDevice {
        PeerDevice {
            id: self.id,
            display_name: self.name,
            address: probed.ip(),
            port: self.port,
            capabilities: self.capabilities.into_iter().collect(),
            last_seen_at: seen_at,
        }
    }
}
