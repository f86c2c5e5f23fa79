//! Subnet probing
//!
//! Fallback discovery for networks that drop multicast: ask every address
//! on the local /24 (and any configured favorites) for `GET /info`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};

use super::registry::DeviceRegistry;
use super::types::{DeviceInfo, PeerDevice};
use crate::config::DiscoveryConfig;
use crate::error::SyncError;
use crate::stats::SyncStats;

/// Every host address of the /24 around `local`, except `local` itself
pub fn subnet_candidates(local: Ipv4Addr) -> Vec<IpAddr> {
    let [a, b, c, own] = local.octets();
    (1..=254u8)
        .filter(|host| *host != own)
        .map(|host| IpAddr::V4(Ipv4Addr::new(a, b, c, host)))
        .collect()
}

/// Probes addresses and registers the devices that answer
pub struct SubnetProber {
    http: reqwest::Client,
    local_id: String,
    registry: DeviceRegistry,
    stats: Arc<SyncStats>,
    concurrency: usize,
    scan_subnet: bool,
    favorites: Vec<IpAddr>,
}

impl SubnetProber {
    pub fn new(
        config: &DiscoveryConfig,
        local_id: impl Into<String>,
        registry: DeviceRegistry,
        stats: Arc<SyncStats>,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .connect_timeout(config.probe_timeout)
            .build()?;

        Ok(Self {
            http,
            local_id: local_id.into(),
            registry,
            stats,
            concurrency: config.probe_concurrency.max(1),
            scan_subnet: config.probe_subnet,
            favorites: config.favorites.clone(),
        })
    }

    /// Whether there is anything to probe
    pub fn is_enabled(&self) -> bool {
        self.scan_subnet || !self.favorites.is_empty()
    }

    /// Ask one address for its device info
    pub async fn probe(&self, addr: SocketAddr) -> Result<PeerDevice, SyncError> {
        let url = format!("http://{}/info", addr);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::Unreachable(format!("{} answered {}", url, response.status())));
        }

        let info: DeviceInfo = response.json().await?;
        Ok(info.into_peer(addr, Utc::now()))
    }

    /// Probe favorites and, when enabled, the local subnet on `port`.
    ///
    /// Returns how many devices answered.
    pub async fn run_once(&self, port: u16) -> usize {
        let mut targets: Vec<IpAddr> = self.favorites.clone();
        if self.scan_subnet {
            match local_ip_address::local_ip() {
                Ok(IpAddr::V4(local)) => targets.extend(subnet_candidates(local)),
                Ok(other) => tracing::debug!(address = %other, "Subnet scan needs an IPv4 address"),
                Err(e) => tracing::debug!(error = %e, "Cannot determine local address"),
            }
        }
        targets.sort();
        targets.dedup();

        let found = stream::iter(targets)
            .map(|ip| self.probe_and_register(SocketAddr::new(ip, port)))
            .buffer_unordered(self.concurrency)
            .filter(|found| futures::future::ready(*found))
            .count()
            .await;

        tracing::debug!(found, "Subnet probe finished");
        found
    }

    async fn probe_and_register(&self, addr: SocketAddr) -> bool {
        match self.probe(addr).await {
            Ok(peer) if peer.id == self.local_id => false,
            Ok(peer) => {
                self.registry.upsert(peer).await;
                true
            }
            Err(e) => {
                self.stats.probe_failed();
                if let Some(known) = self.registry.find_by_address(addr).await {
                    tracing::debug!(peer_id = %known.id, error = %e, "Known peer stopped answering probes");
                    self.registry.remove(&known.id).await;
                }
                false
            }
        }
    }

    /// Probe now and then on every interval
    pub fn start_probe_task(self, port: u16, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                self.run_once(port).await;
            }
        })
    }
}
