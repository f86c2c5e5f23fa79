//! Multicast announcements
//!
//! Every node periodically sends an [`Announcement`] to a fixed multicast
//! group and listens on the same group for others. Bind failures and bad
//! datagrams are logged and counted, never fatal.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::Utc;
use tokio::net::UdpSocket;

use super::registry::DeviceRegistry;
use super::types::Announcement;
use crate::config::{Config, DiscoveryConfig};
use crate::error::SyncError;
use crate::stats::SyncStats;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 4096;

/// Bind the listening socket and join the group
pub async fn bind_listener(config: &DiscoveryConfig) -> Result<UdpSocket, SyncError> {
    let bind_failure = |reason: String| SyncError::BindFailure {
        what: format!("multicast port {}", config.multicast_port),
        reason,
    };

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.multicast_port))
        .await
        .map_err(|e| bind_failure(e.to_string()))?;
    socket
        .join_multicast_v4(config.multicast_group, Ipv4Addr::UNSPECIFIED)
        .map_err(|e| bind_failure(e.to_string()))?;

    Ok(socket)
}

/// Receive announcements and feed them into the registry
pub async fn listen(
    socket: UdpSocket,
    local_id: String,
    registry: DeviceRegistry,
    stats: Arc<SyncStats>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "Multicast receive failed");
                continue;
            }
        };

        let announcement = match Announcement::parse(&buf[..len]) {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::debug!(source = %source, error = %e, "Dropping malformed datagram");
                stats.malformed_datagram();
                continue;
            }
        };

        if announcement.id == local_id {
            continue;
        }

        stats.announcement_received();
        registry
            .upsert(announcement.into_peer(source.ip(), Utc::now()))
            .await;
    }
}

/// Announcement describing this node
pub fn local_announcement(config: &Config, port: u16) -> Announcement {
    let ip = local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    Announcement {
        id: config.device.id.clone(),
        name: config.device.name.clone(),
        ip,
        port,
        capabilities: config.device.capabilities.clone(),
        timestamp: Utc::now(),
    }
}

/// Send an announcement now and then on every interval
pub fn start_announce_task(config: Config, port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot open announce socket; not announcing");
                return;
            }
        };
        let _ = socket.set_multicast_loop_v4(true);

        let target = SocketAddr::from((
            config.discovery.multicast_group,
            config.discovery.multicast_port,
        ));
        let mut interval = tokio::time::interval(config.discovery.announce_interval);

        loop {
            interval.tick().await;

            let announcement = local_announcement(&config, port);
            let payload = match serde_json::to_vec(&announcement) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "Cannot encode announcement");
                    return;
                }
            };

            match socket.send_to(&payload, target).await {
                Ok(_) => tracing::trace!(target = %target, "Sent announcement"),
                Err(e) => tracing::debug!(target = %target, error = %e, "Announcement failed"),
            }
        }
    })
}
