//! Device Registry
//!
//! Tracks peers seen on the network with:
//! - One entry per device id; re-announcements replace, never duplicate
//! - `lastSeenAt` that only moves forward
//! - Background eviction of peers that went quiet
//! - Join/leave events for the sync layer

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use super::types::PeerDevice;
use crate::stats::SyncStats;

const EVENT_CAPACITY: usize = 64;

/// Change in the set of known peers
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    PeerJoined(PeerDevice),
    PeerLeft(String),
}

// ============================================================================
// Device Registry
// ============================================================================

/// Shared registry of known peers
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<DeviceRegistryInner>,
}

struct DeviceRegistryInner {
    /// Our own device id; never registered as a peer
    local_id: String,

    /// Known peers indexed by device id
    peers: RwLock<HashMap<String, PeerDevice>>,

    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new(local_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(DeviceRegistryInner {
                local_id: local_id.into(),
                peers: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Insert or refresh a peer. Returns true if the peer was not known.
    ///
    /// Address, port, name and capabilities take the latest values;
    /// `last_seen_at` keeps the later of the stored and incoming sighting.
    pub async fn upsert(&self, peer: PeerDevice) -> bool {
        if peer.id == self.inner.local_id {
            return false;
        }

        let joined = {
            let mut peers = self.inner.peers.write().await;
            match peers.get_mut(&peer.id) {
                Some(existing) => {
                    let last_seen_at = existing.last_seen_at.max(peer.last_seen_at);
                    *existing = PeerDevice { last_seen_at, ..peer };
                    None
                }
                None => {
                    peers.insert(peer.id.clone(), peer.clone());
                    Some(peer)
                }
            }
        };

        match joined {
            Some(peer) => {
                tracing::info!(
                    peer_id = %peer.id,
                    name = %peer.display_name,
                    address = %peer.socket_addr(),
                    "Peer discovered"
                );
                let _ = self.inner.events.send(RegistryEvent::PeerJoined(peer));
                true
            }
            None => false,
        }
    }

    /// Forget a peer
    pub async fn remove(&self, peer_id: &str) -> Option<PeerDevice> {
        let removed = self.inner.peers.write().await.remove(peer_id);
        if let Some(peer) = &removed {
            tracing::info!(peer_id = %peer.id, "Peer removed");
            let _ = self.inner.events.send(RegistryEvent::PeerLeft(peer.id.clone()));
        }
        removed
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    pub async fn get(&self, peer_id: &str) -> Option<PeerDevice> {
        self.inner.peers.read().await.get(peer_id).cloned()
    }

    /// All peers, ordered by id
    pub async fn list(&self) -> Vec<PeerDevice> {
        let mut peers: Vec<PeerDevice> = self.inner.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub async fn peers_with_capability(&self, capability: &str) -> Vec<PeerDevice> {
        let mut peers: Vec<PeerDevice> = self
            .inner
            .peers
            .read()
            .await
            .values()
            .filter(|p| p.has_capability(capability))
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub async fn find_by_address(&self, addr: SocketAddr) -> Option<PeerDevice> {
        self.inner
            .peers
            .read()
            .await
            .values()
            .find(|p| p.socket_addr() == addr)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Evict peers not seen for longer than `max_age`
    ///
    /// Returns the ids of evicted peers
    pub async fn sweep_stale(&self, max_age: Duration) -> Vec<String> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - max_age;

        let evicted: Vec<String> = {
            let mut peers = self.inner.peers.write().await;
            let stale: Vec<String> = peers
                .values()
                .filter(|p| p.last_seen_at < cutoff)
                .map(|p| p.id.clone())
                .collect();
            for id in &stale {
                peers.remove(id);
            }
            stale
        };

        for id in &evicted {
            tracing::debug!(peer_id = %id, "Evicted stale peer");
            let _ = self.inner.events.send(RegistryEvent::PeerLeft(id.clone()));
        }

        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "Evicted stale peers");
        }

        evicted
    }

    /// Start background eviction task
    pub fn start_sweep_task(
        self,
        stale_after: Duration,
        every: Duration,
        stats: Arc<SyncStats>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                let evicted = self.sweep_stale(stale_after).await;
                stats.peers_evicted(evicted.len());
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(id: &str, seen_secs_ago: i64) -> PeerDevice {
        PeerDevice {
            id: id.to_string(),
            display_name: format!("Device {}", id),
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: 8765,
            capabilities: ["warehouses".to_string()].into_iter().collect(),
            last_seen_at: Utc::now() - chrono::Duration::seconds(seen_secs_ago),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let registry = DeviceRegistry::new("self");

        assert!(registry.upsert(peer("a", 0)).await);
        assert!(!registry.upsert(peer("a", 0)).await);

        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_older_sighting_does_not_regress_last_seen() {
        let registry = DeviceRegistry::new("self");
        let fresh = peer("a", 0);
        let seen = fresh.last_seen_at;

        registry.upsert(fresh).await;
        let mut old = peer("a", 120);
        old.port = 8766;
        registry.upsert(old).await;

        let stored = registry.get("a").await.unwrap();
        assert_eq!(stored.last_seen_at, seen);
        assert_eq!(stored.port, 8766);
    }

    #[tokio::test]
    async fn test_self_is_never_registered() {
        let registry = DeviceRegistry::new("self");
        assert!(!registry.upsert(peer("self", 0)).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_stale_peers() {
        let registry = DeviceRegistry::new("self");
        let mut events = registry.subscribe();

        registry.upsert(peer("fresh", 10)).await;
        registry.upsert(peer("stale", 700)).await;

        let evicted = registry.sweep_stale(Duration::from_secs(600)).await;
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(registry.get("stale").await.is_none());
        assert!(registry.get("fresh").await.is_some());

        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::PeerJoined(_)));
        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::PeerJoined(_)));
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::PeerLeft("stale".to_string())
        );
    }

    #[tokio::test]
    async fn test_capability_filter() {
        let registry = DeviceRegistry::new("self");
        let mut viewer = peer("viewer", 0);
        viewer.capabilities.clear();

        registry.upsert(peer("a", 0)).await;
        registry.upsert(viewer).await;

        let carriers = registry.peers_with_capability("warehouses").await;
        assert_eq!(carriers.len(), 1);
        assert_eq!(carriers[0].id, "a");
    }
}
