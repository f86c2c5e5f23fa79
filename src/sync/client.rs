//! Outbound side of peer synchronization
//!
//! A sync session with one peer runs these steps in order:
//! 1. `GET /sync/status` to confirm the peer is up
//! 2. `POST /sync` to pull everything it logged since our checkpoint
//! 3. Merge the pulled records locally
//! 4. Push our own changes since the checkpoint, one collection at a time
//! 5. Advance the checkpoint
//!
//! The checkpoint only moves when every step succeeded, so an interrupted
//! session is simply repeated.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;

use super::batcher::{BatchSink, Delivery, OutboundBatch};
use super::checkpoint::{CheckpointBook, SyncCheckpoint};
use super::merge::Merger;
use super::types::{
    ChangeRecord, MergeOutcome, PushRequest, PushResponse, SyncData, SyncRequest, SyncResponse,
    SyncStatusResponse,
};
use crate::config::{Config, WAREHOUSES_CAPABILITY};
use crate::discovery::{DeviceRegistry, PeerDevice};
use crate::error::SyncError;
use crate::inventory::{EntityType, InventoryRepository};
use crate::stats::SyncStats;

/// Boundaries are moved back by this much when stored. Records committed
/// while a query runs can carry a slightly earlier log time; resending a
/// second of history costs nothing since merges are idempotent.
const CHECKPOINT_OVERLAP: chrono::Duration = chrono::Duration::seconds(1);

/// What one completed session exchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub peer_id: String,
    pub pulled: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub pushed: usize,
}

/// Removes a peer from the in-flight set when the session ends
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    peer_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.peer_id);
    }
}

/// HTTP client for sync sessions and batch pushes
pub struct SyncClient {
    http: reqwest::Client,
    device_id: String,
    session_timeout: Duration,
    pool: SqlitePool,
    merger: Arc<Merger>,
    registry: DeviceRegistry,
    checkpoints: CheckpointBook,
    stats: Arc<SyncStats>,
    in_flight: Mutex<HashSet<String>>,
}

impl SyncClient {
    pub fn new(
        config: &Config,
        merger: Arc<Merger>,
        registry: DeviceRegistry,
        checkpoints: CheckpointBook,
        stats: Arc<SyncStats>,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(config.sync.request_timeout)
            .build()?;

        Ok(Self {
            http,
            device_id: config.device.id.clone(),
            session_timeout: config.sync.session_timeout,
            pool: merger.pool().clone(),
            merger,
            registry,
            checkpoints,
            stats,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn checkpoints(&self) -> &CheckpointBook {
        &self.checkpoints
    }

    // ========================================================================
    // Sync Sessions
    // ========================================================================

    /// Run one full session with a peer.
    ///
    /// Returns `Ok(None)` when a session with that peer is already running.
    pub async fn sync_with_peer(
        &self,
        peer: &PeerDevice,
    ) -> Result<Option<SessionSummary>, SyncError> {
        let Some(_guard) = self.begin_session(&peer.id) else {
            tracing::debug!(peer_id = %peer.id, "Sync already in progress, skipping");
            self.stats.session_postponed();
            return Ok(None);
        };

        let result = match tokio::time::timeout(self.session_timeout, self.run_session(peer)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.session_timeout)),
        };

        match &result {
            Ok(summary) => {
                self.stats.session_completed();
                tracing::info!(
                    peer_id = %peer.id,
                    pulled = summary.pulled,
                    applied = summary.applied,
                    conflicts = summary.conflicts,
                    pushed = summary.pushed,
                    "Sync session completed"
                );
            }
            Err(e) => {
                self.stats.session_postponed();
                if e.is_transient() {
                    tracing::debug!(peer_id = %peer.id, error = %e, "Sync postponed");
                } else {
                    tracing::warn!(peer_id = %peer.id, error = %e, "Sync session failed");
                }
            }
        }

        result.map(Some)
    }

    /// Sync with every known peer that carries warehouses, one task each
    pub async fn sync_all(self: &Arc<Self>) {
        let peers = self.registry.peers_with_capability(WAREHOUSES_CAPABILITY).await;
        for peer in peers {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                let _ = client.sync_with_peer(&peer).await;
            });
        }
    }

    /// Start the periodic sync task
    pub fn start_periodic_task(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.sync_all().await;
            }
        })
    }

    fn begin_session(&self, peer_id: &str) -> Option<InFlightGuard<'_>> {
        if !self.in_flight.lock().insert(peer_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            peer_id: peer_id.to_string(),
        })
    }

    async fn run_session(&self, peer: &PeerDevice) -> Result<SessionSummary, SyncError> {
        let started_at = Utc::now();
        let base_url = peer.base_url();
        let checkpoint = self.checkpoints.get(&peer.id).await;

        let status: SyncStatusResponse = self.get_json(&format!("{}/sync/status", base_url)).await?;
        if status.device_id != peer.id {
            return Err(SyncError::MalformedMessage(format!(
                "{} answered as device {}, expected {}",
                base_url, status.device_id, peer.id
            )));
        }

        // Pull
        let request = SyncRequest {
            device_id: self.device_id.clone(),
            last_sync: checkpoint.as_ref().map(|c| c.last_exchanged),
            warehouses: None,
            records: Vec::new(),
        };
        let response: SyncResponse = self
            .post_json(&format!("{}/sync", base_url), &request)
            .await?;

        let pulled = response.data.len();
        let (results, conflicts) = self.merger.apply_batch(response.data.into_records()).await;
        let applied = results
            .iter()
            .filter(|r| r.outcome == MergeOutcome::Applied)
            .count();
        let unsettled = results.iter().filter(|r| !r.outcome.is_settled()).count();

        // Pull again from the old boundary next time if anything did not land
        let last_exchanged = if unsettled == 0 {
            response.sync_timestamp - CHECKPOINT_OVERLAP
        } else {
            tracing::warn!(peer_id = %peer.id, unsettled, "Some pulled records could not be merged");
            checkpoint
                .as_ref()
                .map(|c| c.last_exchanged)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        };

        // Push
        let outgoing = self
            .local_changes_for(&peer.id, checkpoint.as_ref().map(|c| c.last_pushed))
            .await?;
        let pushed = outgoing.len();
        let refused = self.push_records(&base_url, None, outgoing).await?;

        let last_pushed = if refused == 0 {
            started_at - CHECKPOINT_OVERLAP
        } else {
            tracing::warn!(peer_id = %peer.id, refused, "Peer could not merge some pushed records");
            checkpoint
                .as_ref()
                .map(|c| c.last_pushed)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        };

        self.checkpoints
            .advance(SyncCheckpoint {
                peer_id: peer.id.clone(),
                last_exchanged,
                last_pushed,
            })
            .await?;

        Ok(SessionSummary {
            peer_id: peer.id.clone(),
            pulled,
            applied,
            conflicts: conflicts.len(),
            pushed,
        })
    }

    /// Logged records for shared warehouses that the peer did not author
    /// itself
    async fn local_changes_for(
        &self,
        peer_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        let visible: Vec<String> = self.visible_warehouses().await?.into_iter().collect();

        InventoryRepository::new(&self.pool)
            .changes_since(since, Some(&visible), Some(peer_id))
            .await
            .map_err(SyncError::storage)
    }

    async fn visible_warehouses(&self) -> Result<HashSet<String>, SyncError> {
        Ok(InventoryRepository::new(&self.pool)
            .shared_warehouse_ids()
            .await
            .map_err(SyncError::storage)?
            .into_iter()
            .collect())
    }

    // ========================================================================
    // Push
    // ========================================================================

    /// Push records to a peer, parents before children.
    ///
    /// Returns how many records the peer reported as not settled.
    async fn push_records(
        &self,
        base_url: &str,
        batch_id: Option<&str>,
        records: Vec<ChangeRecord>,
    ) -> Result<usize, SyncError> {
        let data = SyncData::from_records(records);
        let groups = [
            (EntityType::Warehouse, data.warehouses),
            (EntityType::Room, data.rooms),
            (EntityType::Container, data.containers),
            (EntityType::Item, data.items),
        ];

        let mut refused = 0;

        for (entity_type, records) in groups {
            if records.is_empty() {
                continue;
            }

            let body = PushRequest {
                batch_id: batch_id.map(|id| format!("{}:{}", id, entity_type.collection())),
                device_id: Some(self.device_id.clone()),
                records: records
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<_, _>>()
                    .map_err(|e| SyncError::MalformedMessage(e.to_string()))?,
            };

            let url = format!("{}/{}", base_url, entity_type.collection());
            let response: PushResponse = self.post_json(&url, &body).await?;

            if !response.conflicts.is_empty() {
                tracing::info!(
                    url = %url,
                    conflicts = response.conflicts.len(),
                    "Peer recorded conflicts for pushed records"
                );
            }
            for result in response.results.iter().filter(|r| !r.outcome.is_settled()) {
                tracing::debug!(
                    url = %url,
                    change_id = %result.id,
                    outcome = result.outcome.as_str(),
                    error = ?result.error,
                    "Pushed record not settled"
                );
                refused += 1;
            }
        }

        Ok(refused)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SyncError> {
        let response = self.http.get(url).send().await?;
        read_json(url, response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, SyncError> {
        let response = self.http.post(url).json(body).send().await?;
        read_json(url, response).await
    }
}

async fn read_json<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T, SyncError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(SyncError::MalformedMessage(format!(
            "{} answered {}: {}",
            url, status, text
        )));
    }
    Ok(response.json::<T>().await?)
}

#[async_trait]
impl BatchSink for SyncClient {
    async fn deliver(&self, batch: &OutboundBatch) -> Result<Delivery, SyncError> {
        let peers: Vec<PeerDevice> = self
            .registry
            .peers_with_capability(WAREHOUSES_CAPABILITY)
            .await
            .into_iter()
            .filter(|p| !batch.delivered_to.contains(&p.id))
            .collect();

        if peers.is_empty() {
            return Ok(Delivery::default());
        }

        // Private warehouses never leave this device
        let visible = self.visible_warehouses().await?;
        let visible = &visible;

        let attempts = peers.iter().map(|peer| async move {
            let records = batch
                .records
                .iter()
                .filter(|r| r.origin_device_id != peer.id && visible.contains(&r.warehouse_id))
                .cloned()
                .collect();
            let accepted = match self.push_records(&peer.base_url(), Some(&batch.id), records).await {
                Ok(0) => true,
                Ok(refused) => {
                    tracing::debug!(peer_id = %peer.id, batch_id = %batch.id, refused, "Batch partly refused");
                    false
                }
                Err(e) => {
                    tracing::debug!(peer_id = %peer.id, batch_id = %batch.id, error = %e, "Batch push failed");
                    false
                }
            };
            (peer.id.clone(), accepted)
        });

        let mut delivery = Delivery::default();
        for (peer_id, accepted) in futures::future::join_all(attempts).await {
            if accepted {
                delivery.accepted.push(peer_id);
            } else {
                delivery.missed.push(peer_id);
            }
        }

        Ok(delivery)
    }
}
