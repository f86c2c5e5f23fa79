//! Outbound change batching
//!
//! Local change records are collected into batches:
//! - A batch is flushed once no record arrived for the debounce interval
//! - A burst that never goes quiet is flushed when the batch window closes
//! - Batches wait in a bounded offline queue until every capable peer has
//!   taken them, or a few partial deliveries have passed
//! - The offline queue is drained, oldest first, on reconnect and before
//!   any newer batch is sent

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use super::types::ChangeRecord;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::stats::SyncStats;

// ============================================================================
// Debounce State Machine
// ============================================================================

/// Timer state of the batcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Nothing pending
    Idle,
    /// Records pending; flush at `deadline`, never later than `window_end`
    Pending { deadline: Instant, window_end: Instant },
}

impl DebounceState {
    /// A record was enqueued at `now`
    pub fn on_enqueue(self, now: Instant, debounce: Duration, max_window: Duration) -> Self {
        match self {
            DebounceState::Idle => DebounceState::Pending {
                deadline: now + debounce.min(max_window),
                window_end: now + max_window,
            },
            DebounceState::Pending { window_end, .. } => DebounceState::Pending {
                deadline: (now + debounce).min(window_end),
                window_end,
            },
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            DebounceState::Idle => None,
            DebounceState::Pending { deadline, .. } => Some(*deadline),
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| d <= now)
    }
}

// ============================================================================
// Batches and Delivery
// ============================================================================

/// A batch is dropped from the queue after this many drains that reached
/// some peers but not all; sync sessions carry the rest
const MAX_PARTIAL_DELIVERIES: u32 = 5;

/// A group of records sent together
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    /// Stable across retries so receivers can spot a resend
    pub id: String,
    pub records: Vec<ChangeRecord>,
    pub created_at: DateTime<Utc>,
    /// Peers that already accepted this batch
    pub delivered_to: HashSet<String>,
    /// Drains that left some capable peer without the batch
    pub partial_deliveries: u32,
}

impl OutboundBatch {
    pub fn new(records: Vec<ChangeRecord>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            records,
            created_at: Utc::now(),
            delivered_to: HashSet::new(),
            partial_deliveries: 0,
        }
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Peers that settled every record of the batch
    pub accepted: Vec<String>,
    /// Capable peers that were unreachable or refused part of it
    pub missed: Vec<String>,
}

/// Where flushed batches go
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Send a batch to every capable peer not in `batch.delivered_to`.
    async fn deliver(&self, batch: &OutboundBatch) -> Result<Delivery, SyncError>;
}

enum BatcherCommand {
    Enqueue(ChangeRecord),
    Reconnect,
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to the batcher task
#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::UnboundedSender<BatcherCommand>,
    offline_len: Arc<AtomicUsize>,
}

impl BatcherHandle {
    /// Queue a local change record for sending
    pub fn enqueue(&self, record: ChangeRecord) {
        if self.tx.send(BatcherCommand::Enqueue(record)).is_err() {
            tracing::warn!("Change batcher stopped; record stays in the change log only");
        }
    }

    /// A peer able to take batches became reachable
    pub fn notify_reconnect(&self) {
        let _ = self.tx.send(BatcherCommand::Reconnect);
    }

    /// Flush pending records now and wait until the attempt finished
    pub async fn flush_now(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(BatcherCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Number of batches waiting for a reachable peer
    pub fn offline_len(&self) -> usize {
        self.offline_len.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Batcher Task
// ============================================================================

/// Debounced batcher with an offline queue
pub struct ChangeBatcher {
    rx: mpsc::UnboundedReceiver<BatcherCommand>,
    sink: Arc<dyn BatchSink>,
    stats: Arc<SyncStats>,
    debounce: Duration,
    max_window: Duration,
    max_offline: usize,
    state: DebounceState,
    pending: Vec<ChangeRecord>,
    offline: VecDeque<OutboundBatch>,
    offline_len: Arc<AtomicUsize>,
}

impl ChangeBatcher {
    /// Start the batcher task
    pub fn spawn(
        sink: Arc<dyn BatchSink>,
        config: &SyncConfig,
        stats: Arc<SyncStats>,
    ) -> (BatcherHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let offline_len = Arc::new(AtomicUsize::new(0));

        let batcher = ChangeBatcher {
            rx,
            sink,
            stats,
            debounce: config.debounce,
            max_window: config.max_batch_window,
            max_offline: config.max_offline_batches.max(1),
            state: DebounceState::Idle,
            pending: Vec::new(),
            offline: VecDeque::new(),
            offline_len: offline_len.clone(),
        };

        let task = tokio::spawn(batcher.run());
        (BatcherHandle { tx, offline_len }, task)
    }

    async fn run(mut self) {
        loop {
            // The sleep future is built even when the branch is disabled
            let wake_at = self
                .state
                .deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(BatcherCommand::Enqueue(record)) => {
                        self.pending.push(record);
                        self.state = self.state.on_enqueue(Instant::now(), self.debounce, self.max_window);
                    }
                    Some(BatcherCommand::Reconnect) => {
                        self.drain_offline().await;
                    }
                    Some(BatcherCommand::Flush(done)) => {
                        self.flush().await;
                        let _ = done.send(());
                    }
                    None => {
                        self.flush().await;
                        tracing::debug!(offline = self.offline.len(), "Change batcher stopped");
                        break;
                    }
                },
                _ = sleep_until(wake_at), if self.state.deadline().is_some() => {
                    self.flush().await;
                }
            }
        }
    }

    /// Close the pending batch and send it after anything already queued
    async fn flush(&mut self) {
        self.state = DebounceState::Idle;

        let records = std::mem::take(&mut self.pending);
        if !records.is_empty() {
            self.push_offline(OutboundBatch::new(records));
        }

        self.drain_offline().await;
    }

    /// Deliver queued batches oldest first.
    ///
    /// Stops at the first batch that has reached nobody yet. A batch some
    /// peer still misses stays queued for the next drain while later batches
    /// go ahead.
    async fn drain_offline(&mut self) {
        let mut index = 0;

        while let Some(batch) = self.offline.get_mut(index) {
            let delivery = match self.sink.deliver(batch).await {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::warn!(batch_id = %batch.id, error = %e, "Batch delivery failed");
                    self.stats.batch_retained();
                    break;
                }
            };

            if delivery.accepted.is_empty() && batch.delivered_to.is_empty() {
                tracing::debug!(
                    batch_id = %batch.id,
                    missed = delivery.missed.len(),
                    "No peer took the batch, keeping it offline"
                );
                self.stats.batch_retained();
                break;
            }

            batch.delivered_to.extend(delivery.accepted);

            if delivery.missed.is_empty() {
                tracing::info!(
                    batch_id = %batch.id,
                    records = batch.records.len(),
                    peers = batch.delivered_to.len(),
                    "Flushed change batch"
                );
                self.offline.remove(index);
                self.stats.batch_flushed();
                continue;
            }

            batch.partial_deliveries += 1;
            if batch.partial_deliveries >= MAX_PARTIAL_DELIVERIES {
                tracing::warn!(
                    batch_id = %batch.id,
                    missed = ?delivery.missed,
                    "Giving up on batch for unreachable peers"
                );
                self.offline.remove(index);
                self.stats.batch_flushed();
                continue;
            }

            tracing::debug!(
                batch_id = %batch.id,
                missed = ?delivery.missed,
                "Batch reached some peers, keeping it for the rest"
            );
            self.stats.batch_retained();
            index += 1;
        }

        self.offline_len.store(self.offline.len(), Ordering::Relaxed);
    }

    fn push_offline(&mut self, batch: OutboundBatch) {
        if self.offline.len() >= self.max_offline {
            if let Some(dropped) = self.offline.pop_front() {
                // Records remain in the change log and go out with the next
                // sync session
                tracing::warn!(
                    batch_id = %dropped.id,
                    records = dropped.records.len(),
                    "Offline queue full, dropping oldest batch"
                );
            }
        }
        self.offline.push_back(batch);
        self.offline_len.store(self.offline.len(), Ordering::Relaxed);
    }
}

// ============================================================================
// Tests
// ============================================================================
