//! Peer-to-peer catalog synchronization
//!
//! Provides:
//! - Change records as the unit of replication
//! - A single idempotent merge path for local and remote records
//! - Role-weighted conflict resolution with manual review for deletions
//! - Debounced outbound batching with an offline queue
//! - Pull/push sync sessions with per-peer checkpoints
//!
//! # Sync Protocol
//!
//! 1. Client checks `GET /sync/status` on the peer
//! 2. Client pulls with `POST /sync`, sending its checkpoint for that peer
//! 3. Client merges the pulled records in `(timestamp, localSeq)` order
//! 4. Client pushes its own records to `/warehouses`, `/rooms`,
//!    `/containers` and `/items`, parents first
//! 5. Client advances the checkpoint
//!
//! # Conflict Resolution
//!
//! - Records that build on the entity's latest change apply directly
//! - Concurrent edits: higher role weight wins, then the later timestamp
//! - Deletion against a concurrent edit is parked for manual review
//! - Concurrent creations of different entities both stand

mod batcher;
mod checkpoint;
mod client;
mod conflict;
mod local;
mod merge;
mod roles;
mod types;

pub use batcher::{BatchSink, BatcherHandle, ChangeBatcher, DebounceState, Delivery, OutboundBatch};
pub use checkpoint::{CheckpointBook, SyncCheckpoint};
pub use client::{SessionSummary, SyncClient};
pub use conflict::{conflict_id, ConflictResolver, ConflictWinner, Resolution};
pub use local::{new_entity_id, LocalChanges, LocalMutation};
pub use merge::{MergeReport, Merger};
pub use roles::{Role, RolePriorityOracle, WarehouseRoles};
pub use types::{
    ChangeAction, ChangeRecord, ConflictChoice, ConflictEntry, ConflictOutcome, MergeOutcome,
    PushRequest, PushResponse, RecordResult, ResolutionStrategy, SyncData, SyncRequest,
    SyncResponse, SyncStatistics, SyncStatusResponse,
};
