//! Local catalog storage
//!
//! The sync engine's view of the local data store: current entity state,
//! an append-only change log with merge status, conflicts, per-peer
//! checkpoints and access requests, all in SQLite.

mod store;
mod types;

pub use store::{ChangeStatus, EntityEffect, InventoryRepository, MergeCommit, NewAccessRequest};
pub use types::{payload_is_public, Entity, EntityType, WarehouseSummary};
