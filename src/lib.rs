//! StockMesh
//!
//! Serverless LAN synchronization for hierarchical inventory catalogs
//! (warehouse → room → container → item). Every device is a full peer:
//! it discovers others over multicast or HTTP probing, merges their change
//! records idempotently and pushes its own edits in debounced batches.

pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod inventory;
pub mod node;
pub mod routes;
pub mod state;
pub mod stats;
pub mod sync;

pub use config::Config;
pub use node::Node;
pub use state::AppState;
