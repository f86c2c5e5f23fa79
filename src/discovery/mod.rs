//! Peer discovery
//!
//! Provides:
//! - The device registry of known peers
//! - Multicast announce/listen
//! - HTTP subnet probing as a fallback

mod multicast;
mod probe;
mod registry;
mod types;

pub use multicast::{bind_listener, listen, local_announcement, start_announce_task};
pub use probe::{subnet_candidates, SubnetProber};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use types::{Announcement, DeviceInfo, PeerDevice};
