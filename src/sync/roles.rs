//! Role priority lookup
//!
//! Role assignment itself lives outside the sync engine. The engine only
//! asks for a priority number per (actor, warehouse) and uses it as a
//! tie-break input.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Unified role ranking used for every tie-break
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Editor,
    Viewer,
    Guest,
}

impl Role {
    pub fn weight(&self) -> i64 {
        match self {
            Role::Owner => 1000,
            Role::Admin => 850,
            Role::Editor => 700,
            Role::Viewer => 400,
            Role::Guest => 100,
        }
    }

    /// Parse a role name, mapping the access-control tier `master` onto
    /// `owner`
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "owner" | "master" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "editor" => Some(Role::Editor),
            "viewer" => Some(Role::Viewer),
            "guest" => Some(Role::Guest),
            _ => None,
        }
    }
}

/// Maps (actor, warehouse) to a tie-break priority
pub trait RolePriorityOracle: Send + Sync {
    /// `None` when the actor has no known role in the warehouse
    fn priority(&self, actor_id: &str, warehouse_id: &str) -> Option<i64>;
}

/// In-memory per-warehouse role map
#[derive(Debug, Default)]
pub struct WarehouseRoles {
    roles: RwLock<HashMap<(String, String), Role>>,
}

impl WarehouseRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, warehouse_id: &str, actor_id: &str, role: Role) {
        self.roles
            .write()
            .insert((warehouse_id.to_string(), actor_id.to_string()), role);
    }

    pub fn role_of(&self, actor_id: &str, warehouse_id: &str) -> Option<Role> {
        self.roles
            .read()
            .get(&(warehouse_id.to_string(), actor_id.to_string()))
            .copied()
    }
}

impl RolePriorityOracle for WarehouseRoles {
    fn priority(&self, actor_id: &str, warehouse_id: &str) -> Option<i64> {
        self.role_of(actor_id, warehouse_id).map(|r| r.weight())
    }
}
