//! Catalog entity types
//!
//! The catalog is a four-level hierarchy: warehouse → room → container → item.
//! Entity contents are opaque JSON; only the fields the sync engine needs
//! (ids, warehouse scope, visibility, last change) are modelled here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Level of an entity in the catalog hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Warehouse,
    Room,
    Container,
    Item,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Warehouse => "warehouse",
            EntityType::Room => "room",
            EntityType::Container => "container",
            EntityType::Item => "item",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warehouse" => Some(EntityType::Warehouse),
            "room" => Some(EntityType::Room),
            "container" => Some(EntityType::Container),
            "item" => Some(EntityType::Item),
            _ => None,
        }
    }

    /// Collection name used by the push endpoints (`POST /rooms` etc.)
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Warehouse => "warehouses",
            EntityType::Room => "rooms",
            EntityType::Container => "containers",
            EntityType::Item => "items",
        }
    }
}

/// Current local state of one catalog entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    pub warehouse_id: String,
    pub data: Value,
    /// Tombstone; deleted entities keep their row so late edits can be detected
    pub deleted: bool,
    /// Only meaningful for warehouses: listed by `GET /warehouses` and
    /// replicated to peers
    pub network_visible: bool,
    pub last_change_id: String,
    pub last_origin_device_id: String,
    pub last_local_seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// Public view of a warehouse for `GET /warehouses`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

impl From<Entity> for WarehouseSummary {
    fn from(entity: Entity) -> Self {
        let name = entity
            .data
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        WarehouseSummary {
            id: entity.id,
            name,
            data: entity.data,
            updated_at: entity.updated_at,
        }
    }
}

/// Whether a warehouse payload opts into network visibility
pub fn payload_is_public(payload: &Value) -> bool {
    ["public", "isPublic", "networkVisible"]
        .iter()
        .filter_map(|key| payload.get(*key))
        .any(|v| v.as_bool().unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        assert_eq!(EntityType::Warehouse.collection(), "warehouses");
        assert_eq!(EntityType::Container.collection(), "containers");
        assert_eq!(EntityType::parse("room"), Some(EntityType::Room));
        assert_eq!(EntityType::parse("shelf"), None);
    }

    #[test]
    fn test_hierarchy_order() {
        assert!(EntityType::Warehouse < EntityType::Room);
        assert!(EntityType::Container < EntityType::Item);
    }

    #[test]
    fn test_public_flag_variants() {
        assert!(payload_is_public(&serde_json::json!({"isPublic": true})));
        assert!(payload_is_public(&serde_json::json!({"public": true, "name": "North"})));
        assert!(!payload_is_public(&serde_json::json!({"public": "yes"})));
        assert!(!payload_is_public(&serde_json::json!({"name": "Private"})));
    }
}
