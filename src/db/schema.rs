//! Database schema initialization

use sqlx::SqlitePool;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Current state of every catalog entity (tombstoned rather than removed)
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    warehouse_id TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT 'null',
    deleted INTEGER NOT NULL DEFAULT 0,
    network_visible INTEGER NOT NULL DEFAULT 0,
    last_change_id TEXT NOT NULL,
    last_origin_device_id TEXT NOT NULL,
    last_local_seq INTEGER NOT NULL,
    last_timestamp_us INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_warehouse ON entities(warehouse_id);
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);

-- Every change record this device has created or received
CREATE TABLE IF NOT EXISTS change_log (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT 'null',
    actor_id TEXT NOT NULL,
    actor_role_weight INTEGER NOT NULL,
    origin_device_id TEXT NOT NULL,
    warehouse_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL,
    local_seq INTEGER NOT NULL,
    base_change_id TEXT,
    status TEXT NOT NULL,
    logged_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_log_order ON change_log(timestamp_us, local_seq);
CREATE INDEX IF NOT EXISTS idx_change_log_entity ON change_log(entity_id);
CREATE INDEX IF NOT EXISTS idx_change_log_warehouse ON change_log(warehouse_id);
CREATE INDEX IF NOT EXISTS idx_change_log_logged ON change_log(logged_us);

-- Unresolved and resolved merge conflicts
CREATE TABLE IF NOT EXISTS conflicts (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    local_json TEXT NOT NULL,
    remote_json TEXT NOT NULL,
    strategy TEXT NOT NULL,
    outcome TEXT NOT NULL,
    requires_manual_review INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_conflicts_outcome ON conflicts(outcome);

-- Per-peer sync boundaries: pulls on the peer's clock, pushes on ours
CREATE TABLE IF NOT EXISTS sync_checkpoints (
    peer_id TEXT PRIMARY KEY,
    last_exchanged_us INTEGER NOT NULL,
    last_pushed_us INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

-- Requests from other devices for access to a warehouse
CREATE TABLE IF NOT EXISTS access_requests (
    id TEXT PRIMARY KEY,
    warehouse_id TEXT NOT NULL,
    requester_id TEXT NOT NULL,
    requester_name TEXT NOT NULL,
    requester_ip TEXT,
    message TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_requests_warehouse ON access_requests(warehouse_id, requester_id);

-- Small persisted counters (local sequence number)
CREATE TABLE IF NOT EXISTS device_state (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;
