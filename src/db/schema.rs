//! Database schema definitions
//!
//! Referential rules (cascade on leader delete, set-null on cluster delete,
//! restrict on actor delete) are not declared as SQL foreign keys. They are
//! enforced by the repository functions inside the same transaction as the
//! change that triggers them.

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

pub const INDEX_LATEST_STATUS_REPORT_COUNT_ID: &str =
    "message_clusters_latest_status_report_count_id_idx";
pub const INDEX_LATEST_STATUS_ENTITY_COUNT_ID: &str =
    "message_clusters_latest_status_entity_count_id_idx";
pub const INDEX_MESSAGE_CLUSTER_ID_CREATED_AT: &str =
    "message_cluster_statuses_message_cluster_id_created_at_idx";
pub const INDEX_ACTOR_ID: &str = "message_cluster_statuses_actor_id_idx";
pub const INDEX_CLUSTER_ID: &str = "entities_cluster_id_idx";

/// Indexes serving the ranked moderation queries
pub const RANKING_INDEXES: [&str; 2] = [
    INDEX_LATEST_STATUS_REPORT_COUNT_ID,
    INDEX_LATEST_STATUS_ENTITY_COUNT_ID,
];

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.immediate_transaction(|conn| {
            create_tables(conn)?;
            set_schema_version(conn, SCHEMA_VERSION)
        })?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    ensure_indexes(conn)
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, StorageError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .map_err(|e| StorageError::query("Failed to create schema_version table", e))?;

    let row: Option<VersionRow> = diesel::sql_query("SELECT version FROM schema_version LIMIT 1")
        .get_result(conn)
        .optional()
        .map_err(|e| StorageError::query("Failed to read schema_version", e))?;

    Ok(row.map(|r| r.version).unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), StorageError> {
    diesel::sql_query("DELETE FROM schema_version")
        .execute(conn)
        .map_err(|e| StorageError::query("Failed to clear schema_version", e))?;
    diesel::sql_query("INSERT INTO schema_version (version) VALUES (?)")
        .bind::<Integer, _>(version)
        .execute(conn)
        .map_err(|e| StorageError::query("Failed to set schema_version", e))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    conn.batch_execute(REGISTRY_SCHEMA)
        .map_err(|e| StorageError::query("Failed to create registry tables", e))?;

    conn.batch_execute(CLUSTERS_SCHEMA)
        .map_err(|e| StorageError::query("Failed to create cluster tables", e))?;

    Ok(())
}

/// Create every lookup index that is missing. Safe to run on a live database.
pub fn ensure_indexes(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    conn.batch_execute(INDEXES_SCHEMA)
        .map_err(|e| StorageError::query("Failed to create indexes", e))
}

/// Migrate schema from older version
fn migrate_schema(conn: &mut SqliteConnection, from_version: i32) -> Result<(), StorageError> {
    match from_version {
        // 1 -> 2 goes here once the layout changes
        _ => {}
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Collaborator tables: the entity registry and the actor directory.
/// Only the columns the cluster engine reads or writes are declared.
const REGISTRY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY NOT NULL,
    cluster_id INTEGER,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

/// Clusters and the append-only status ledger
const CLUSTERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS message_clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    -- one cluster per leader, one leader per cluster
    leader_entity_id INTEGER NOT NULL UNIQUE,
    entity_count INTEGER NOT NULL DEFAULT 0 CHECK (entity_count >= 0),
    report_count INTEGER NOT NULL DEFAULT 0 CHECK (report_count >= 0),
    last_reported_at TEXT,
    latest_status TEXT NOT NULL DEFAULT 'unclassified'
        CHECK (latest_status IN ('blacklisted', 'whitelisted', 'unclassified', 'hidden')),
    latest_status_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS message_cluster_statuses (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    message_cluster_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'unclassified'
        CHECK (status IN ('blacklisted', 'whitelisted', 'unclassified', 'hidden')),
    actor_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Lookup paths:
/// - clusters by status ordered by report_count / entity_count desc, id tiebreak
/// - ledger rows by cluster ordered by created_at desc
/// - ledger rows by actor (restrict check on actor delete)
/// - entities by cluster
const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS message_clusters_latest_status_report_count_id_idx
    ON message_clusters(latest_status, report_count DESC, id);
CREATE INDEX IF NOT EXISTS message_clusters_latest_status_entity_count_id_idx
    ON message_clusters(latest_status, entity_count DESC, id);
CREATE INDEX IF NOT EXISTS message_cluster_statuses_message_cluster_id_created_at_idx
    ON message_cluster_statuses(message_cluster_id, created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS message_cluster_statuses_actor_id_idx
    ON message_cluster_statuses(actor_id);
CREATE INDEX IF NOT EXISTS entities_cluster_id_idx
    ON entities(cluster_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        init_schema(&mut conn).unwrap();
        assert_eq!(get_schema_version(&mut conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_status_check_constraint() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();

        let result = conn.batch_execute(
            "INSERT INTO message_clusters (leader_entity_id, latest_status, latest_status_at, created_at, updated_at) \
             VALUES (1, 'spam', 'x', 'x', 'x')",
        );
        assert!(result.is_err());
    }
}
