//! Status ledger using Diesel
//!
//! Append-only: rows are never updated. Each append also refreshes the
//! cluster's cached `latest_status` / `latest_status_at` so the cache always
//! mirrors the newest ledger row.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::clusters::require_cluster;
use super::diesel_schema::{message_cluster_statuses, message_clusters};
use super::models::{current_timestamp, ClusterStatus, MessageCluster, MessageClusterStatus, NewMessageClusterStatus};
use super::registry;
use crate::error::StorageError;

// ============================================================================
// Query Types
// ============================================================================

/// Keyset position inside a cluster's history (newest first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    pub created_at: String,
    pub id: i64,
}

impl HistoryCursor {
    pub fn after(entry: &MessageClusterStatus) -> Self {
        Self {
            created_at: entry.created_at.clone(),
            id: entry.id,
        }
    }
}

/// Ledger entry together with the refreshed cluster
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub entry: MessageClusterStatus,
    pub cluster: MessageCluster,
}

// ============================================================================
// Read Operations
// ============================================================================

/// One page of a cluster's history, newest first. Ties on `created_at` are
/// broken by descending id.
pub fn history_page(
    conn: &mut SqliteConnection,
    cluster_id: i64,
    after: Option<&HistoryCursor>,
    limit: i64,
) -> Result<Vec<MessageClusterStatus>, StorageError> {
    let mut query = message_cluster_statuses::table
        .filter(message_cluster_statuses::message_cluster_id.eq(cluster_id))
        .select(MessageClusterStatus::as_select())
        .into_boxed();

    if let Some(cursor) = after {
        query = query.filter(
            message_cluster_statuses::created_at
                .lt(cursor.created_at.clone())
                .or(message_cluster_statuses::created_at
                    .eq(cursor.created_at.clone())
                    .and(message_cluster_statuses::id.lt(cursor.id))),
        );
    }

    query
        .order((
            message_cluster_statuses::created_at.desc(),
            message_cluster_statuses::id.desc(),
        ))
        .limit(limit)
        .load(conn)
        .map_err(|e| StorageError::query("Query failed", e))
}

/// Newest ledger row for a cluster
pub fn latest_entry(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> Result<Option<MessageClusterStatus>, StorageError> {
    Ok(history_page(conn, cluster_id, None, 1)?.into_iter().next())
}

/// Number of ledger rows attributed to an actor
pub fn count_for_actor(conn: &mut SqliteConnection, actor_id: i64) -> Result<i64, StorageError> {
    message_cluster_statuses::table
        .filter(message_cluster_statuses::actor_id.eq(actor_id))
        .count()
        .get_result(conn)
        .map_err(|e| StorageError::query("Count query failed", e))
}

// ============================================================================
// Write Operations
// ============================================================================

/// Record a status decision by `actor_id`.
///
/// The entry timestamp never runs behind the cluster's current
/// `latest_status_at`, so the cached status always matches the newest row.
pub fn record_status_change(
    conn: &mut SqliteConnection,
    cluster_id: i64,
    status: ClusterStatus,
    actor_id: i64,
) -> Result<StatusChange, StorageError> {
    conn.transaction(|conn| {
        let cluster = require_cluster(conn, cluster_id)?;
        if !registry::actor_exists(conn, actor_id)? {
            return Err(StorageError::ActorNotFound(actor_id));
        }

        let now = std::cmp::max(current_timestamp(), cluster.latest_status_at);
        let entry = append_entry(conn, cluster_id, status, actor_id, &now)?;

        debug!(cluster_id, actor_id, status = %status, "Status recorded");

        Ok(StatusChange {
            entry,
            cluster: require_cluster(conn, cluster_id)?,
        })
    })
}

/// Insert a ledger row and mirror it onto the cluster
pub(crate) fn append_entry(
    conn: &mut SqliteConnection,
    cluster_id: i64,
    status: ClusterStatus,
    actor_id: i64,
    created_at: &str,
) -> Result<MessageClusterStatus, StorageError> {
    let new_entry = NewMessageClusterStatus {
        message_cluster_id: cluster_id,
        status,
        actor_id,
        created_at,
        updated_at: created_at,
    };

    diesel::insert_into(message_cluster_statuses::table)
        .values(&new_entry)
        .execute(conn)
        .map_err(|e| StorageError::query("Insert failed", e))?;

    let id: i64 = diesel::select(diesel::dsl::sql::<diesel::sql_types::BigInt>("last_insert_rowid()"))
        .get_result(conn)
        .map_err(|e| StorageError::query("Failed to read ledger id", e))?;

    diesel::update(message_clusters::table.find(cluster_id))
        .set((
            message_clusters::latest_status.eq(status),
            message_clusters::latest_status_at.eq(created_at),
            message_clusters::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| StorageError::query("Status cache update failed", e))?;

    message_cluster_statuses::table
        .find(id)
        .select(MessageClusterStatus::as_select())
        .first(conn)
        .map_err(|e| StorageError::query("Failed to retrieve ledger entry", e))
}

/// Delete every ledger row of a cluster (cluster cascade)
pub(crate) fn delete_for_cluster(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> Result<usize, StorageError> {
    diesel::delete(
        message_cluster_statuses::table
            .filter(message_cluster_statuses::message_cluster_id.eq(cluster_id)),
    )
    .execute(conn)
    .map_err(|e| StorageError::query("Ledger delete failed", e))
}

/// Repoint ledger rows from one actor id to another (actor rename)
pub(crate) fn reassign_actor(
    conn: &mut SqliteConnection,
    old_actor_id: i64,
    new_actor_id: i64,
) -> Result<usize, StorageError> {
    diesel::update(
        message_cluster_statuses::table.filter(message_cluster_statuses::actor_id.eq(old_actor_id)),
    )
    .set((
        message_cluster_statuses::actor_id.eq(new_actor_id),
        message_cluster_statuses::updated_at.eq(current_timestamp()),
    ))
    .execute(conn)
    .map_err(|e| StorageError::query("Ledger update failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{clusters, test_conn};

    fn setup(conn: &mut SqliteConnection) -> i64 {
        registry::register_entity(conn, 1).unwrap();
        registry::register_actor(conn, 10).unwrap();
        clusters::create_cluster(conn, 1, 0).unwrap().cluster.id
    }

    #[test]
    fn test_record_status_updates_cache() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);

        let change = record_status_change(&mut conn, cluster_id, ClusterStatus::Blacklisted, 10).unwrap();
        assert_eq!(change.entry.status, ClusterStatus::Blacklisted);
        assert_eq!(change.entry.actor_id, 10);
        assert_eq!(change.cluster.latest_status, ClusterStatus::Blacklisted);
        assert_eq!(change.cluster.latest_status_at, change.entry.created_at);
        assert_eq!(change.entry.updated_at, change.entry.created_at);
    }

    #[test]
    fn test_reassign_actor_touches_updated_at_only() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);
        let entry = record_status_change(&mut conn, cluster_id, ClusterStatus::Hidden, 10).unwrap().entry;
        registry::register_actor(&mut conn, 11).unwrap();

        assert_eq!(reassign_actor(&mut conn, 10, 11).unwrap(), 1);

        let row: MessageClusterStatus = message_cluster_statuses::table
            .find(entry.id)
            .select(MessageClusterStatus::as_select())
            .first(&mut conn)
            .unwrap();
        assert_eq!(row.actor_id, 11);
        assert_eq!(row.status, entry.status);
        assert_eq!(row.created_at, entry.created_at);
        assert!(!row.updated_at.is_empty());
    }

    #[test]
    fn test_record_status_missing_refs() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);

        assert!(matches!(
            record_status_change(&mut conn, 999, ClusterStatus::Hidden, 10),
            Err(StorageError::ClusterNotFound(999))
        ));
        assert!(matches!(
            record_status_change(&mut conn, cluster_id, ClusterStatus::Hidden, 77),
            Err(StorageError::ActorNotFound(77))
        ));
        assert_eq!(history_page(&mut conn, cluster_id, None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_history_newest_first_and_paged() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);

        for status in [ClusterStatus::Blacklisted, ClusterStatus::Whitelisted, ClusterStatus::Hidden] {
            record_status_change(&mut conn, cluster_id, status, 10).unwrap();
        }

        let all = history_page(&mut conn, cluster_id, None, 10).unwrap();
        let statuses: Vec<_> = all.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                ClusterStatus::Hidden,
                ClusterStatus::Whitelisted,
                ClusterStatus::Blacklisted,
                ClusterStatus::Unclassified,
            ]
        );

        let first = history_page(&mut conn, cluster_id, None, 2).unwrap();
        let cursor = HistoryCursor::after(first.last().unwrap());
        let second = history_page(&mut conn, cluster_id, Some(&cursor), 2).unwrap();
        let paged: Vec<_> = first.into_iter().chain(second).collect();
        assert_eq!(paged, all);
    }

    #[test]
    fn test_timestamps_never_run_backwards() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);

        // Push the cached timestamp into the future; the next entry must not
        // sort before it.
        diesel::update(message_clusters::table.find(cluster_id))
            .set(message_clusters::latest_status_at.eq("2999-01-01T00:00:00.000000Z"))
            .execute(&mut conn)
            .unwrap();

        let change = record_status_change(&mut conn, cluster_id, ClusterStatus::Hidden, 10).unwrap();
        assert_eq!(change.entry.created_at, "2999-01-01T00:00:00.000000Z");
        assert_eq!(latest_entry(&mut conn, cluster_id).unwrap().unwrap().id, change.entry.id);
    }

    #[test]
    fn test_count_for_actor() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);
        assert_eq!(count_for_actor(&mut conn, 10).unwrap(), 0);
        record_status_change(&mut conn, cluster_id, ClusterStatus::Hidden, 10).unwrap();
        assert_eq!(count_for_actor(&mut conn, 10).unwrap(), 1);
    }
}
