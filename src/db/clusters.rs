//! Cluster store operations using Diesel
//!
//! Creation elects a leader and writes the first ledger entry; deletion
//! clears membership and removes the ledger in the same transaction.
//! Leaders are never reassigned: a cluster lives exactly as long as its
//! leader entity (or until moderation tooling deletes it).

use diesel::prelude::*;
use serde::Serialize;
use tracing::debug;

use super::diesel_schema::{entities, message_cluster_statuses, message_clusters};
use super::models::{current_timestamp, ClusterStatus, MessageCluster, MessageClusterStatus, NewMessageCluster};
use super::{ledger, registry};
use crate::error::StorageError;

/// Result of creating a cluster
#[derive(Debug, Clone, Serialize)]
pub struct CreatedCluster {
    pub cluster: MessageCluster,
    pub initial_status: MessageClusterStatus,
}

/// Result of deleting a cluster and everything that hangs off it
#[derive(Debug, Clone, Serialize)]
pub struct DeletedCluster {
    pub cluster: MessageCluster,
    pub cleared_members: usize,
    pub deleted_ledger_rows: usize,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Get cluster by ID
pub fn get_cluster(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> Result<Option<MessageCluster>, StorageError> {
    message_clusters::table
        .find(cluster_id)
        .select(MessageCluster::as_select())
        .first(conn)
        .optional()
        .map_err(|e| StorageError::query("Query failed", e))
}

/// Get cluster by ID, failing with `ClusterNotFound`
pub fn require_cluster(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> Result<MessageCluster, StorageError> {
    get_cluster(conn, cluster_id)?.ok_or(StorageError::ClusterNotFound(cluster_id))
}

/// Get the cluster led by an entity
pub fn find_by_leader(
    conn: &mut SqliteConnection,
    leader_entity_id: i64,
) -> Result<Option<MessageCluster>, StorageError> {
    message_clusters::table
        .filter(message_clusters::leader_entity_id.eq(leader_entity_id))
        .select(MessageCluster::as_select())
        .first(conn)
        .optional()
        .map_err(|e| StorageError::query("Query failed", e))
}

/// Total number of clusters
pub fn cluster_count(conn: &mut SqliteConnection) -> Result<i64, StorageError> {
    message_clusters::table
        .count()
        .get_result(conn)
        .map_err(|e| StorageError::query("Count query failed", e))
}

// ============================================================================
// Write Operations
// ============================================================================

/// Create a cluster led by `leader_entity_id`.
///
/// The initial `unclassified` ledger entry is attributed to `system_actor_id`,
/// which is provisioned in the actor directory if missing.
pub fn create_cluster(
    conn: &mut SqliteConnection,
    leader_entity_id: i64,
    system_actor_id: i64,
) -> Result<CreatedCluster, StorageError> {
    conn.transaction(|conn| {
        if !registry::entity_exists(conn, leader_entity_id)? {
            return Err(StorageError::LeaderNotFound(leader_entity_id));
        }

        if let Some(existing) = find_by_leader(conn, leader_entity_id)? {
            return Err(StorageError::DuplicateLeader {
                entity_id: leader_entity_id,
                cluster_id: existing.id,
            });
        }

        let now = current_timestamp();
        let new_cluster = NewMessageCluster {
            leader_entity_id,
            entity_count: 0,
            report_count: 0,
            latest_status: ClusterStatus::Unclassified,
            latest_status_at: &now,
            created_at: &now,
            updated_at: &now,
        };

        diesel::insert_into(message_clusters::table)
            .values(&new_cluster)
            .execute(conn)
            .map_err(|e| StorageError::query("Insert failed", e))?;

        let cluster = find_by_leader(conn, leader_entity_id)?
            .ok_or_else(|| StorageError::Internal("Failed to retrieve created cluster".into()))?;

        registry::ensure_actor(conn, system_actor_id)?;
        let initial_status = ledger::append_entry(
            conn,
            cluster.id,
            ClusterStatus::Unclassified,
            system_actor_id,
            &now,
        )?;

        debug!(cluster_id = cluster.id, leader_entity_id, "Cluster created");

        Ok(CreatedCluster {
            cluster: require_cluster(conn, cluster.id)?,
            initial_status,
        })
    })
}

/// Delete a cluster: clear `cluster_id` on every member, delete its ledger
/// rows, then the cluster itself. All or nothing.
pub fn delete_cluster(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> Result<DeletedCluster, StorageError> {
    conn.transaction(|conn| {
        let cluster = require_cluster(conn, cluster_id)?;

        let cleared_members = diesel::update(entities::table.filter(entities::cluster_id.eq(cluster_id)))
            .set(entities::cluster_id.eq(None::<i64>))
            .execute(conn)
            .map_err(|e| StorageError::query("Membership clear failed", e))?;

        let deleted_ledger_rows = ledger::delete_for_cluster(conn, cluster_id)?;

        diesel::delete(message_clusters::table.find(cluster_id))
            .execute(conn)
            .map_err(|e| StorageError::query("Delete failed", e))?;

        debug!(cluster_id, cleared_members, deleted_ledger_rows, "Cluster deleted");

        Ok(DeletedCluster {
            cluster,
            cleared_members,
            deleted_ledger_rows,
        })
    })
}

/// Change a cluster's identifier, carrying ledger rows and members along.
pub fn renumber_cluster(
    conn: &mut SqliteConnection,
    old_id: i64,
    new_id: i64,
) -> Result<MessageCluster, StorageError> {
    conn.transaction(|conn| {
        require_cluster(conn, old_id)?;
        if old_id == new_id {
            return require_cluster(conn, old_id);
        }
        if get_cluster(conn, new_id)?.is_some() {
            return Err(StorageError::IdentifierTaken(format!("cluster {}", new_id)));
        }

        let now = current_timestamp();
        diesel::update(message_clusters::table.find(old_id))
            .set((
                message_clusters::id.eq(new_id),
                message_clusters::updated_at.eq(&now),
            ))
            .execute(conn)
            .map_err(|e| StorageError::query("Update failed", e))?;

        diesel::update(
            message_cluster_statuses::table
                .filter(message_cluster_statuses::message_cluster_id.eq(old_id)),
        )
        .set(message_cluster_statuses::message_cluster_id.eq(new_id))
        .execute(conn)
        .map_err(|e| StorageError::query("Ledger update failed", e))?;

        diesel::update(entities::table.filter(entities::cluster_id.eq(old_id)))
            .set(entities::cluster_id.eq(new_id))
            .execute(conn)
            .map_err(|e| StorageError::query("Membership update failed", e))?;

        require_cluster(conn, new_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{membership, test_conn};

    const SYSTEM: i64 = 0;

    fn seed_entities(conn: &mut SqliteConnection, ids: &[i64]) {
        for id in ids {
            registry::register_entity(conn, *id).unwrap();
        }
    }

    #[test]
    fn test_create_cluster_defaults() {
        let mut conn = test_conn();
        seed_entities(&mut conn, &[1]);

        let created = create_cluster(&mut conn, 1, SYSTEM).unwrap();
        let cluster = created.cluster;
        assert_eq!(cluster.leader_entity_id, 1);
        assert_eq!(cluster.entity_count, 0);
        assert_eq!(cluster.report_count, 0);
        assert_eq!(cluster.last_reported_at, None);
        assert_eq!(cluster.latest_status, ClusterStatus::Unclassified);
        assert_eq!(cluster.latest_status_at, cluster.created_at);

        assert_eq!(created.initial_status.status, ClusterStatus::Unclassified);
        assert_eq!(created.initial_status.actor_id, SYSTEM);
        assert_eq!(created.initial_status.created_at, cluster.latest_status_at);
        assert!(registry::actor_exists(&mut conn, SYSTEM).unwrap());
    }

    #[test]
    fn test_create_cluster_missing_leader() {
        let mut conn = test_conn();
        let err = create_cluster(&mut conn, 42, SYSTEM).unwrap_err();
        assert!(matches!(err, StorageError::LeaderNotFound(42)));
        assert_eq!(cluster_count(&mut conn).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_leader_rejected() {
        let mut conn = test_conn();
        seed_entities(&mut conn, &[1]);

        let first = create_cluster(&mut conn, 1, SYSTEM).unwrap();
        let err = create_cluster(&mut conn, 1, SYSTEM).unwrap_err();
        match err {
            StorageError::DuplicateLeader { entity_id, cluster_id } => {
                assert_eq!(entity_id, 1);
                assert_eq!(cluster_id, first.cluster.id);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(cluster_count(&mut conn).unwrap(), 1);
    }

    #[test]
    fn test_delete_cluster_clears_members_and_ledger() {
        let mut conn = test_conn();
        seed_entities(&mut conn, &[1, 2, 3]);
        let cluster = create_cluster(&mut conn, 1, SYSTEM).unwrap().cluster;
        membership::add_member(&mut conn, 2, cluster.id).unwrap();
        membership::add_member(&mut conn, 3, cluster.id).unwrap();

        let deleted = delete_cluster(&mut conn, cluster.id).unwrap();
        assert_eq!(deleted.cleared_members, 2);
        assert_eq!(deleted.deleted_ledger_rows, 1);

        assert!(get_cluster(&mut conn, cluster.id).unwrap().is_none());
        assert_eq!(membership::cluster_of(&mut conn, 2).unwrap(), None);
        assert_eq!(membership::cluster_of(&mut conn, 3).unwrap(), None);
        assert!(registry::entity_exists(&mut conn, 2).unwrap());
        assert!(ledger::latest_entry(&mut conn, cluster.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_cluster() {
        let mut conn = test_conn();
        assert!(matches!(
            delete_cluster(&mut conn, 7),
            Err(StorageError::ClusterNotFound(7))
        ));
    }

    #[test]
    fn test_renumber_cluster_carries_references() {
        let mut conn = test_conn();
        seed_entities(&mut conn, &[1, 2]);
        let cluster = create_cluster(&mut conn, 1, SYSTEM).unwrap().cluster;
        membership::add_member(&mut conn, 2, cluster.id).unwrap();

        let renumbered = renumber_cluster(&mut conn, cluster.id, 500).unwrap();
        assert_eq!(renumbered.id, 500);
        assert_eq!(renumbered.entity_count, 1);
        assert_eq!(membership::cluster_of(&mut conn, 2).unwrap(), Some(500));
        assert_eq!(ledger::latest_entry(&mut conn, 500).unwrap().unwrap().message_cluster_id, 500);
        assert!(get_cluster(&mut conn, cluster.id).unwrap().is_none());
    }

    #[test]
    fn test_renumber_onto_existing_cluster_fails() {
        let mut conn = test_conn();
        seed_entities(&mut conn, &[1, 2]);
        let a = create_cluster(&mut conn, 1, SYSTEM).unwrap().cluster;
        let b = create_cluster(&mut conn, 2, SYSTEM).unwrap().cluster;
        assert!(matches!(
            renumber_cluster(&mut conn, a.id, b.id),
            Err(StorageError::IdentifierTaken(_))
        ));
    }
}
