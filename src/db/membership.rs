//! Cluster membership using Diesel
//!
//! Membership lives on the entity row (`entities.cluster_id`). The cluster's
//! `entity_count` is adjusted in the same transaction as the membership write.

use diesel::prelude::*;

use super::clusters::require_cluster;
use super::diesel_schema::{entities, message_clusters};
use super::models::{current_timestamp, MessageCluster};
use super::registry;
use crate::error::StorageError;

/// Outcome of removing an entity from its cluster
#[derive(Debug, Clone)]
pub struct RemovedMember {
    pub entity_id: i64,
    pub cluster: MessageCluster,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Cluster an entity belongs to, if any. `EntityNotFound` for unknown entities.
pub fn cluster_of(conn: &mut SqliteConnection, entity_id: i64) -> Result<Option<i64>, StorageError> {
    registry::require_entity(conn, entity_id).map(|e| e.cluster_id)
}

/// Member entity ids of a cluster, ascending
pub fn members_of(conn: &mut SqliteConnection, cluster_id: i64) -> Result<Vec<i64>, StorageError> {
    require_cluster(conn, cluster_id)?;
    entities::table
        .filter(entities::cluster_id.eq(cluster_id))
        .select(entities::id)
        .order(entities::id.asc())
        .load(conn)
        .map_err(|e| StorageError::query("Query failed", e))
}

/// Physical member count, independent of the cached `entity_count`
pub fn member_count(conn: &mut SqliteConnection, cluster_id: i64) -> Result<i64, StorageError> {
    entities::table
        .filter(entities::cluster_id.eq(cluster_id))
        .count()
        .get_result(conn)
        .map_err(|e| StorageError::query("Count query failed", e))
}

// ============================================================================
// Write Operations
// ============================================================================

/// Add an entity to a cluster and bump `entity_count`.
///
/// Re-adding an entity to the cluster it already belongs to is a no-op.
/// Membership in a different cluster is `AlreadyMember`.
pub fn add_member(
    conn: &mut SqliteConnection,
    entity_id: i64,
    cluster_id: i64,
) -> Result<MessageCluster, StorageError> {
    conn.transaction(|conn| {
        let entity = registry::require_entity(conn, entity_id)?;
        let cluster = require_cluster(conn, cluster_id)?;

        match entity.cluster_id {
            Some(current) if current == cluster_id => return Ok(cluster),
            Some(current) => {
                return Err(StorageError::AlreadyMember {
                    entity_id,
                    cluster_id: current,
                })
            }
            None => {}
        }

        let now = current_timestamp();
        let updated = diesel::update(
            entities::table
                .find(entity_id)
                .filter(entities::cluster_id.is_null()),
        )
        .set(entities::cluster_id.eq(cluster_id))
        .execute(conn)
        .map_err(|e| StorageError::query("Membership update failed", e))?;

        if updated == 0 {
            return Err(StorageError::Internal(format!(
                "Entity {} changed membership during add",
                entity_id
            )));
        }

        diesel::update(message_clusters::table.find(cluster_id))
            .set((
                message_clusters::entity_count.eq(message_clusters::entity_count + 1),
                message_clusters::updated_at.eq(&now),
            ))
            .execute(conn)
            .map_err(|e| StorageError::query("Counter update failed", e))?;

        require_cluster(conn, cluster_id)
    })
}

/// Remove an entity from its cluster and decrement `entity_count` (never
/// below zero).
pub fn remove_member(
    conn: &mut SqliteConnection,
    entity_id: i64,
) -> Result<RemovedMember, StorageError> {
    conn.transaction(|conn| {
        let entity = registry::require_entity(conn, entity_id)?;
        let cluster_id = entity.cluster_id.ok_or(StorageError::NotAMember(entity_id))?;

        diesel::update(entities::table.find(entity_id))
            .set(entities::cluster_id.eq(None::<i64>))
            .execute(conn)
            .map_err(|e| StorageError::query("Membership update failed", e))?;

        decrement_entity_count(conn, cluster_id)?;

        Ok(RemovedMember {
            entity_id,
            cluster: require_cluster(conn, cluster_id)?,
        })
    })
}

/// Decrement `entity_count`, floored at zero
pub(crate) fn decrement_entity_count(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> Result<(), StorageError> {
    let now = current_timestamp();
    diesel::update(
        message_clusters::table
            .find(cluster_id)
            .filter(message_clusters::entity_count.gt(0)),
    )
    .set((
        message_clusters::entity_count.eq(message_clusters::entity_count - 1),
        message_clusters::updated_at.eq(&now),
    ))
    .execute(conn)
    .map_err(|e| StorageError::query("Counter update failed", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{clusters, test_conn};

    fn setup(conn: &mut SqliteConnection) -> i64 {
        for id in [1, 2, 3, 4] {
            registry::register_entity(conn, id).unwrap();
        }
        clusters::create_cluster(conn, 1, 0).unwrap().cluster.id
    }

    #[test]
    fn test_add_members_counts() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);

        add_member(&mut conn, 2, cluster_id).unwrap();
        let cluster = add_member(&mut conn, 3, cluster_id).unwrap();
        assert_eq!(cluster.entity_count, 2);
        assert_eq!(members_of(&mut conn, cluster_id).unwrap(), vec![2, 3]);
        assert_eq!(member_count(&mut conn, cluster_id).unwrap(), 2);
        assert_eq!(cluster_of(&mut conn, 2).unwrap(), Some(cluster_id));
    }

    #[test]
    fn test_readd_same_cluster_is_noop() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);

        add_member(&mut conn, 2, cluster_id).unwrap();
        let cluster = add_member(&mut conn, 2, cluster_id).unwrap();
        assert_eq!(cluster.entity_count, 1);
    }

    #[test]
    fn test_add_member_of_other_cluster_conflicts() {
        let mut conn = test_conn();
        let first = setup(&mut conn);
        let second = clusters::create_cluster(&mut conn, 4, 0).unwrap().cluster.id;

        add_member(&mut conn, 2, first).unwrap();
        let err = add_member(&mut conn, 2, second).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyMember { entity_id: 2, cluster_id } if cluster_id == first));
        assert_eq!(clusters::require_cluster(&mut conn, second).unwrap().entity_count, 0);
    }

    #[test]
    fn test_add_member_missing_refs() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);

        assert!(matches!(
            add_member(&mut conn, 99, cluster_id),
            Err(StorageError::EntityNotFound(99))
        ));
        assert!(matches!(
            add_member(&mut conn, 2, 999),
            Err(StorageError::ClusterNotFound(999))
        ));
        assert_eq!(cluster_of(&mut conn, 2).unwrap(), None);
    }

    #[test]
    fn test_remove_member() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);
        add_member(&mut conn, 2, cluster_id).unwrap();
        add_member(&mut conn, 3, cluster_id).unwrap();

        let removed = remove_member(&mut conn, 2).unwrap();
        assert_eq!(removed.cluster.id, cluster_id);
        assert_eq!(removed.cluster.entity_count, 1);
        assert_eq!(cluster_of(&mut conn, 2).unwrap(), None);

        assert!(matches!(
            remove_member(&mut conn, 2),
            Err(StorageError::NotAMember(2))
        ));
    }

    #[test]
    fn test_decrement_floors_at_zero() {
        let mut conn = test_conn();
        let cluster_id = setup(&mut conn);

        decrement_entity_count(&mut conn, cluster_id).unwrap();
        assert_eq!(clusters::require_cluster(&mut conn, cluster_id).unwrap().entity_count, 0);
    }
}
