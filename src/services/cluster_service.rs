//! Cluster service - creation, lookup and destruction of clusters
//!
//! Leader election happens upstream; this service only enforces that the
//! leader exists and leads nothing else.

use std::sync::Arc;

use tracing::info;

use crate::db::clusters::{self, CreatedCluster, DeletedCluster};
use crate::db::{MessageCluster, ModerationDb};
use crate::error::StorageError;

use super::events::{EventBus, ModerationEvent};

/// Cluster service for the cluster store
pub struct ClusterService {
    db: Arc<ModerationDb>,
    events: Arc<EventBus>,
    system_actor_id: i64,
}

impl ClusterService {
    /// Create a new cluster service
    pub fn new(db: Arc<ModerationDb>, events: Arc<EventBus>, system_actor_id: i64) -> Self {
        Self {
            db,
            events,
            system_actor_id,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Get cluster by ID
    pub fn get(&self, cluster_id: i64) -> Result<Option<MessageCluster>, StorageError> {
        self.db.with_conn(|conn| clusters::get_cluster(conn, cluster_id))
    }

    /// Get the cluster an entity leads
    pub fn for_leader(&self, leader_entity_id: i64) -> Result<Option<MessageCluster>, StorageError> {
        self.db
            .with_conn(|conn| clusters::find_by_leader(conn, leader_entity_id))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Create a cluster led by `leader_entity_id`
    pub fn create(&self, leader_entity_id: i64) -> Result<CreatedCluster, StorageError> {
        let created = self.db.write("create_cluster", |conn| {
            clusters::create_cluster(conn, leader_entity_id, self.system_actor_id)
        })?;

        info!(cluster_id = created.cluster.id, leader_entity_id, "Cluster created");
        self.events.emit(ModerationEvent::ClusterCreated {
            cluster_id: created.cluster.id,
            leader_entity_id,
        });

        Ok(created)
    }

    /// Delete a cluster, clearing membership and its ledger
    pub fn delete(&self, cluster_id: i64) -> Result<DeletedCluster, StorageError> {
        let deleted = self
            .db
            .write("delete_cluster", |conn| clusters::delete_cluster(conn, cluster_id))?;

        self.events.emit(ModerationEvent::ClusterDeleted {
            cluster_id,
            cleared_members: deleted.cleared_members,
            deleted_ledger_rows: deleted.deleted_ledger_rows,
        });

        Ok(deleted)
    }

    /// Change a cluster's identifier; ledger rows and members follow
    pub fn renumber(&self, old_id: i64, new_id: i64) -> Result<MessageCluster, StorageError> {
        let cluster = self.db.write("renumber_cluster", |conn| {
            clusters::renumber_cluster(conn, old_id, new_id)
        })?;

        if old_id != new_id {
            self.events
                .emit(ModerationEvent::ClusterRenumbered { old_id, new_id });
        }

        Ok(cluster)
    }
}
