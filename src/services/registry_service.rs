//! Registry service - entity and actor identity changes
//!
//! These are the hooks the entity registry and the actor directory call when
//! an identity is created, deleted or renamed. Each one applies the
//! cluster-side consequences in the same transaction.

use std::sync::Arc;

use tracing::info;

use crate::db::models::Entity;
use crate::db::registry::{self, EntityDeletion};
use crate::db::ModerationDb;
use crate::error::StorageError;

use super::events::{EventBus, ModerationEvent};

pub struct RegistryService {
    db: Arc<ModerationDb>,
    events: Arc<EventBus>,
}

impl RegistryService {
    pub fn new(db: Arc<ModerationDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Entities
    // =========================================================================

    pub fn register_entity(&self, entity_id: i64) -> Result<Entity, StorageError> {
        self.db
            .write("register_entity", |conn| registry::register_entity(conn, entity_id))
    }

    pub fn entity_exists(&self, entity_id: i64) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| registry::entity_exists(conn, entity_id))
    }

    /// Delete an entity. A led cluster is deleted with it; a membership
    /// shrinks the cluster it belonged to.
    pub fn delete_entity(&self, entity_id: i64) -> Result<EntityDeletion, StorageError> {
        let deletion = self
            .db
            .write("delete_entity", |conn| registry::delete_entity(conn, entity_id))?;

        if let Some(cluster) = &deletion.deleted_cluster {
            info!(entity_id, cluster_id = cluster.cluster.id, "Leader deleted, cluster removed");
            self.events.emit(ModerationEvent::ClusterDeleted {
                cluster_id: cluster.cluster.id,
                cleared_members: cluster.cleared_members,
                deleted_ledger_rows: cluster.deleted_ledger_rows,
            });
        }
        if let Some(cluster_id) = deletion.left_cluster {
            self.events
                .emit(ModerationEvent::MemberRemoved { entity_id, cluster_id });
        }
        self.events.emit(ModerationEvent::EntityDeleted {
            entity_id,
            cascaded_cluster: deletion.deleted_cluster.as_ref().map(|d| d.cluster.id),
        });

        Ok(deletion)
    }

    /// Rename an entity; a cluster it leads keeps it as leader
    pub fn rename_entity(&self, old_id: i64, new_id: i64) -> Result<Entity, StorageError> {
        let entity = self
            .db
            .write("rename_entity", |conn| registry::rename_entity(conn, old_id, new_id))?;
        self.events
            .emit(ModerationEvent::EntityRenamed { old_id, new_id });
        Ok(entity)
    }

    // =========================================================================
    // Actors
    // =========================================================================

    pub fn register_actor(&self, actor_id: i64) -> Result<(), StorageError> {
        self.db
            .write("register_actor", |conn| registry::register_actor(conn, actor_id))
    }

    pub fn actor_exists(&self, actor_id: i64) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| registry::actor_exists(conn, actor_id))
    }

    /// Delete an actor. `ActorRestricted` while any ledger row names them.
    pub fn delete_actor(&self, actor_id: i64) -> Result<(), StorageError> {
        self.db
            .write("delete_actor", |conn| registry::delete_actor(conn, actor_id))?;
        self.events.emit(ModerationEvent::ActorDeleted { actor_id });
        Ok(())
    }

    /// Rename an actor, repointing their ledger rows
    pub fn rename_actor(&self, old_id: i64, new_id: i64) -> Result<usize, StorageError> {
        let ledger_rows = self
            .db
            .write("rename_actor", |conn| registry::rename_actor(conn, old_id, new_id))?;
        self.events.emit(ModerationEvent::ActorRenamed {
            old_id,
            new_id,
            ledger_rows,
        });
        Ok(ledger_rows)
    }
}
