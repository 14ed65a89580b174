//! Entity registry and actor directory
//!
//! These tables belong to collaborators; the cluster engine only needs
//! existence checks plus the referential side effects of deletes and
//! renames:
//!
//! - deleting a leader entity deletes its cluster (cascade)
//! - deleting a member entity decrements its cluster's `entity_count`
//! - deleting an actor with ledger rows is refused (restrict)
//! - renames carry every reference along

use diesel::prelude::*;
use serde::Serialize;
use tracing::debug;

use super::clusters::{self, DeletedCluster};
use super::diesel_schema::{entities, message_clusters, users};
use super::models::{current_timestamp, Actor, Entity, NewActor, NewEntity};
use super::{ledger, membership};
use crate::error::StorageError;

/// Side effects of deleting an entity
#[derive(Debug, Clone, Serialize)]
pub struct EntityDeletion {
    pub entity_id: i64,
    /// Cluster the entity led, now deleted
    pub deleted_cluster: Option<DeletedCluster>,
    /// Cluster the entity was a member of, now one smaller
    pub left_cluster: Option<i64>,
}

// ============================================================================
// Entities
// ============================================================================

pub fn get_entity(conn: &mut SqliteConnection, entity_id: i64) -> Result<Option<Entity>, StorageError> {
    entities::table
        .find(entity_id)
        .select(Entity::as_select())
        .first(conn)
        .optional()
        .map_err(|e| StorageError::query("Query failed", e))
}

pub fn require_entity(conn: &mut SqliteConnection, entity_id: i64) -> Result<Entity, StorageError> {
    get_entity(conn, entity_id)?.ok_or(StorageError::EntityNotFound(entity_id))
}

pub fn entity_exists(conn: &mut SqliteConnection, entity_id: i64) -> Result<bool, StorageError> {
    Ok(get_entity(conn, entity_id)?.is_some())
}

pub fn register_entity(conn: &mut SqliteConnection, entity_id: i64) -> Result<Entity, StorageError> {
    if entity_exists(conn, entity_id)? {
        return Err(StorageError::IdentifierTaken(format!("entity {}", entity_id)));
    }

    let now = current_timestamp();
    diesel::insert_into(entities::table)
        .values(&NewEntity {
            id: entity_id,
            cluster_id: None,
            created_at: &now,
        })
        .execute(conn)
        .map_err(|e| StorageError::query("Insert failed", e))?;

    require_entity(conn, entity_id)
}

/// Delete an entity and apply the cluster side effects first
pub fn delete_entity(conn: &mut SqliteConnection, entity_id: i64) -> Result<EntityDeletion, StorageError> {
    conn.transaction(|conn| {
        require_entity(conn, entity_id)?;

        let deleted_cluster = match clusters::find_by_leader(conn, entity_id)? {
            Some(led) => Some(clusters::delete_cluster(conn, led.id)?),
            None => None,
        };

        // Re-read: the cascade above clears membership in the led cluster
        let left_cluster = require_entity(conn, entity_id)?.cluster_id;
        if let Some(cluster_id) = left_cluster {
            membership::decrement_entity_count(conn, cluster_id)?;
        }

        diesel::delete(entities::table.find(entity_id))
            .execute(conn)
            .map_err(|e| StorageError::query("Delete failed", e))?;

        debug!(entity_id, ?left_cluster, cascaded = deleted_cluster.is_some(), "Entity deleted");

        Ok(EntityDeletion {
            entity_id,
            deleted_cluster,
            left_cluster,
        })
    })
}

/// Change an entity's identifier. Leadership follows the entity.
pub fn rename_entity(conn: &mut SqliteConnection, old_id: i64, new_id: i64) -> Result<Entity, StorageError> {
    conn.transaction(|conn| {
        require_entity(conn, old_id)?;
        if old_id == new_id {
            return require_entity(conn, old_id);
        }
        if entity_exists(conn, new_id)? {
            return Err(StorageError::IdentifierTaken(format!("entity {}", new_id)));
        }

        diesel::update(entities::table.find(old_id))
            .set(entities::id.eq(new_id))
            .execute(conn)
            .map_err(|e| StorageError::query("Update failed", e))?;

        diesel::update(message_clusters::table.filter(message_clusters::leader_entity_id.eq(old_id)))
            .set((
                message_clusters::leader_entity_id.eq(new_id),
                message_clusters::updated_at.eq(current_timestamp()),
            ))
            .execute(conn)
            .map_err(|e| StorageError::query("Leader update failed", e))?;

        require_entity(conn, new_id)
    })
}

// ============================================================================
// Actors
// ============================================================================

pub fn actor_exists(conn: &mut SqliteConnection, actor_id: i64) -> Result<bool, StorageError> {
    users::table
        .find(actor_id)
        .select(Actor::as_select())
        .first(conn)
        .optional()
        .map(|a| a.is_some())
        .map_err(|e| StorageError::query("Query failed", e))
}

pub fn register_actor(conn: &mut SqliteConnection, actor_id: i64) -> Result<(), StorageError> {
    if actor_exists(conn, actor_id)? {
        return Err(StorageError::IdentifierTaken(format!("actor {}", actor_id)));
    }
    ensure_actor(conn, actor_id)
}

/// Register the actor if it is not already known
pub(crate) fn ensure_actor(conn: &mut SqliteConnection, actor_id: i64) -> Result<(), StorageError> {
    let now = current_timestamp();
    diesel::insert_or_ignore_into(users::table)
        .values(&NewActor {
            id: actor_id,
            created_at: &now,
        })
        .execute(conn)
        .map_err(|e| StorageError::query("Insert failed", e))?;
    Ok(())
}

/// Delete an actor. Refused while any ledger row references it.
pub fn delete_actor(conn: &mut SqliteConnection, actor_id: i64) -> Result<(), StorageError> {
    conn.transaction(|conn| {
        if !actor_exists(conn, actor_id)? {
            return Err(StorageError::ActorNotFound(actor_id));
        }

        let ledger_rows = ledger::count_for_actor(conn, actor_id)?;
        if ledger_rows > 0 {
            return Err(StorageError::ActorRestricted { actor_id, ledger_rows });
        }

        diesel::delete(users::table.find(actor_id))
            .execute(conn)
            .map_err(|e| StorageError::query("Delete failed", e))?;
        Ok(())
    })
}

/// Change an actor's identifier, repointing its ledger rows
pub fn rename_actor(conn: &mut SqliteConnection, old_id: i64, new_id: i64) -> Result<usize, StorageError> {
    conn.transaction(|conn| {
        if !actor_exists(conn, old_id)? {
            return Err(StorageError::ActorNotFound(old_id));
        }
        if old_id == new_id {
            return Ok(0);
        }
        if actor_exists(conn, new_id)? {
            return Err(StorageError::IdentifierTaken(format!("actor {}", new_id)));
        }

        diesel::update(users::table.find(old_id))
            .set(users::id.eq(new_id))
            .execute(conn)
            .map_err(|e| StorageError::query("Update failed", e))?;

        ledger::reassign_actor(conn, old_id, new_id)
    })
}
