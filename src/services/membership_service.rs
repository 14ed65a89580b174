//! Membership service - entity to cluster assignment

use std::sync::Arc;

use crate::db::membership::{self, RemovedMember};
use crate::db::{MessageCluster, ModerationDb};
use crate::error::StorageError;

use super::events::{EventBus, ModerationEvent};

pub struct MembershipService {
    db: Arc<ModerationDb>,
    events: Arc<EventBus>,
}

impl MembershipService {
    pub fn new(db: Arc<ModerationDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Member entity ids of a cluster
    pub fn members_of(&self, cluster_id: i64) -> Result<Vec<i64>, StorageError> {
        self.db.with_conn(|conn| membership::members_of(conn, cluster_id))
    }

    /// Physical member count of a cluster
    pub fn member_count(&self, cluster_id: i64) -> Result<i64, StorageError> {
        self.db.with_conn(|conn| membership::member_count(conn, cluster_id))
    }

    /// Cluster an entity belongs to
    pub fn cluster_of(&self, entity_id: i64) -> Result<Option<i64>, StorageError> {
        self.db.with_conn(|conn| membership::cluster_of(conn, entity_id))
    }

    /// Add an entity to a cluster. Re-adding to the same cluster is a no-op.
    pub fn add(&self, entity_id: i64, cluster_id: i64) -> Result<MessageCluster, StorageError> {
        let mut changed = false;
        let cluster = self.db.write("add_member", |conn| {
            changed = membership::cluster_of(conn, entity_id)? != Some(cluster_id);
            membership::add_member(conn, entity_id, cluster_id)
        })?;

        if changed {
            self.events
                .emit(ModerationEvent::MemberAdded { entity_id, cluster_id });
        }

        Ok(cluster)
    }

    /// Remove an entity from its cluster
    pub fn remove(&self, entity_id: i64) -> Result<RemovedMember, StorageError> {
        let removed = self
            .db
            .write("remove_member", |conn| membership::remove_member(conn, entity_id))?;

        self.events.emit(ModerationEvent::MemberRemoved {
            entity_id,
            cluster_id: removed.cluster.id,
        });

        Ok(removed)
    }
}
