//! Report counter using Diesel
//!
//! Increments are a single `report_count = report_count + 1` UPDATE, so
//! concurrent reports are never lost.

use diesel::prelude::*;

use super::clusters::require_cluster;
use super::diesel_schema::message_clusters;
use super::models::{current_timestamp, MessageCluster};
use crate::error::StorageError;

/// Count one abuse report against a cluster
pub fn record_report(
    conn: &mut SqliteConnection,
    cluster_id: i64,
) -> Result<MessageCluster, StorageError> {
    let now = current_timestamp();
    let updated = diesel::update(message_clusters::table.find(cluster_id))
        .set((
            message_clusters::report_count.eq(message_clusters::report_count + 1),
            message_clusters::last_reported_at.eq(Some(&now)),
            message_clusters::updated_at.eq(&now),
        ))
        .execute(conn)
        .map_err(|e| StorageError::query("Report update failed", e))?;

    if updated == 0 {
        return Err(StorageError::ClusterNotFound(cluster_id));
    }

    require_cluster(conn, cluster_id)
}

/// Overwrite `report_count` (moderation correction). `last_reported_at` is
/// left alone since no report was received.
pub fn correct_report_count(
    conn: &mut SqliteConnection,
    cluster_id: i64,
    value: i32,
) -> Result<MessageCluster, StorageError> {
    if value < 0 {
        return Err(StorageError::InvalidInput(format!(
            "report_count must be >= 0, got {}",
            value
        )));
    }

    let updated = diesel::update(message_clusters::table.find(cluster_id))
        .set((
            message_clusters::report_count.eq(value),
            message_clusters::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| StorageError::query("Report update failed", e))?;

    if updated == 0 {
        return Err(StorageError::ClusterNotFound(cluster_id));
    }

    require_cluster(conn, cluster_id)
}
