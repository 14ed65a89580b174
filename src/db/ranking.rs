//! Ranked cluster queries and ranking-index maintenance
//!
//! Listing is keyset-paginated on `(count, id)` where `count` is the ranking
//! column, ordered `count DESC, id ASC`. Each ordering is served by its own
//! `(latest_status, count DESC, id)` index.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::diesel_schema::message_clusters;
use super::models::{current_timestamp, ClusterStatus, MessageCluster};
use super::schema::RANKING_INDEXES;
use super::{ledger, membership};
use crate::error::StorageError;

// ============================================================================
// Query Types
// ============================================================================

/// Ranking column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    #[default]
    ReportCount,
    EntityCount,
}

impl RankOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            RankOrder::ReportCount => "report_count",
            RankOrder::EntityCount => "entity_count",
        }
    }

    fn count_of(&self, cluster: &MessageCluster) -> i32 {
        match self {
            RankOrder::ReportCount => cluster.report_count,
            RankOrder::EntityCount => cluster.entity_count,
        }
    }
}

impl fmt::Display for RankOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RankOrder {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report_count" => Ok(RankOrder::ReportCount),
            "entity_count" => Ok(RankOrder::EntityCount),
            other => Err(StorageError::InvalidInput(format!(
                "Unknown rank order: {}. Expected report_count or entity_count",
                other
            ))),
        }
    }
}

/// Position after the last cluster of a page.
///
/// Serialized as an opaque URL-safe token of the form `order:count:id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankCursor {
    pub order: RankOrder,
    pub count: i32,
    pub id: i64,
}

impl RankCursor {
    pub fn after(cluster: &MessageCluster, order: RankOrder) -> Self {
        Self {
            order,
            count: order.count_of(cluster),
            id: cluster.id,
        }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}:{}", self.order, self.count, self.id))
    }

    pub fn decode(token: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidInput(format!("Invalid cursor: {}", token));

        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;

        let mut parts = text.splitn(3, ':');
        let (Some(order), Some(count), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };

        Ok(Self {
            order: order.parse().map_err(|_| invalid())?,
            count: count.parse().map_err(|_| invalid())?,
            id: id.parse().map_err(|_| invalid())?,
        })
    }
}

/// One page of ranked clusters
#[derive(Debug, Clone, Serialize)]
pub struct RankedPage {
    pub clusters: Vec<MessageCluster>,
    /// Present only when more clusters follow this page
    pub next_cursor: Option<RankCursor>,
}

/// Outcome of one reconciliation batch
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileBatch {
    pub scanned: usize,
    pub corrected: usize,
    /// Highest cluster id visited; `None` when the batch was empty
    pub last_id: Option<i64>,
}

// ============================================================================
// Read Operations
// ============================================================================

/// Clusters with `latest_status = status`, ordered by `order` descending with
/// ascending id as tiebreak, resuming after `after` when given.
pub fn top_clusters(
    conn: &mut SqliteConnection,
    status: ClusterStatus,
    order: RankOrder,
    limit: i64,
    after: Option<&RankCursor>,
) -> Result<RankedPage, StorageError> {
    if let Some(cursor) = after {
        if cursor.order != order {
            return Err(StorageError::InvalidInput(format!(
                "Cursor was issued for {} ordering, not {}",
                cursor.order, order
            )));
        }
    }

    if limit < 1 {
        return Err(StorageError::InvalidInput(format!("limit must be at least 1, got {}", limit)));
    }

    let mut query = message_clusters::table
        .filter(message_clusters::latest_status.eq(status))
        .select(MessageCluster::as_select())
        .into_boxed();

    match order {
        RankOrder::ReportCount => {
            if let Some(cursor) = after {
                query = query.filter(
                    message_clusters::report_count.lt(cursor.count).or(message_clusters::report_count
                        .eq(cursor.count)
                        .and(message_clusters::id.gt(cursor.id))),
                );
            }
            query = query.order((message_clusters::report_count.desc(), message_clusters::id.asc()));
        }
        RankOrder::EntityCount => {
            if let Some(cursor) = after {
                query = query.filter(
                    message_clusters::entity_count.lt(cursor.count).or(message_clusters::entity_count
                        .eq(cursor.count)
                        .and(message_clusters::id.gt(cursor.id))),
                );
            }
            query = query.order((message_clusters::entity_count.desc(), message_clusters::id.asc()));
        }
    }

    let mut clusters: Vec<MessageCluster> = query
        .limit(limit.saturating_add(1))
        .load(conn)
        .map_err(|e| StorageError::query("Ranking query failed", e))?;

    let next_cursor = if clusters.len() as i64 > limit {
        clusters.truncate(limit as usize);
        clusters.last().map(|c| RankCursor::after(c, order))
    } else {
        None
    };

    Ok(RankedPage { clusters, next_cursor })
}

// ============================================================================
// Maintenance
// ============================================================================

/// Rebuild one ranking index. Names outside the ranking set are rejected.
pub fn reindex(conn: &mut SqliteConnection, index_name: &str) -> Result<(), StorageError> {
    if !RANKING_INDEXES.contains(&index_name) {
        return Err(StorageError::InvalidInput(format!("Not a ranking index: {}", index_name)));
    }
    info!(index = index_name, "Rebuilding ranking index");
    conn.batch_execute(&format!("REINDEX {}", index_name))
        .map_err(|e| StorageError::query("Reindex failed", e))
}

/// Refresh planner statistics after a rebuild
pub fn analyze(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    conn.batch_execute("ANALYZE message_clusters")
        .map_err(|e| StorageError::query("Analyze failed", e))
}

/// Recompute `entity_count` and the cached status for up to `batch_size`
/// clusters with id greater than `after_id`.
pub fn reconcile_batch(
    conn: &mut SqliteConnection,
    after_id: i64,
    batch_size: i64,
) -> Result<ReconcileBatch, StorageError> {
    let batch: Vec<MessageCluster> = message_clusters::table
        .filter(message_clusters::id.gt(after_id))
        .order(message_clusters::id.asc())
        .limit(batch_size)
        .select(MessageCluster::as_select())
        .load(conn)
        .map_err(|e| StorageError::query("Query failed", e))?;

    let mut outcome = ReconcileBatch::default();
    for cluster in &batch {
        outcome.scanned += 1;
        outcome.last_id = Some(cluster.id);

        let physical = membership::member_count(conn, cluster.id)? as i32;
        let latest = ledger::latest_entry(conn, cluster.id)?;

        let (status, status_at) = match &latest {
            Some(entry) => (entry.status, entry.created_at.clone()),
            None => (cluster.latest_status, cluster.latest_status_at.clone()),
        };

        if physical == cluster.entity_count
            && status == cluster.latest_status
            && status_at == cluster.latest_status_at
        {
            continue;
        }

        debug!(
            cluster_id = cluster.id,
            cached_entity_count = cluster.entity_count,
            physical,
            "Reconciling cluster counters"
        );

        diesel::update(message_clusters::table.find(cluster.id))
            .set((
                message_clusters::entity_count.eq(physical),
                message_clusters::latest_status.eq(status),
                message_clusters::latest_status_at.eq(&status_at),
                message_clusters::updated_at.eq(current_timestamp()),
            ))
            .execute(conn)
            .map_err(|e| StorageError::query("Reconcile update failed", e))?;
        outcome.corrected += 1;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{clusters, ledger, registry, reports, test_conn};

    /// Clusters led by entities 1..=n, blacklisted by actor 10
    fn seed(conn: &mut SqliteConnection, n: i64) -> Vec<i64> {
        registry::register_actor(conn, 10).unwrap();
        (1..=n)
            .map(|leader| {
                registry::register_entity(conn, leader).unwrap();
                let id = clusters::create_cluster(conn, leader, 0).unwrap().cluster.id;
                ledger::record_status_change(conn, id, ClusterStatus::Blacklisted, 10).unwrap();
                id
            })
            .collect()
    }

    #[test]
    fn test_order_by_report_count_with_id_tiebreak() {
        let mut conn = test_conn();
        let ids = seed(&mut conn, 3);
        reports::record_report(&mut conn, ids[2]).unwrap();
        reports::record_report(&mut conn, ids[2]).unwrap();
        reports::record_report(&mut conn, ids[1]).unwrap();
        reports::record_report(&mut conn, ids[0]).unwrap();

        let page = top_clusters(&mut conn, ClusterStatus::Blacklisted, RankOrder::ReportCount, 10, None).unwrap();
        let order: Vec<_> = page.clusters.iter().map(|c| c.id).collect();
        assert_eq!(order, vec![ids[2], ids[0], ids[1]]);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_status_filter() {
        let mut conn = test_conn();
        let ids = seed(&mut conn, 2);
        ledger::record_status_change(&mut conn, ids[0], ClusterStatus::Whitelisted, 10).unwrap();

        let page = top_clusters(&mut conn, ClusterStatus::Blacklisted, RankOrder::EntityCount, 10, None).unwrap();
        assert_eq!(page.clusters.len(), 1);
        assert_eq!(page.clusters[0].id, ids[1]);
        assert!(top_clusters(&mut conn, ClusterStatus::Hidden, RankOrder::EntityCount, 10, None)
            .unwrap()
            .clusters
            .is_empty());
    }

    #[test]
    fn test_pagination_visits_every_cluster_once() {
        let mut conn = test_conn();
        let ids = seed(&mut conn, 7);
        for (i, id) in ids.iter().enumerate() {
            for _ in 0..(i % 3) {
                reports::record_report(&mut conn, *id).unwrap();
            }
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = top_clusters(
                &mut conn,
                ClusterStatus::Blacklisted,
                RankOrder::ReportCount,
                2,
                cursor.as_ref(),
            )
            .unwrap();
            seen.extend(page.clusters.iter().map(|c| (c.report_count, c.id)));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), ids.len());
        let mut expected = seen.clone();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_limit_edges() {
        let mut conn = test_conn();
        seed(&mut conn, 2);

        let page = top_clusters(&mut conn, ClusterStatus::Blacklisted, RankOrder::ReportCount, i64::MAX, None).unwrap();
        assert_eq!(page.clusters.len(), 2);
        assert!(page.next_cursor.is_none());

        for limit in [0, -1, i64::MIN] {
            assert!(matches!(
                top_clusters(&mut conn, ClusterStatus::Blacklisted, RankOrder::ReportCount, limit, None),
                Err(StorageError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_cursor_token() {
        let cursor = RankCursor {
            order: RankOrder::EntityCount,
            count: 4,
            id: 17,
        };
        let token = cursor.encode();
        assert!(!token.contains(':'));
        assert_eq!(RankCursor::decode(&token).unwrap(), cursor);

        assert!(matches!(RankCursor::decode("not base64!"), Err(StorageError::InvalidInput(_))));
        let garbage = URL_SAFE_NO_PAD.encode("entity_count:x:1");
        assert!(RankCursor::decode(&garbage).is_err());
    }

    #[test]
    fn test_cursor_order_mismatch() {
        let mut conn = test_conn();
        seed(&mut conn, 1);
        let cursor = RankCursor {
            order: RankOrder::EntityCount,
            count: 0,
            id: 1,
        };
        assert!(matches!(
            top_clusters(&mut conn, ClusterStatus::Blacklisted, RankOrder::ReportCount, 5, Some(&cursor)),
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reindex_and_analyze() {
        let mut conn = test_conn();
        seed(&mut conn, 2);
        for index in RANKING_INDEXES {
            reindex(&mut conn, index).unwrap();
        }
        analyze(&mut conn).unwrap();
        assert!(reindex(&mut conn, "users").is_err());
    }

    #[test]
    fn test_reconcile_repairs_drift() {
        let mut conn = test_conn();
        let ids = seed(&mut conn, 3);
        registry::register_entity(&mut conn, 100).unwrap();
        membership::add_member(&mut conn, 100, ids[0]).unwrap();

        diesel::update(message_clusters::table.find(ids[0]))
            .set((
                message_clusters::entity_count.eq(9),
                message_clusters::latest_status.eq(ClusterStatus::Hidden),
            ))
            .execute(&mut conn)
            .unwrap();

        let first = reconcile_batch(&mut conn, 0, 2).unwrap();
        assert_eq!(first.scanned, 2);
        assert_eq!(first.corrected, 1);
        assert_eq!(first.last_id, Some(ids[1]));

        let rest = reconcile_batch(&mut conn, ids[1], 2).unwrap();
        assert_eq!(rest.scanned, 1);
        assert_eq!(rest.corrected, 0);
        assert_eq!(reconcile_batch(&mut conn, ids[2], 2).unwrap().last_id, None);

        let repaired = clusters::require_cluster(&mut conn, ids[0]).unwrap();
        assert_eq!(repaired.entity_count, 1);
        assert_eq!(repaired.latest_status, ClusterStatus::Blacklisted);
    }
}
