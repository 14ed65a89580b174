//! Ranking service - ranked moderation queues and index maintenance
//!
//! Maintenance never takes exclusive access: each index rebuild and each
//! reconciliation batch is its own short write transaction, so live writes
//! interleave between them and readers (WAL) are never blocked.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::db::ranking::{self, RankCursor, RankOrder, RankedPage};
use crate::db::schema::{self, RANKING_INDEXES};
use crate::db::{ClusterStatus, ModerationDb};
use crate::error::StorageError;

use super::events::{EventBus, ModerationEvent};

/// Totals of a full reconciliation pass
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileReport {
    pub batches: usize,
    pub scanned: usize,
    pub corrected: usize,
}

/// Ranking service for the ranking index
pub struct RankingService {
    db: Arc<ModerationDb>,
    events: Arc<EventBus>,
    default_limit: i64,
    max_limit: i64,
    reconcile_batch_size: i64,
}

impl RankingService {
    /// Create a new ranking service
    pub fn new(db: Arc<ModerationDb>, events: Arc<EventBus>, config: &Config) -> Self {
        Self {
            db,
            events,
            default_limit: config.default_rank_limit,
            max_limit: config.max_rank_limit,
            reconcile_batch_size: config.reconcile_batch_size,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// One page of clusters in `status`, highest `order` count first.
    ///
    /// `limit` defaults to the configured page size and must lie in
    /// `1..=max_rank_limit`.
    pub fn top_clusters(
        &self,
        status: ClusterStatus,
        order: RankOrder,
        limit: Option<i64>,
        cursor: Option<&RankCursor>,
    ) -> Result<RankedPage, StorageError> {
        let limit = self.validate_limit(limit)?;
        self.db
            .with_conn(|conn| ranking::top_clusters(conn, status, order, limit, cursor))
    }

    /// Same as `top_clusters`, taking string status/order and an opaque cursor token
    pub fn top_clusters_by_token(
        &self,
        status: &str,
        order: &str,
        limit: Option<i64>,
        cursor_token: Option<&str>,
    ) -> Result<RankedPage, StorageError> {
        let status: ClusterStatus = status.parse()?;
        let order: RankOrder = order.parse()?;
        let cursor = cursor_token.map(RankCursor::decode).transpose()?;
        self.top_clusters(status, order, limit, cursor.as_ref())
    }

    fn validate_limit(&self, limit: Option<i64>) -> Result<i64, StorageError> {
        let limit = limit.unwrap_or(self.default_limit);
        if limit < 1 || limit > self.max_limit {
            return Err(StorageError::InvalidInput(format!(
                "limit must be between 1 and {}, got {}",
                self.max_limit, limit
            )));
        }
        Ok(limit)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Create any missing ranking, ledger and membership index
    pub fn ensure_ranking_indexes(&self) -> Result<(), StorageError> {
        self.db.write("ensure_indexes", |conn| schema::ensure_indexes(conn))
    }

    /// Rebuild every ranking index, one short transaction each, then refresh
    /// planner statistics. Returns the number of indexes rebuilt.
    pub fn rebuild_ranking_indexes(&self) -> Result<usize, StorageError> {
        for index in RANKING_INDEXES {
            self.db.write("reindex", |conn| ranking::reindex(conn, index))?;
        }
        self.db.write("analyze", |conn| ranking::analyze(conn))?;

        info!(indexes = RANKING_INDEXES.len(), "Ranking indexes rebuilt");
        self.events.emit(ModerationEvent::MaintenanceFinished {
            task: "rebuild_ranking_indexes",
            corrected: 0,
        });
        Ok(RANKING_INDEXES.len())
    }

    /// Recompute cached counters and status from physical data, batch by
    /// batch. `batch_size` defaults to the configured size.
    pub fn reconcile_counters(&self, batch_size: Option<i64>) -> Result<ReconcileReport, StorageError> {
        let batch_size = batch_size.unwrap_or(self.reconcile_batch_size);
        if batch_size < 1 {
            return Err(StorageError::InvalidInput(format!(
                "batch size must be at least 1, got {}",
                batch_size
            )));
        }

        let mut report = ReconcileReport::default();
        let mut after_id = i64::MIN;
        loop {
            let batch = self.db.write("reconcile_counters", |conn| {
                ranking::reconcile_batch(conn, after_id, batch_size)
            })?;

            let Some(last_id) = batch.last_id else { break };
            report.batches += 1;
            report.scanned += batch.scanned;
            report.corrected += batch.corrected;
            after_id = last_id;

            if (batch.scanned as i64) < batch_size {
                break;
            }
        }

        info!(
            batches = report.batches,
            scanned = report.scanned,
            corrected = report.corrected,
            "Counter reconciliation finished"
        );
        self.events.emit(ModerationEvent::MaintenanceFinished {
            task: "reconcile_counters",
            corrected: report.corrected,
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::services::Services;
    use crate::StorageError;

    #[test]
    fn test_limit_bounds() {
        let services = Services::in_memory().unwrap();
        let ranking = &services.ranking;

        assert!(ranking
            .top_clusters_by_token("blacklisted", "report_count", None, None)
            .unwrap()
            .clusters
            .is_empty());
        assert!(matches!(
            ranking.top_clusters_by_token("blacklisted", "report_count", Some(0), None),
            Err(StorageError::InvalidInput(_))
        ));
        assert!(matches!(
            ranking.top_clusters_by_token("blacklisted", "report_count", Some(501), None),
            Err(StorageError::InvalidInput(_))
        ));
        assert!(matches!(
            ranking.top_clusters_by_token("spam", "report_count", None, None),
            Err(StorageError::InvalidStatus(_))
        ));
        assert!(matches!(
            ranking.top_clusters_by_token("hidden", "newest", None, None),
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_maintenance_on_empty_store() {
        let services = Services::in_memory().unwrap();
        services.ranking.ensure_ranking_indexes().unwrap();
        assert_eq!(services.ranking.rebuild_ranking_indexes().unwrap(), 2);
        let report = services.ranking.reconcile_counters(Some(10)).unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(report.corrected, 0);
    }
}
