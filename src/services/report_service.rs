//! Report service - abuse report counting

use std::sync::Arc;

use tracing::debug;

use crate::db::reports;
use crate::db::{MessageCluster, ModerationDb};
use crate::error::StorageError;

use super::events::{EventBus, ModerationEvent};

pub struct ReportService {
    db: Arc<ModerationDb>,
    events: Arc<EventBus>,
}

impl ReportService {
    pub fn new(db: Arc<ModerationDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Count one report. Safe under any number of concurrent callers.
    pub fn record_report(&self, cluster_id: i64) -> Result<MessageCluster, StorageError> {
        let cluster = self
            .db
            .write("record_report", |conn| reports::record_report(conn, cluster_id))?;

        debug!(cluster_id, report_count = cluster.report_count, "Report recorded");
        self.events.emit(ModerationEvent::ReportRecorded {
            cluster_id,
            report_count: cluster.report_count,
        });

        Ok(cluster)
    }

    /// Overwrite the report count (moderation correction)
    pub fn correct_report_count(&self, cluster_id: i64, value: i32) -> Result<MessageCluster, StorageError> {
        let cluster = self.db.write("correct_report_count", |conn| {
            reports::correct_report_count(conn, cluster_id, value)
        })?;

        self.events.emit(ModerationEvent::ReportCountCorrected {
            cluster_id,
            report_count: cluster.report_count,
        });

        Ok(cluster)
    }
}
