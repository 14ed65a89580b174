//! Ledger service - status decisions and the audit history
//!
//! Status values arrive as strings from callers and are parsed here; an
//! unknown value never reaches the database.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::db::clusters;
use crate::db::ledger::{self, HistoryCursor, StatusChange};
use crate::db::{ClusterStatus, MessageClusterStatus, ModerationDb};
use crate::error::StorageError;

use super::events::{EventBus, ModerationEvent};

/// Ledger service for the status ledger
pub struct LedgerService {
    db: Arc<ModerationDb>,
    events: Arc<EventBus>,
    page_size: i64,
}

impl LedgerService {
    /// Create a new ledger service
    pub fn new(db: Arc<ModerationDb>, events: Arc<EventBus>, page_size: i64) -> Self {
        Self {
            db,
            events,
            page_size: page_size.max(1),
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Lazy history of a cluster, newest first.
    ///
    /// Fails up front with `ClusterNotFound`; rows are then fetched one page
    /// at a time as the iterator advances.
    pub fn history(&self, cluster_id: i64) -> Result<StatusHistory, StorageError> {
        self.db.with_conn(|conn| clusters::require_cluster(conn, cluster_id))?;
        Ok(StatusHistory::new(self.db.clone(), cluster_id, self.page_size))
    }

    /// Newest ledger row of a cluster
    pub fn latest(&self, cluster_id: i64) -> Result<Option<MessageClusterStatus>, StorageError> {
        self.db.with_conn(|conn| ledger::latest_entry(conn, cluster_id))
    }

    /// Number of ledger rows attributed to an actor
    pub fn rows_for_actor(&self, actor_id: i64) -> Result<i64, StorageError> {
        self.db.with_conn(|conn| ledger::count_for_actor(conn, actor_id))
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Record a status decision given as a string (`blacklisted`,
    /// `whitelisted`, `unclassified`, `hidden`)
    pub fn record_status_change(
        &self,
        cluster_id: i64,
        status: &str,
        actor_id: i64,
    ) -> Result<StatusChange, StorageError> {
        let status: ClusterStatus = status.parse()?;
        self.record(cluster_id, status, actor_id)
    }

    /// Record a status decision. Re-asserting the current status is recorded too.
    pub fn record(
        &self,
        cluster_id: i64,
        status: ClusterStatus,
        actor_id: i64,
    ) -> Result<StatusChange, StorageError> {
        let change = self.db.write("record_status_change", |conn| {
            ledger::record_status_change(conn, cluster_id, status, actor_id)
        })?;

        self.events.emit(ModerationEvent::StatusRecorded {
            cluster_id,
            status,
            actor_id,
        });

        Ok(change)
    }
}

/// Restartable, paged iterator over a cluster's ledger, newest first.
///
/// Each page is read on its own pooled connection, so holding the iterator
/// never pins a connection or blocks writers.
pub struct StatusHistory {
    db: Arc<ModerationDb>,
    cluster_id: i64,
    page_size: i64,
    buffer: VecDeque<MessageClusterStatus>,
    cursor: Option<HistoryCursor>,
    exhausted: bool,
}

impl StatusHistory {
    fn new(db: Arc<ModerationDb>, cluster_id: i64, page_size: i64) -> Self {
        Self {
            db,
            cluster_id,
            page_size,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    pub fn cluster_id(&self) -> i64 {
        self.cluster_id
    }

    /// Start again from the newest row
    pub fn rewind(&mut self) {
        self.buffer.clear();
        self.cursor = None;
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<(), StorageError> {
        let (cluster_id, page_size) = (self.cluster_id, self.page_size);
        let cursor = self.cursor.clone();
        let page = self
            .db
            .with_conn(|conn| ledger::history_page(conn, cluster_id, cursor.as_ref(), page_size))?;

        if (page.len() as i64) < page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(HistoryCursor::after(last));
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for StatusHistory {
    type Item = Result<MessageClusterStatus, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
