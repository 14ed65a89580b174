//! Service layer for message-cluster-store
//!
//! Services encapsulate the moderation API on top of the repositories.
//! Each service wraps database operations with:
//! - Input validation at the boundary (status strings, limits, cursors)
//! - The transaction boundary and bounded retry (`ModerationDb::write`)
//! - Event emission for the audit log
//!
//! ## Architecture
//!
//! ```text
//! Callers (ingestion, moderation tools, mcstore CLI)
//!     ↓
//! Service Layer (validation, retry, events)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod cluster_service;
pub mod membership_service;
pub mod ledger_service;
pub mod report_service;
pub mod ranking_service;
pub mod registry_service;

// Re-exports
pub use events::{spawn_logging_listener, EventBus, EventListener, ModerationEvent};
pub use cluster_service::ClusterService;
pub use membership_service::MembershipService;
pub use ledger_service::{LedgerService, StatusHistory};
pub use report_service::ReportService;
pub use ranking_service::{RankingService, ReconcileReport};
pub use registry_service::RegistryService;

use std::sync::Arc;

use crate::config::Config;
use crate::db::ModerationDb;
use crate::error::StorageError;

/// Service container for dependency injection
///
/// Holds all services with a shared database pool and event bus.
pub struct Services {
    pub clusters: Arc<ClusterService>,
    pub membership: Arc<MembershipService>,
    pub ledger: Arc<LedgerService>,
    pub reports: Arc<ReportService>,
    pub ranking: Arc<RankingService>,
    pub registry: Arc<RegistryService>,
    pub events: Arc<EventBus>,
    pub db: Arc<ModerationDb>,
}

impl Services {
    /// Open the database described by `config` and wire up every service
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        let db = Arc::new(ModerationDb::open(config)?);
        Ok(Self::new(db, config))
    }

    /// Create all services over an already opened database
    pub fn new(db: Arc<ModerationDb>, config: &Config) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));

        Self {
            clusters: Arc::new(ClusterService::new(db.clone(), events.clone(), config.system_actor_id)),
            membership: Arc::new(MembershipService::new(db.clone(), events.clone())),
            ledger: Arc::new(LedgerService::new(db.clone(), events.clone(), config.history_page_size)),
            reports: Arc::new(ReportService::new(db.clone(), events.clone())),
            ranking: Arc::new(RankingService::new(db.clone(), events.clone(), config)),
            registry: Arc::new(RegistryService::new(db.clone(), events.clone())),
            events,
            db,
        }
    }

    /// In-memory database with default settings (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let db = Arc::new(ModerationDb::open_in_memory()?);
        Ok(Self::new(db, &Config::default()))
    }
}
