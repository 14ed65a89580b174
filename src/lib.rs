//! Message Cluster Store - moderation engine for clustered message entities
//!
//! Groups related message entities into clusters anchored on a leader
//! entity, tracks report and membership counters, keeps an append-only
//! ledger of moderation decisions, and serves rank-ordered moderation queues.
//!
//! ## Architecture
//!
//! - **Cluster store**: identity, leader, counters, cached latest status
//! - **Membership index**: `entities.cluster_id` plus `entity_count`
//! - **Status ledger**: immutable decisions, mirrored onto the cluster
//! - **Report tracker**: atomic `report_count` increments
//! - **Ranking index**: keyset-paginated queues per status
//!
//! Which entities cluster together, and who leads, is decided upstream.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/message-cluster-store/
//! ├── moderation.db          # SQLite (WAL) database
//! └── config.toml            # Configuration
//! ```

pub mod config;
pub mod error;
pub mod db;
pub mod services;

// Re-exports
pub use config::Config;
pub use error::{ErrorKind, StorageError};
pub use db::{ClusterStatus, MessageCluster, MessageClusterStatus, ModerationDb, RankCursor, RankOrder, RankedPage};
pub use services::{EventBus, ModerationEvent, Services, StatusHistory};
