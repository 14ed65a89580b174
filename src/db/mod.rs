//! SQLite database module for the cluster moderation store
//!
//! ## Architecture
//!
//! - Repository functions (`clusters`, `membership`, `ledger`, `reports`,
//!   `ranking`, `registry`) take `&mut SqliteConnection` and hold no state
//! - `ModerationDb` owns the r2d2 pool and the transaction boundary
//! - Every write runs in `BEGIN IMMEDIATE`, so the check half of a
//!   check-and-write can never be invalidated by another writer
//!
//! ## Tables
//!
//! - `message_clusters` - Cluster identity, leader, counters, cached status
//! - `message_cluster_statuses` - Append-only status ledger
//! - `entities` - Entity registry (collaborator), `cluster_id` membership
//! - `users` - Actor directory (collaborator)

pub mod schema;
pub mod diesel_schema;
pub mod models;
pub mod clusters;
pub mod membership;
pub mod ledger;
pub mod reports;
pub mod ranking;
pub mod registry;

use std::path::Path;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::StorageError;
use diesel_schema::{entities, message_cluster_statuses, message_clusters};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Pragmas applied to every connection handed out by the pool
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout: Duration,
    wal: bool,
    in_memory: bool,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        let mut pragmas = format!(
            "PRAGMA busy_timeout = {}; PRAGMA synchronous = NORMAL;",
            self.busy_timeout.as_millis()
        );
        if self.wal {
            pragmas.push_str(" PRAGMA journal_mode = WAL;");
        }
        conn.batch_execute(&pragmas)
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Bounded retry for writes that lost the race for the write lock
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(25),
        }
    }
}

/// SQLite database for clusters, membership and the status ledger
pub struct ModerationDb {
    pool: DbPool,
    retry: RetryPolicy,
}

impl ModerationDb {
    /// Open or create the database described by `config`
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_dir)?;

        let db_path = config.database_path();
        info!("Opening SQLite database at {:?}", db_path);

        let pool = build_pool(
            &db_path.to_string_lossy(),
            config.pool_size,
            config.connection_timeout(),
            ConnectionOptions {
                busy_timeout: config.busy_timeout(),
                wal: true,
                in_memory: false,
            },
        )?;

        let db = Self {
            pool,
            retry: RetryPolicy {
                max_retries: config.max_write_retries,
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open a database file directly with default pool settings
    pub fn open_path(path: &Path) -> Result<Self, StorageError> {
        let defaults = Config::default();
        let pool = build_pool(
            &path.to_string_lossy(),
            defaults.pool_size,
            defaults.connection_timeout(),
            ConnectionOptions {
                busy_timeout: defaults.busy_timeout(),
                wal: true,
                in_memory: false,
            },
        )?;

        let db = Self {
            pool,
            retry: RetryPolicy::default(),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    ///
    /// Single connection: every `:memory:` connection is a separate database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let pool = build_pool(
            ":memory:",
            1,
            Duration::from_secs(30),
            ConnectionOptions {
                busy_timeout: Duration::from_secs(5),
                wal: false,
                in_memory: true,
            },
        )?;

        let db = Self {
            pool,
            retry: RetryPolicy::default(),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        schema::init_schema(&mut conn)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<PooledConn, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Run a read-only operation on a pooled connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError>,
    {
        let mut conn = self.conn()?;
        f(&mut conn)
    }

    /// Run a write in its own `BEGIN IMMEDIATE` transaction.
    ///
    /// `Busy` failures roll back and rerun `f` from scratch on a fresh
    /// transaction, up to `max_retries` extra times. Any other error rolls
    /// back and is returned unchanged.
    pub fn write<F, T>(&self, op: &str, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut(&mut SqliteConnection) -> Result<T, StorageError>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .conn()
                .and_then(|mut conn| conn.immediate_transaction(|conn| f(conn)));

            match result {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Write conflict, retrying");
                    std::thread::sleep(delay);
                }
                Err(e) if e.is_retryable() => {
                    warn!(op, attempts = attempt + 1, error = %e, "Write conflict, giving up");
                    return Err(StorageError::WriteConflict {
                        op: op.to_string(),
                        attempts: attempt + 1,
                    });
                }
                other => return other,
            }
        }
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            let cluster_count: i64 = message_clusters::table
                .count()
                .get_result(conn)
                .map_err(|e| StorageError::query("Count query failed", e))?;

            let clustered_entities: i64 = entities::table
                .filter(entities::cluster_id.is_not_null())
                .count()
                .get_result(conn)
                .map_err(|e| StorageError::query("Count query failed", e))?;

            let ledger_rows: i64 = message_cluster_statuses::table
                .count()
                .get_result(conn)
                .map_err(|e| StorageError::query("Count query failed", e))?;

            let by_status: Vec<(models::ClusterStatus, i64)> = message_clusters::table
                .group_by(message_clusters::latest_status)
                .select((message_clusters::latest_status, diesel::dsl::count_star()))
                .load(conn)
                .map_err(|e| StorageError::query("Stats query failed", e))?;

            Ok(DbStats {
                cluster_count: cluster_count as u64,
                clustered_entities: clustered_entities as u64,
                ledger_rows: ledger_rows as u64,
                by_status: by_status
                    .into_iter()
                    .map(|(status, n)| (status.as_str().to_string(), n as u64))
                    .collect(),
            })
        })
    }
}

fn build_pool(
    database_url: &str,
    max_size: u32,
    connection_timeout: Duration,
    options: ConnectionOptions,
) -> Result<DbPool, StorageError> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let mut builder = Pool::builder()
        .max_size(max_size)
        .connection_timeout(connection_timeout)
        .connection_customizer(Box::new(options));
    // A recycled `:memory:` connection would be a new, empty database
    if options.in_memory {
        builder = builder.idle_timeout(None).max_lifetime(None);
    }
    builder
        .build(manager)
        .map_err(|e| StorageError::Pool(format!("Failed to build pool: {}", e)))
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub cluster_count: u64,
    pub clustered_entities: u64,
    pub ledger_rows: u64,
    pub by_status: Vec<(String, u64)>,
}

// Re-exports
pub use models::{ClusterStatus, MessageCluster, MessageClusterStatus};
pub use ranking::{RankCursor, RankOrder, RankedPage};

#[cfg(test)]
pub(crate) fn test_conn() -> SqliteConnection {
    let mut conn =
        SqliteConnection::establish(":memory:").expect("Failed to create in-memory database");
    schema::init_schema(&mut conn).expect("Failed to create schema");
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_returns_non_retryable_errors_unchanged() {
        let db = ModerationDb::open_in_memory().unwrap();
        let mut calls = 0;
        let result: Result<(), _> = db.write("test", |_| {
            calls += 1;
            Err(StorageError::ClusterNotFound(9))
        });
        assert!(matches!(result, Err(StorageError::ClusterNotFound(9))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_write_retries_busy_then_surfaces_conflict() {
        let db = ModerationDb::open_in_memory().unwrap().with_retry_policy(RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        });
        let mut calls = 0;
        let result: Result<(), _> = db.write("test", |_| {
            calls += 1;
            Err(StorageError::Busy("database is locked".into()))
        });
        assert!(matches!(result, Err(StorageError::WriteConflict { attempts: 3, .. })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_write_recovers_after_transient_busy() {
        let db = ModerationDb::open_in_memory().unwrap().with_retry_policy(RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(1),
        });
        let mut calls = 0;
        let result = db.write("test", |_| {
            calls += 1;
            if calls < 3 {
                Err(StorageError::Busy("database is locked".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_in_memory_pool_is_never_recycled() {
        let db = ModerationDb::open_in_memory().unwrap();
        let state = db.pool.state();
        assert_eq!(state.connections, 1);
        assert_eq!(db.pool.idle_timeout(), None);
        assert_eq!(db.pool.max_lifetime(), None);

        // Schema survives across checkouts of the single connection
        db.with_conn(|conn| registry::register_entity(conn, 1)).unwrap();
        assert!(db.with_conn(|conn| registry::entity_exists(conn, 1)).unwrap());
    }

    #[test]
    fn test_stats_on_empty_db() {
        let db = ModerationDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.cluster_count, 0);
        assert_eq!(stats.ledger_rows, 0);
        assert!(stats.by_status.is_empty());
    }
}
