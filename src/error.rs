//! Error types for message-cluster-store

use thiserror::Error;

/// Coarse error taxonomy exposed to callers.
///
/// `NotFound`, `InvalidInput` and `Restricted` reflect caller misuse and are
/// never retried. `Conflict` covers both deterministic conflicts (duplicate
/// leader, already a member) and lock contention that survived the bounded
/// write retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    Restricted,
    Internal,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(i64),

    #[error("Entity not found: {0}")]
    EntityNotFound(i64),

    #[error("Leader entity not found: {0}")]
    LeaderNotFound(i64),

    #[error("Actor not found: {0}")]
    ActorNotFound(i64),

    #[error("Entity {0} is not a member of any cluster")]
    NotAMember(i64),

    #[error("Entity {entity_id} already leads cluster {cluster_id}")]
    DuplicateLeader { entity_id: i64, cluster_id: i64 },

    #[error("Entity {entity_id} already belongs to cluster {cluster_id}")]
    AlreadyMember { entity_id: i64, cluster_id: i64 },

    #[error("Identifier already in use: {0}")]
    IdentifierTaken(String),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Write conflict on {op} after {attempts} attempts")]
    WriteConflict { op: String, attempts: u32 },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Actor {actor_id} is referenced by {ledger_rows} status ledger rows")]
    ActorRestricted { actor_id: i64, ledger_rows: i64 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Wrap a diesel error with a short description of the failed statement.
    ///
    /// Lock contention is kept distinguishable so the write path can retry it.
    pub fn query(context: &str, err: diesel::result::Error) -> Self {
        match classify(&err) {
            DbErrorClass::Busy => StorageError::Busy(format!("{}: {}", context, err)),
            DbErrorClass::Unique => StorageError::IdentifierTaken(format!("{}: {}", context, err)),
            DbErrorClass::Other => StorageError::Database(format!("{}: {}", context, err)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::ClusterNotFound(_)
            | StorageError::EntityNotFound(_)
            | StorageError::LeaderNotFound(_)
            | StorageError::ActorNotFound(_)
            | StorageError::NotAMember(_) => ErrorKind::NotFound,

            StorageError::DuplicateLeader { .. }
            | StorageError::AlreadyMember { .. }
            | StorageError::IdentifierTaken(_)
            | StorageError::Busy(_)
            | StorageError::WriteConflict { .. } => ErrorKind::Conflict,

            StorageError::InvalidStatus(_) | StorageError::InvalidInput(_) => {
                ErrorKind::InvalidInput
            }

            StorageError::ActorRestricted { .. } => ErrorKind::Restricted,

            StorageError::Database(_)
            | StorageError::Pool(_)
            | StorageError::Io(_)
            | StorageError::Config(_)
            | StorageError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only lock contention is worth a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

impl From<diesel::result::Error> for StorageError {
    fn from(err: diesel::result::Error) -> Self {
        StorageError::query("Transaction failed", err)
    }
}

impl From<diesel::r2d2::PoolError> for StorageError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        StorageError::Pool(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbErrorClass {
    Busy,
    Unique,
    Other,
}

fn classify(err: &diesel::result::Error) -> DbErrorClass {
    use diesel::result::{DatabaseErrorKind, Error};

    match err {
        Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => DbErrorClass::Unique,
        Error::DatabaseError(_, info) => classify_message(info.message()),
        other => classify_message(&other.to_string()),
    }
}

fn classify_message(message: &str) -> DbErrorClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("database is locked") || lower.contains("busy") {
        DbErrorClass::Busy
    } else {
        DbErrorClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(StorageError::ClusterNotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(StorageError::NotAMember(1).kind(), ErrorKind::NotFound);
        assert_eq!(
            StorageError::DuplicateLeader { entity_id: 1, cluster_id: 2 }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(StorageError::InvalidStatus("spam".into()).kind(), ErrorKind::InvalidInput);
        assert_eq!(
            StorageError::ActorRestricted { actor_id: 1, ledger_rows: 3 }.kind(),
            ErrorKind::Restricted
        );
        assert_eq!(StorageError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(StorageError::Busy("database is locked".into()).is_retryable());
        assert!(!StorageError::WriteConflict { op: "x".into(), attempts: 3 }.is_retryable());
        assert!(!StorageError::DuplicateLeader { entity_id: 1, cluster_id: 1 }.is_retryable());
    }

    #[test]
    fn test_classify_lock_messages() {
        assert_eq!(classify_message("database is locked"), DbErrorClass::Busy);
        assert_eq!(classify_message("SQLITE_BUSY: database busy"), DbErrorClass::Busy);
        assert_eq!(classify_message("no such table: foo"), DbErrorClass::Other);
    }
}
