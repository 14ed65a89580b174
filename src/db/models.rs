//! Diesel model definitions for database tables
//!
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT queries (writing data)

use std::fmt;
use std::str::FromStr;

use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};

use super::diesel_schema::*;
use crate::error::StorageError;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns.
///
/// Fixed-width microsecond precision keeps lexical order equal to time order.
pub fn current_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

// ============================================================================
// Cluster Status
// ============================================================================

/// Moderation status of a cluster. Closed set; unknown values are rejected
/// when parsed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Blacklisted,
    Whitelisted,
    Unclassified,
    Hidden,
}

impl ClusterStatus {
    pub const ALL: [ClusterStatus; 4] = [
        ClusterStatus::Blacklisted,
        ClusterStatus::Whitelisted,
        ClusterStatus::Unclassified,
        ClusterStatus::Hidden,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Blacklisted => "blacklisted",
            ClusterStatus::Whitelisted => "whitelisted",
            ClusterStatus::Unclassified => "unclassified",
            ClusterStatus::Hidden => "hidden",
        }
    }
}

impl Default for ClusterStatus {
    fn default() -> Self {
        ClusterStatus::Unclassified
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blacklisted" => Ok(ClusterStatus::Blacklisted),
            "whitelisted" => Ok(ClusterStatus::Whitelisted),
            "unclassified" => Ok(ClusterStatus::Unclassified),
            "hidden" => Ok(ClusterStatus::Hidden),
            other => Err(StorageError::InvalidStatus(format!(
                "{}. Valid statuses: {:?}",
                other,
                ClusterStatus::ALL.map(|s| s.as_str())
            ))),
        }
    }
}

impl ToSql<Text, Sqlite> for ClusterStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_str());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for ClusterStatus {
    fn from_sql(bytes: <Sqlite as Backend>::RawValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Sqlite>>::from_sql(bytes)?;
        raw.parse::<ClusterStatus>()
            .map_err(|e| e.to_string().into())
    }
}

// ============================================================================
// Message Cluster Models
// ============================================================================

/// Cluster row from SELECT query
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = message_clusters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MessageCluster {
    pub id: i64,
    pub leader_entity_id: i64,
    pub entity_count: i32,
    pub report_count: i32,
    pub last_reported_at: Option<String>,
    pub latest_status: ClusterStatus,
    pub latest_status_at: String,
    pub created_at: String,
    pub updated_at: String,
}

/// New cluster for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = message_clusters)]
pub struct NewMessageCluster<'a> {
    pub leader_entity_id: i64,
    pub entity_count: i32,
    pub report_count: i32,
    pub latest_status: ClusterStatus,
    pub latest_status_at: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

// ============================================================================
// Status Ledger Models
// ============================================================================

/// Ledger row. Status and `created_at` never change once written; only an
/// actor rename rewrites `actor_id` and bumps `updated_at`.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = message_cluster_statuses)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MessageClusterStatus {
    pub id: i64,
    pub message_cluster_id: i64,
    pub status: ClusterStatus,
    pub actor_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// New ledger row for INSERT
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = message_cluster_statuses)]
pub struct NewMessageClusterStatus<'a> {
    pub message_cluster_id: i64,
    pub status: ClusterStatus,
    pub actor_id: i64,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

// ============================================================================
// Registry Models (collaborator-owned tables)
// ============================================================================

/// Entity row, as far as the cluster engine cares about it
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = entities)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Entity {
    pub id: i64,
    pub cluster_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = entities)]
pub struct NewEntity<'a> {
    pub id: i64,
    pub cluster_id: Option<i64>,
    pub created_at: &'a str,
}

/// Actor (user) row
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Actor {
    pub id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewActor<'a> {
    pub id: i64,
    pub created_at: &'a str,
}
