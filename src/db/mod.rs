//! Database layer for download-relay
//!
//! Only the metadata cache is persisted; download records live in memory and
//! are rebuilt by the next poll.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`cache`] - Generic response cache and static-data rows

use sqlx::{FromRow, sqlite::SqlitePool};

mod cache;
mod migrations;

/// Static-data row (read path checks staleness against `updated_at`)
#[derive(Debug, Clone, FromRow)]
pub struct StaticDataRow {
    /// Lookup key
    pub data_key: String,
    /// Upstream endpoint the data came from
    pub endpoint: String,
    /// Opaque payload
    pub data: Vec<u8>,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

/// Row counts of the cache tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounts {
    /// Rows in the generic cache
    pub entries: i64,
    /// Generic rows past `expires_at`, waiting for the cleanup sweep
    pub expired: i64,
    /// Rows in the static-data table
    pub static_entries: i64,
}

/// Database handle for download-relay
pub struct Database {
    pool: SqlitePool,
}
