//! Metadata cache rows: the generic `api_cache` table and `static_data`.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{CacheCounts, Database, StaticDataRow};

impl Database {
    /// Fetch a cached payload that has not expired at `now`
    ///
    /// Expired rows are left in place for the cleanup sweep.
    pub async fn get_cached_response(&self, cache_key: &str, now: i64) -> Result<Option<Vec<u8>>> {
        let data: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT data FROM api_cache WHERE cache_key = ? AND expires_at > ?",
        )
        .bind(cache_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read cache entry: {}",
                e
            )))
        })?;

        Ok(data)
    }

    /// Insert or refresh a cached payload
    pub async fn put_cached_response(
        &self,
        cache_key: &str,
        endpoint: &str,
        data: &[u8],
        expires_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_cache (cache_key, endpoint, data, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                endpoint = excluded.endpoint,
                data = excluded.data,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(cache_key)
        .bind(endpoint)
        .bind(data)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write cache entry: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Delete generic cache rows whose `expires_at` is at or before `now`
    ///
    /// Returns the number of rows removed. Static-data rows are never touched.
    pub async fn delete_expired_responses(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM api_cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete expired cache entries: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Fetch a static-data row regardless of age
    pub async fn get_static_data(&self, data_key: &str) -> Result<Option<StaticDataRow>> {
        let row = sqlx::query_as::<_, StaticDataRow>(
            "SELECT data_key, endpoint, data, updated_at FROM static_data WHERE data_key = ?",
        )
        .bind(data_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read static data: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Insert or replace a static-data row
    pub async fn put_static_data(
        &self,
        data_key: &str,
        endpoint: &str,
        data: &[u8],
        updated_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO static_data (data_key, endpoint, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(data_key) DO UPDATE SET
                endpoint = excluded.endpoint,
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(data_key)
        .bind(endpoint)
        .bind(data)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write static data: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Row counts of both cache tables
    pub async fn cache_counts(&self, now: i64) -> Result<CacheCounts> {
        let (entries, expired): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN expires_at <= ? THEN 1 ELSE 0 END), 0) FROM api_cache",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count cache entries: {}",
                e
            )))
        })?;

        let static_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM static_data")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count static data: {}",
                    e
                )))
            })?;

        Ok(CacheCounts {
            entries,
            expired,
            static_entries,
        })
    }
}
