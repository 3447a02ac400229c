//! SQLite implementation of the workflow session store.
//!
//! Every conditional write is a single statement, so the version check and the write cannot be
//! interleaved by another connection. Expired rows stay invisible to reads and are reclaimed by
//! `purge_expired`.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use renewdesk_core::workflow::{SessionStore, StoreError, VersionedDocument};

use super::RepositoryError;
use crate::DbPool;

pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn purge_expired_rows(&self) -> Result<u64, RepositoryError> {
        let now = now_ms();
        let documents = sqlx::query("DELETE FROM workflow_document WHERE expires_at_ms <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let members = sqlx::query("DELETE FROM workflow_index_member WHERE expires_at_ms <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::debug!(
            event_name = "db.session_store.purged",
            documents,
            members,
            "expired workflow rows purged"
        );
        Ok(documents + members)
    }

    async fn live_version(&self, key: &str, now: i64) -> Result<u64, RepositoryError> {
        let row = sqlx::query(
            "SELECT version FROM workflow_document WHERE doc_key = ? AND expires_at_ms > ?",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode_version(row.try_get("version")?),
            None => Ok(0),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn decode_version(raw: i64) -> Result<u64, RepositoryError> {
    u64::try_from(raw).map_err(|_| RepositoryError::Decode(format!("negative version {raw}")))
}

fn encode_version(version: u64) -> Result<i64, RepositoryError> {
    i64::try_from(version)
        .map_err(|_| RepositoryError::Decode(format!("version {version} exceeds storage range")))
}

fn encode_body(body: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(body).map_err(|error| RepositoryError::Decode(error.to_string()))
}

#[async_trait::async_trait]
impl SessionStore for SqlSessionStore {
    async fn put(&self, key: &str, body: &Value, ttl: Duration) -> Result<u64, StoreError> {
        let now = now_ms();
        let row = sqlx::query(
            "INSERT INTO workflow_document (doc_key, body_json, version, expires_at_ms)
             VALUES (?, ?, 1, ?)
             ON CONFLICT(doc_key) DO UPDATE SET
                body_json = excluded.body_json,
                version = CASE
                    WHEN workflow_document.expires_at_ms > ? THEN workflow_document.version + 1
                    ELSE 1
                END,
                expires_at_ms = excluded.expires_at_ms
             RETURNING version",
        )
        .bind(key)
        .bind(encode_body(body)?)
        .bind(expiry_ms(now, ttl))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let version = row.try_get::<i64, _>("version").map_err(RepositoryError::from)?;
        Ok(decode_version(version)?)
    }

    async fn put_if_version(
        &self,
        key: &str,
        body: &Value,
        expected_version: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = now_ms();
        let encoded = encode_body(body)?;
        let expires_at = expiry_ms(now, ttl);

        let written = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO workflow_document (doc_key, body_json, version, expires_at_ms)
                 VALUES (?, ?, 1, ?)
                 ON CONFLICT(doc_key) DO UPDATE SET
                    body_json = excluded.body_json,
                    version = 1,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE workflow_document.expires_at_ms <= ?",
            )
            .bind(key)
            .bind(&encoded)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                "UPDATE workflow_document
                 SET body_json = ?, version = version + 1, expires_at_ms = ?
                 WHERE doc_key = ? AND version = ? AND expires_at_ms > ?",
            )
            .bind(&encoded)
            .bind(expires_at)
            .bind(key)
            .bind(encode_version(expected_version)?)
            .bind(now)
            .execute(&self.pool)
            .await
        }
        .map_err(RepositoryError::from)?;

        if written.rows_affected() == 1 {
            return Ok(expected_version + 1);
        }

        let actual = self.live_version(key, now).await?;
        Err(StoreError::VersionConflict { key: key.to_string(), expected: expected_version, actual })
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedDocument>, StoreError> {
        let row = sqlx::query(
            "SELECT body_json, version
             FROM workflow_document
             WHERE doc_key = ? AND expires_at_ms > ?",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body_json: String = row.try_get("body_json").map_err(RepositoryError::from)?;
        let version: i64 = row.try_get("version").map_err(RepositoryError::from)?;
        let body = serde_json::from_str(&body_json)
            .map_err(|error| StoreError::Decode(format!("document `{key}`: {error}")))?;

        Ok(Some(VersionedDocument { body, version: decode_version(version)? }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = sqlx::query(
            "DELETE FROM workflow_document WHERE doc_key = ? AND expires_at_ms > ?",
        )
        .bind(key)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .rows_affected();
        Ok(removed > 0)
    }

    async fn add_to_index(
        &self,
        owner_key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workflow_index_member (owner_key, member, expires_at_ms)
             VALUES (?, ?, ?)
             ON CONFLICT(owner_key, member) DO UPDATE SET
                expires_at_ms = excluded.expires_at_ms",
        )
        .bind(owner_key)
        .bind(member)
        .bind(expiry_ms(now_ms(), ttl))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn remove_from_index(&self, owner_key: &str, member: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workflow_index_member WHERE owner_key = ? AND member = ?")
            .bind(owner_key)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn list_index(&self, owner_key: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT member
             FROM workflow_index_member
             WHERE owner_key = ? AND expires_at_ms > ?
             ORDER BY member ASC",
        )
        .bind(owner_key)
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("member")
                    .map_err(|error| StoreError::from(RepositoryError::from(error)))
            })
            .collect()
    }

    async fn delete_index(&self, owner_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workflow_index_member WHERE owner_key = ?")
            .bind(owner_key)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        Ok(self.purge_expired_rows().await?)
    }
}
