//! Local state persistence: the audit log and the oneshot query-state store
//! (`qid` -> generated SQL), both on the embedded sqlite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use utoipa::ToSchema;

use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditLogEntry {
    pub id: i64,
    pub qid: String,
    pub user_name: Option<String>,
    pub question: Option<String>,
    pub sql: String,
    /// `success` or `error`
    pub outcome: String,
    pub error: Option<String>,
    pub elapsed_ms: i64,
    pub created_at: DateTime<Utc>,
}

pub struct AuditService {
    pool: SqlitePool,
}

impl AuditService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        qid: &str,
        user_name: Option<&str>,
        question: Option<&str>,
        sql: &str,
        outcome: &str,
        error: Option<&str>,
        elapsed_ms: u64,
    ) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO audit_logs (qid, user_name, question, sql, outcome, error, elapsed_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(qid)
        .bind(user_name)
        .bind(question)
        .bind(sql)
        .bind(outcome)
        .bind(error)
        .bind(elapsed_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self, limit: i64) -> ApiResult<Vec<AuditLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, qid, user_name, question, sql, outcome, error, elapsed_ms, created_at \
             FROM audit_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(AuditLogEntry {
                id: row.try_get("id")?,
                qid: row.try_get("qid")?,
                user_name: row.try_get("user_name")?,
                question: row.try_get("question")?,
                sql: row.try_get("sql")?,
                outcome: row.try_get("outcome")?,
                error: row.try_get("error")?,
                elapsed_ms: row.try_get("elapsed_ms")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(entries)
    }

    pub async fn delete(&self, id: i64) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::not_found(format!("audit log {}", id)));
        }
        Ok(())
    }
}

/// Oneshot result state addressed by opaque qid, consumed by `/query/run`.
pub struct QueryStateStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct StoredQuery {
    pub qid: String,
    pub question: String,
    pub sql: String,
    pub user_name: Option<String>,
}

impl QueryStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save(
        &self,
        qid: &str,
        question: &str,
        sql: &str,
        user_name: Option<&str>,
    ) -> ApiResult<()> {
        sqlx::query(
            "INSERT INTO query_state (qid, question, sql, user_name) VALUES (?, ?, ?, ?) \
             ON CONFLICT(qid) DO UPDATE SET question = excluded.question, sql = excluded.sql, \
             user_name = excluded.user_name",
        )
        .bind(qid)
        .bind(question)
        .bind(sql)
        .bind(user_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, qid: &str) -> ApiResult<StoredQuery> {
        let row = sqlx::query(
            "SELECT qid, question, sql, user_name FROM query_state WHERE qid = ?",
        )
        .bind(qid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::QueryNotFound { qid: qid.to_string() })?;
        Ok(StoredQuery {
            qid: row.try_get("qid")?,
            question: row.try_get("question")?,
            sql: row.try_get("sql")?,
            user_name: row.try_get("user_name")?,
        })
    }
}
