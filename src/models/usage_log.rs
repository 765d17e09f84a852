use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct UsageLogEntry {
    pub id: Uuid,
    pub code_id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageLogEntry {
    pub code_id: Uuid,
    pub ip_address: String,
    pub user_agent: String,
    pub success: bool,
    pub used_at: DateTime<Utc>,
}

impl UsageLogEntry {
    /// Appends a ledger row on the caller's transaction
    pub async fn append(conn: &mut PgConnection, data: &NewUsageLogEntry) -> Result<Self, sqlx::Error> {
        let entry = sqlx::query_as::<_, UsageLogEntry>(
            r#"
            INSERT INTO usage_logs (code_id, ip_address, user_agent, success, used_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(data.code_id)
        .bind(&data.ip_address)
        .bind(&data.user_agent)
        .bind(data.success)
        .bind(data.used_at)
        .fetch_one(conn)
        .await?;

        Ok(entry)
    }

    /// List ledger rows for a code, newest first
    pub async fn list_by_code(
        pool: &PgPool,
        code_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let entries = sqlx::query_as::<_, UsageLogEntry>(
            r#"
            SELECT * FROM usage_logs
            WHERE code_id = $1
            ORDER BY used_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(code_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        Ok(entries)
    }

    /// Count ledger rows for a code, optionally filtered by outcome
    pub async fn count_by_code(
        pool: &PgPool,
        code_id: Uuid,
        success: Option<bool>,
    ) -> Result<i64, sqlx::Error> {
        let count = if let Some(success) = success {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*) FROM usage_logs
                WHERE code_id = $1 AND success = $2
                "#,
            )
            .bind(code_id)
            .bind(success)
            .fetch_one(pool)
            .await?
        } else {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT COUNT(*) FROM usage_logs
                WHERE code_id = $1
                "#,
            )
            .bind(code_id)
            .fetch_one(pool)
            .await?
        };

        Ok(count)
    }
}
