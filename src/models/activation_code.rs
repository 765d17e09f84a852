use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

/// Longest code accepted after normalization.
pub const MAX_CODE_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ActivationCode {
    pub id: Uuid,
    pub code: String, // stored normalized: trimmed, upper-cased
    pub total_uses: i32,
    pub used_count: i32,
    pub remaining_uses: i32,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_user_ip: Option<String>,
    pub last_user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewActivationCode {
    pub code: String,
    pub total_uses: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Field values written by a successful redemption.
#[derive(Debug, Clone)]
pub struct RedemptionUpdate {
    pub id: Uuid,
    pub used_count: i32,
    pub remaining_uses: i32,
    pub used_at: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
}

/// Whether a code can be redeemed at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usability {
    Usable,
    Inactive,
    Expired,
    Exhausted,
}

/// Trims and upper-cases a raw code.
///
/// Returns `None` for input that is empty after trimming, longer than
/// [`MAX_CODE_LEN`], or contains whitespace or control characters.
pub fn normalize_code(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_CODE_LEN {
        return None;
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return None;
    }
    Some(trimmed.to_uppercase())
}

impl ActivationCode {
    /// Checks status, expiry and remaining quota, in that order.
    ///
    /// A code whose `expires_at` equals `now` is already expired.
    pub fn usability(&self, now: DateTime<Utc>) -> Usability {
        if !self.is_active {
            return Usability::Inactive;
        }
        if self.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Usability::Expired;
        }
        if self.remaining_uses <= 0 {
            return Usability::Exhausted;
        }
        Usability::Usable
    }

    /// Finds a code by its normalized value
    pub async fn find_by_code(pool: &PgPool, code: &str) -> Result<Option<Self>, sqlx::Error> {
        let found = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM activation_codes WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(pool)
        .await?;

        Ok(found)
    }

    /// Creates a new code with its full quota remaining
    pub async fn create(pool: &PgPool, data: &NewActivationCode) -> Result<Self, sqlx::Error> {
        let created = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO activation_codes (code, total_uses, used_count, remaining_uses, is_active, expires_at)
            VALUES ($1, $2, 0, $2, true, $3)
            RETURNING *
            "#,
        )
        .bind(&data.code)
        .bind(data.total_uses)
        .bind(data.expires_at)
        .fetch_one(pool)
        .await?;

        Ok(created)
    }

    /// Deactivates a code permanently. Returns false when no row matched.
    pub async fn deactivate(pool: &PgPool, code: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE activation_codes SET is_active = false WHERE code = $1
            "#,
        )
        .bind(code)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_expiry(
        pool: &PgPool,
        code: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE activation_codes SET expires_at = $2 WHERE code = $1
            "#,
        )
        .bind(code)
        .bind(expires_at)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Reads a code by id and locks its row until the transaction ends
    pub async fn fetch_for_update(
        conn: &mut PgConnection,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        let found = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM activation_codes WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;

        Ok(found)
    }

    /// Writes the post-redemption counters and last-use metadata.
    /// Returns false when the row no longer exists or has no uses left.
    pub async fn apply_redemption(
        conn: &mut PgConnection,
        update: &RedemptionUpdate,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE activation_codes
            SET
                used_count = $2,
                remaining_uses = $3,
                last_used_at = $4,
                last_user_ip = $5,
                last_user_agent = $6
            WHERE id = $1 AND remaining_uses > 0
            "#,
        )
        .bind(update.id)
        .bind(update.used_count)
        .bind(update.remaining_uses)
        .bind(update.used_at)
        .bind(&update.ip)
        .bind(&update.user_agent)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
