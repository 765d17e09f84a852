use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{prepare_new_code, CodeStore, CodeTransaction, StoreError};
use crate::models::{
    normalize_code, ActivationCode, NewActivationCode, NewUsageLogEntry, RedemptionUpdate,
    UsageLogEntry,
};

/// Postgres-backed code store
#[derive(Clone)]
pub struct PgCodeStore {
    pool: PgPool,
}

impl PgCodeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub struct PgCodeTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CodeStore for PgCodeStore {
    async fn find_by_code(&self, code: &str) -> Result<Option<ActivationCode>, StoreError> {
        Ok(ActivationCode::find_by_code(&self.pool, code).await?)
    }

    async fn begin(&self) -> Result<Box<dyn CodeTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgCodeTransaction { tx }))
    }

    #[tracing::instrument(skip(self, data), fields(total_uses = data.total_uses))]
    async fn create(&self, data: NewActivationCode) -> Result<ActivationCode, StoreError> {
        let data = prepare_new_code(data)?;
        let created = ActivationCode::create(&self.pool, &data).await?;
        tracing::info!(code_id = %created.id, "Activation code created");
        Ok(created)
    }

    async fn deactivate(&self, code: &str) -> Result<bool, StoreError> {
        let Some(code) = normalize_code(code) else {
            return Ok(false);
        };
        Ok(ActivationCode::deactivate(&self.pool, &code).await?)
    }

    async fn set_expiry(
        &self,
        code: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let Some(code) = normalize_code(code) else {
            return Ok(false);
        };
        Ok(ActivationCode::set_expiry(&self.pool, &code, expires_at).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        crate::db::ping(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CodeTransaction for PgCodeTransaction {
    async fn fetch_for_update(&mut self, id: Uuid) -> Result<Option<ActivationCode>, StoreError> {
        Ok(ActivationCode::fetch_for_update(&mut *self.tx, id).await?)
    }

    async fn apply_redemption(&mut self, update: &RedemptionUpdate) -> Result<bool, StoreError> {
        Ok(ActivationCode::apply_redemption(&mut *self.tx, update).await?)
    }

    async fn append_usage(&mut self, entry: &NewUsageLogEntry) -> Result<(), StoreError> {
        UsageLogEntry::append(&mut *self.tx, entry).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
