//! Code store: persisted quota state for activation codes.
//!
//! Reads used for the fast pre-check go through [`CodeStore::find_by_code`].
//! Every mutation made by a redemption happens inside a [`CodeTransaction`],
//! which owns the authoritative row read, the counter update and the ledger
//! insert. Dropping a transaction without committing rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ActivationCode, NewActivationCode, NewUsageLogEntry, RedemptionUpdate};

pub mod memory;
pub mod postgres;

pub use memory::MemoryCodeStore;
pub use postgres::PgCodeStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid activation code data: {0}")]
    InvalidData(String),
}

#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Looks up a code by its normalized value, outside any transaction.
    async fn find_by_code(&self, code: &str) -> Result<Option<ActivationCode>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn CodeTransaction>, StoreError>;

    /// Provisions a new code with `used_count = 0` and its full quota remaining.
    async fn create(&self, data: NewActivationCode) -> Result<ActivationCode, StoreError>;

    async fn deactivate(&self, code: &str) -> Result<bool, StoreError>;

    async fn set_expiry(
        &self,
        code: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CodeTransaction: Send {
    /// Authoritative read of a code; the row stays locked until commit or rollback.
    async fn fetch_for_update(&mut self, id: Uuid) -> Result<Option<ActivationCode>, StoreError>;

    /// Returns false when the row no longer exists or has no uses left.
    async fn apply_redemption(&mut self, update: &RedemptionUpdate) -> Result<bool, StoreError>;

    /// Usage ledger insert, visible only if the transaction commits.
    async fn append_usage(&mut self, entry: &NewUsageLogEntry) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Normalizes and checks provisioning input shared by every store.
pub(crate) fn prepare_new_code(mut data: NewActivationCode) -> Result<NewActivationCode, StoreError> {
    data.code = crate::models::normalize_code(&data.code)
        .ok_or_else(|| StoreError::InvalidData(format!("malformed code {:?}", data.code)))?;
    if data.total_uses <= 0 {
        return Err(StoreError::InvalidData(format!(
            "total_uses must be positive, got {}",
            data.total_uses
        )));
    }
    Ok(data)
}
