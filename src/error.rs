use thiserror::Error;

use crate::lock::LockError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Code store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock store error: {0}")]
    Lock(#[from] LockError),

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
