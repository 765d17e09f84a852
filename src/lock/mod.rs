//! Distributed mutex keyed by activation code.
//!
//! Acquisition never fails with an error: a lock store that cannot be reached
//! reports [`LockOutcome::Unavailable`] and the caller decides how to proceed.
//!
//! Every attempt carries its own token. The marker stores it, and release
//! clears the marker only while it still holds that token, so a late or
//! expired holder can never remove someone else's lock.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::{MemoryMutex, NoopMutex};
pub use self::redis::RedisMutex;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Lock store not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The marker was set by this caller and must be released.
    Acquired,
    /// Another holder currently owns the marker.
    Contended,
    /// The lock store could not be reached; no exclusivity is held.
    Unavailable,
}

#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Sets the marker for `key` to `token` if absent; it expires after `ttl`
    /// even if never released.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> LockOutcome;

    /// Clears the marker for `key` if it still holds `token`. Failures are
    /// logged.
    async fn release(&self, key: &str, token: &str);

    async fn ping(&self) -> Result<(), LockError>;
}
