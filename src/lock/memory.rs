use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{DistributedMutex, LockError, LockOutcome};

#[derive(Debug)]
struct Marker {
    token: String,
    expires_at: Instant,
}

/// Process-local mutex with the same TTL and token semantics as the Redis one.
#[derive(Debug, Default)]
pub struct MemoryMutex {
    held: Mutex<HashMap<String, Marker>>,
}

impl MemoryMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(key)
            .is_some_and(|marker| marker.expires_at > Instant::now())
    }
}

#[async_trait]
impl DistributedMutex for MemoryMutex {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> LockOutcome {
        let now = Instant::now();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.get(key) {
            Some(marker) if marker.expires_at > now => LockOutcome::Contended,
            _ => {
                held.insert(
                    key.to_string(),
                    Marker {
                        token: token.to_string(),
                        expires_at: now + ttl,
                    },
                );
                LockOutcome::Acquired
            }
        }
    }

    async fn release(&self, key: &str, token: &str) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(key).is_some_and(|marker| marker.token == token) {
            held.remove(key);
        }
    }

    async fn ping(&self) -> Result<(), LockError> {
        Ok(())
    }
}

/// Stand-in used when no lock store is configured: every acquisition
/// reports [`LockOutcome::Unavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMutex;

#[async_trait]
impl DistributedMutex for NoopMutex {
    async fn acquire(&self, _key: &str, _token: &str, _ttl: Duration) -> LockOutcome {
        LockOutcome::Unavailable
    }

    async fn release(&self, _key: &str, _token: &str) {}

    async fn ping(&self) -> Result<(), LockError> {
        Err(LockError::NotConfigured)
    }
}
