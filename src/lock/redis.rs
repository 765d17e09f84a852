use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use super::{DistributedMutex, LockError, LockOutcome};

const KEY_PREFIX: &str = "redeem_lock:";

// Deletes the marker only while it still carries the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Shared connection handle. Never locked across a connect, so a slow or
/// blackholed Redis only stalls the callers that are connecting.
#[derive(Debug)]
struct ConnectionSlot<C> {
    current: Mutex<Option<C>>,
}

impl<C: Clone> ConnectionSlot<C> {
    fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    async fn get_or_connect<F, Fut, E>(&self, connect: F) -> Result<C, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let conn = connect().await?;
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        // another caller may have connected meanwhile; keep the first one
        Ok(current.get_or_insert(conn).clone())
    }

    fn current(&self) -> Option<C> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn clear(&self) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Redis-backed mutex using `SET key <token> NX PX ttl`, released by a
/// compare-and-delete script.
///
/// The connection is opened lazily and dropped after a failed command, so a
/// Redis outage only degrades locking until Redis returns.
pub struct RedisMutex {
    client: ::redis::Client,
    conn: ConnectionSlot<MultiplexedConnection>,
}

impl RedisMutex {
    /// Parses the URL without connecting.
    pub fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = ::redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            conn: ConnectionSlot::new(),
        })
    }

    fn lock_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LockError> {
        let conn = self
            .conn
            .get_or_connect(move || async move {
                let conn = self.client.get_multiplexed_async_connection().await?;
                tracing::info!("Lock store connection established");
                Ok::<_, LockError>(conn)
            })
            .await?;
        Ok(conn)
    }
}

#[async_trait]
impl DistributedMutex for RedisMutex {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> LockOutcome {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Lock store connection failed");
                return LockOutcome::Unavailable;
            }
        };

        let ttl_ms = ttl.as_millis().max(1) as u64;
        let result: ::redis::RedisResult<Option<String>> = ::redis::cmd("SET")
            .arg(Self::lock_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => LockOutcome::Acquired,
            Ok(None) => LockOutcome::Contended,
            Err(e) => {
                tracing::warn!(error = %e, "Lock store SET NX failed");
                self.conn.clear();
                LockOutcome::Unavailable
            }
        }
    }

    async fn release(&self, key: &str, token: &str) {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Lock store unreachable on release; marker expires by TTL");
                return;
            }
        };

        let result: ::redis::RedisResult<i64> = ::redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(Self::lock_key(key))
            .arg(token)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(0) => tracing::debug!("Lock marker no longer ours; left in place"),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Lock store release failed; marker expires by TTL");
                self.conn.clear();
            }
        }
    }

    async fn ping(&self) -> Result<(), LockError> {
        let mut conn = self.connection().await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
