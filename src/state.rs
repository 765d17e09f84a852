use secrecy::ExposeSecret;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::health::{self, HealthReport};
use crate::lock::{DistributedMutex, NoopMutex, RedisMutex};
use crate::services::{RedemptionCoordinator, RedemptionSettings};
use crate::store::{CodeStore, PgCodeStore};

/// Process-wide backing-store handles.
///
/// Created once at startup, injected into the coordinator, and closed on
/// shutdown.
#[derive(Clone)]
pub struct AppResources {
    pub pool: sqlx::PgPool,
    pub store: Arc<dyn CodeStore>,
    pub mutex: Arc<dyn DistributedMutex>,
    pub config: Config,
}

impl AppResources {
    /// Connects to Postgres, applies migrations and prepares the lock store.
    ///
    /// A missing or malformed Redis URL does not fail startup; redemptions
    /// then run on transactional serialization only.
    pub async fn init(config: Config) -> Result<Self> {
        let pool = db::create_pool(
            config.database_url.expose_secret(),
            config.db_max_connections,
            config.db_acquire_timeout(),
            config.store_timeout(),
        )
        .await?;
        tracing::info!("Database pool created");

        db::run_migrations(&pool).await?;
        tracing::info!("Database migrations completed");

        let mutex: Arc<dyn DistributedMutex> = match &config.redis_url {
            Some(url) => match RedisMutex::new(url.expose_secret()) {
                Ok(mutex) => {
                    tracing::info!("Redis lock store configured");
                    Arc::new(mutex)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid lock store URL, redemptions run without distributed mutex");
                    Arc::new(NoopMutex)
                }
            },
            None => {
                tracing::warn!("No lock store configured, redemptions run without distributed mutex");
                Arc::new(NoopMutex)
            }
        };

        Ok(Self {
            store: Arc::new(PgCodeStore::new(pool.clone())),
            pool,
            mutex,
            config,
        })
    }

    pub fn coordinator(&self) -> RedemptionCoordinator {
        RedemptionCoordinator::new(
            self.store.clone(),
            self.mutex.clone(),
            RedemptionSettings::from(&self.config),
        )
    }

    pub async fn health(&self) -> HealthReport {
        health::check(
            self.store.as_ref(),
            self.mutex.as_ref(),
            self.config.store_timeout(),
        )
        .await
    }

    pub async fn shutdown(self) {
        tracing::info!("Closing database pool");
        self.pool.close().await;
    }
}
