use secrecy::Secret;
use std::time::Duration;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 3;
const DEFAULT_LOCK_TTL_SECS: u64 = 10;
const DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS: u64 = 500;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Secret<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,

    // Lock store (Redis). Absent means redemptions run without a distributed mutex.
    pub redis_url: Option<Secret<String>>,
    pub lock_ttl_secs: u64,
    pub lock_acquire_timeout_ms: u64,

    // Upper bound for a single read or for the whole redemption transaction
    pub store_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        Self::from_config(&config)
    }

    pub fn from_config(config: &config::Config) -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: Secret::new(config.get("database_url")?),
            db_max_connections: config
                .get("db_max_connections")
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
            db_acquire_timeout_secs: config
                .get("db_acquire_timeout_secs")
                .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),

            redis_url: config
                .get::<String>("redis_url")
                .ok()
                .filter(|url| !url.trim().is_empty())
                .map(Secret::new),
            lock_ttl_secs: config.get("lock_ttl_secs").unwrap_or(DEFAULT_LOCK_TTL_SECS),
            lock_acquire_timeout_ms: config
                .get("lock_acquire_timeout_ms")
                .unwrap_or(DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS),

            store_timeout_ms: config
                .get("store_timeout_ms")
                .unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
        })
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.db_acquire_timeout_secs)
    }
}
