use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::lock::{DistributedMutex, LockError};
use crate::store::CodeStore;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub database: ServiceHealth,
    pub lock_store: ServiceHealth,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    pub response_time_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    /// The database must be reachable; the lock store may be down, which
    /// only degrades redemption to transactional serialization.
    pub fn is_serving(&self) -> bool {
        self.status != "unhealthy"
    }
}

/// Checks both backing stores.
///
/// Overall status is `healthy` when both respond, `degraded` when only the
/// database does, `unhealthy` when the database is down. Each probe that
/// takes longer than `limit` counts as down.
pub async fn check(
    store: &dyn CodeStore,
    mutex: &dyn DistributedMutex,
    limit: Duration,
) -> HealthReport {
    let start = Instant::now();

    let (database, lock_store) =
        tokio::join!(check_database(store, limit), check_lock_store(mutex, limit));

    let status = match (database.status.as_str(), lock_store.status.as_str()) {
        ("healthy", "healthy") => "healthy",
        ("healthy", _) => "degraded",
        _ => "unhealthy",
    };

    let report = HealthReport {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dependencies: DependencyStatus {
            database,
            lock_store,
        },
    };

    tracing::info!(
        status = %report.status,
        duration_ms = start.elapsed().as_millis(),
        "Health check completed"
    );

    report
}

async fn check_database(store: &dyn CodeStore, limit: Duration) -> ServiceHealth {
    let start = Instant::now();

    match timeout(limit, store.ping()).await {
        Err(_) => ServiceHealth {
            status: "unhealthy".to_string(),
            response_time_ms: start.elapsed().as_millis(),
            error: Some(format!("Database did not respond within {:?}", limit)),
        },
        Ok(Ok(())) => ServiceHealth {
            status: "healthy".to_string(),
            response_time_ms: start.elapsed().as_millis(),
            error: None,
        },
        Ok(Err(e)) => ServiceHealth {
            status: "unhealthy".to_string(),
            response_time_ms: start.elapsed().as_millis(),
            error: Some(format!("Database error: {}", e)),
        },
    }
}

async fn check_lock_store(mutex: &dyn DistributedMutex, limit: Duration) -> ServiceHealth {
    let start = Instant::now();

    match timeout(limit, mutex.ping()).await {
        Err(_) => ServiceHealth {
            status: "unhealthy".to_string(),
            response_time_ms: start.elapsed().as_millis(),
            error: Some(format!("Lock store did not respond within {:?}", limit)),
        },
        Ok(Ok(())) => ServiceHealth {
            status: "healthy".to_string(),
            response_time_ms: start.elapsed().as_millis(),
            error: None,
        },
        Ok(Err(LockError::NotConfigured)) => ServiceHealth {
            status: "not_configured".to_string(),
            response_time_ms: 0,
            error: Some("Lock store not configured".to_string()),
        },
        Ok(Err(e)) => ServiceHealth {
            status: "unhealthy".to_string(),
            response_time_ms: start.elapsed().as_millis(),
            error: Some(format!("Lock store error: {}", e)),
        },
    }
}
