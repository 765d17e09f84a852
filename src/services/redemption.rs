use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::Instrument;
use uuid::Uuid;

use crate::caller::CallerContext;
use crate::config::Config;
use crate::lock::{DistributedMutex, LockOutcome};
use crate::metrics;
use crate::models::{
    normalize_code, ActivationCode, NewUsageLogEntry, RedemptionUpdate, Usability,
};
use crate::store::{CodeStore, CodeTransaction, StoreError};

/// Why a redemption or validation was refused.
///
/// The display text is the user-facing message; backing-store detail is
/// only ever logged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionErrorKind {
    #[error("Activation code is required")]
    InvalidInput,

    #[error("Activation code is invalid or has been deactivated")]
    CodeInvalid,

    #[error("Activation code has expired")]
    CodeExpired,

    #[error("Activation code has no remaining uses")]
    QuotaExhausted,

    #[error("Another redemption for this code is in progress, please retry shortly")]
    TooManyRequests,

    /// Nothing was written, except after a failed commit, where the
    /// decrement may or may not have been applied.
    #[error("Service temporarily unavailable, please retry")]
    BackingStoreUnavailable,
}

impl RedemptionErrorKind {
    /// Stable identifier for logs, metrics and API payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionErrorKind::InvalidInput => "invalid_input",
            RedemptionErrorKind::CodeInvalid => "code_invalid",
            RedemptionErrorKind::CodeExpired => "code_expired",
            RedemptionErrorKind::QuotaExhausted => "quota_exhausted",
            RedemptionErrorKind::TooManyRequests => "too_many_requests",
            RedemptionErrorKind::BackingStoreUnavailable => "backing_store_unavailable",
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RedemptionErrorKind::TooManyRequests | RedemptionErrorKind::BackingStoreUnavailable
        )
    }

    /// Status code for collaborators that expose redemption over HTTP
    pub fn http_status(&self) -> StatusCode {
        match self {
            RedemptionErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            RedemptionErrorKind::CodeInvalid
            | RedemptionErrorKind::CodeExpired
            | RedemptionErrorKind::QuotaExhausted => StatusCode::FORBIDDEN,
            RedemptionErrorKind::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            RedemptionErrorKind::BackingStoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn from_usability(usability: Usability) -> Option<Self> {
        match usability {
            Usability::Usable => None,
            Usability::Inactive => Some(RedemptionErrorKind::CodeInvalid),
            Usability::Expired => Some(RedemptionErrorKind::CodeExpired),
            Usability::Exhausted => Some(RedemptionErrorKind::QuotaExhausted),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Success,
    /// Bad, expired, exhausted or inactive code, or empty input. Do not retry.
    ClientError,
    /// Lock contention or backing-store failure. Safe to retry.
    TransientError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<RedemptionErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_uses: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_uses: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_count: Option<i32>,
}

impl RedemptionResult {
    pub fn rejected(kind: RedemptionErrorKind) -> Self {
        Self {
            success: false,
            message: kind.to_string(),
            error_kind: Some(kind),
            remaining_uses: None,
            total_uses: None,
            used_count: None,
        }
    }

    fn valid(code: &ActivationCode) -> Self {
        Self {
            success: true,
            message: "Activation code is valid".to_string(),
            error_kind: None,
            remaining_uses: Some(code.remaining_uses),
            total_uses: None,
            used_count: None,
        }
    }

    fn redeemed(update: &RedemptionUpdate, total_uses: i32) -> Self {
        Self {
            success: true,
            message: "Activation code redeemed".to_string(),
            error_kind: None,
            remaining_uses: Some(update.remaining_uses),
            total_uses: Some(total_uses),
            used_count: Some(update.used_count),
        }
    }

    pub fn outcome_class(&self) -> OutcomeClass {
        match self.error_kind {
            None => OutcomeClass::Success,
            Some(kind) if kind.is_retriable() => OutcomeClass::TransientError,
            Some(_) => OutcomeClass::ClientError,
        }
    }

    fn outcome_label(&self) -> &'static str {
        self.error_kind.map_or("success", |kind| kind.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RedemptionSettings {
    pub lock_ttl: Duration,
    pub lock_acquire_timeout: Duration,
    pub store_timeout: Duration,
}

impl Default for RedemptionSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            lock_acquire_timeout: Duration::from_millis(500),
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for RedemptionSettings {
    fn from(config: &Config) -> Self {
        Self {
            lock_ttl: config.lock_ttl(),
            lock_acquire_timeout: config.lock_acquire_timeout(),
            store_timeout: config.store_timeout(),
        }
    }
}

/// Outcome of the locked transaction before its commit.
enum Staged {
    /// Re-check failed; the transaction was rolled back.
    Rejected(RedemptionErrorKind),
    /// Decrement and ledger row written, awaiting commit.
    Ready(Box<dyn CodeTransaction>, RedemptionResult),
}

/// What the redemption holds after trying the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockHold {
    Exclusive,
    // Proceeding on the transactional re-check alone. `may_be_set` covers an
    // acquire that timed out after the store may already have set our marker.
    Degraded { may_be_set: bool },
}

impl LockHold {
    fn must_release(&self) -> bool {
        matches!(
            self,
            LockHold::Exclusive | LockHold::Degraded { may_be_set: true }
        )
    }
}

/// Validates and redeems activation codes.
///
/// A redemption is a two-phase check. A cheap read outside any lock rejects
/// bad, expired and exhausted codes early. Codes that pass are locked by
/// value, then re-read and re-validated inside a transaction that performs
/// the decrement and the ledger insert together. The transactional re-check
/// alone is sufficient for correctness, so a missing or degraded mutex costs
/// contention, never over-redemption.
#[derive(Clone)]
pub struct RedemptionCoordinator {
    store: Arc<dyn CodeStore>,
    mutex: Arc<dyn DistributedMutex>,
    settings: RedemptionSettings,
}

impl RedemptionCoordinator {
    pub fn new(
        store: Arc<dyn CodeStore>,
        mutex: Arc<dyn DistributedMutex>,
        settings: RedemptionSettings,
    ) -> Self {
        Self {
            store,
            mutex,
            settings,
        }
    }

    /// Checks a code without consuming it. Never takes the lock or writes.
    #[tracing::instrument(skip_all)]
    pub async fn validate_only(&self, code: &str) -> RedemptionResult {
        let result = match self.pre_validate(code).await {
            Ok(found) => RedemptionResult::valid(&found),
            Err(kind) => RedemptionResult::rejected(kind),
        };

        tracing::debug!(outcome = result.outcome_label(), "Validation completed");
        metrics::record_outcome("validate", result.outcome_label());
        result
    }

    /// Consumes one use of a code.
    ///
    /// Once the pre-check passes, the locked phase runs on its own task, so
    /// dropping the returned future cannot abandon a held lock or a
    /// half-finished transaction.
    #[tracing::instrument(skip_all, fields(ip = %caller.ip))]
    pub async fn redeem(&self, code: &str, caller: &CallerContext) -> RedemptionResult {
        let result = match self.pre_validate(code).await {
            Ok(found) => {
                let coordinator = self.clone();
                let caller = caller.clone();
                let code_id = found.id;
                let locked = tokio::spawn(
                    async move { coordinator.locked_phase(found, caller).await }.in_current_span(),
                );
                match locked.await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(code_id = %code_id, error = %e, "Redemption task failed");
                        RedemptionResult::rejected(RedemptionErrorKind::BackingStoreUnavailable)
                    }
                }
            }
            Err(kind) => RedemptionResult::rejected(kind),
        };

        if result.success {
            tracing::info!(
                remaining_uses = ?result.remaining_uses,
                "Activation code redeemed"
            );
        } else {
            tracing::info!(
                outcome = result.outcome_label(),
                ip = %caller.ip,
                user_agent = %caller.user_agent,
                "Redemption rejected"
            );
        }
        metrics::record_outcome("redeem", result.outcome_label());
        result
    }

    /// Normalize, then read-only status, expiry and quota check.
    async fn pre_validate(&self, raw: &str) -> Result<ActivationCode, RedemptionErrorKind> {
        let normalized = normalize_code(raw).ok_or(RedemptionErrorKind::InvalidInput)?;

        let found = match timeout(self.settings.store_timeout, self.store.find_by_code(&normalized))
            .await
        {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Code lookup failed");
                return Err(RedemptionErrorKind::BackingStoreUnavailable);
            }
            Err(_) => {
                tracing::error!(
                    timeout = ?self.settings.store_timeout,
                    "Code lookup timed out"
                );
                return Err(RedemptionErrorKind::BackingStoreUnavailable);
            }
        };

        let found = found.ok_or(RedemptionErrorKind::CodeInvalid)?;
        if let Some(kind) = RedemptionErrorKind::from_usability(found.usability(Utc::now())) {
            tracing::debug!(code_id = %found.id, outcome = kind.as_str(), "Pre-check rejected code");
            return Err(kind);
        }

        Ok(found)
    }

    /// Lock, transact, release. Release happens on every path after the lock
    /// is taken.
    ///
    /// The store timeout bounds everything up to the commit. The commit itself
    /// is awaited to completion, since abandoning it would leave the caller
    /// with a retriable error for a decrement that may already be durable;
    /// Postgres bounds it with `statement_timeout`.
    async fn locked_phase(self, code: ActivationCode, caller: CallerContext) -> RedemptionResult {
        let key = code.code.clone();
        let token = Uuid::new_v4().to_string();
        let hold = match self.acquire(&key, &token, code.id).await {
            Some(hold) => hold,
            None => return RedemptionResult::rejected(RedemptionErrorKind::TooManyRequests),
        };

        let result = match timeout(
            self.settings.store_timeout,
            self.stage_redemption(code.id, &caller),
        )
        .await
        {
            Ok(Ok(Staged::Rejected(kind))) => RedemptionResult::rejected(kind),
            Ok(Ok(Staged::Ready(tx, redeemed))) => match tx.commit().await {
                Ok(()) => redeemed,
                Err(e) => {
                    tracing::error!(code_id = %code.id, error = %e, "Redemption commit failed, outcome unknown");
                    RedemptionResult::rejected(RedemptionErrorKind::BackingStoreUnavailable)
                }
            },
            Ok(Err(e)) => {
                tracing::error!(code_id = %code.id, error = %e, "Redemption transaction failed, rolled back");
                RedemptionResult::rejected(RedemptionErrorKind::BackingStoreUnavailable)
            }
            Err(_) => {
                tracing::error!(
                    code_id = %code.id,
                    timeout = ?self.settings.store_timeout,
                    "Redemption transaction timed out, rolled back"
                );
                RedemptionResult::rejected(RedemptionErrorKind::BackingStoreUnavailable)
            }
        };

        if hold.must_release() {
            self.release(&key, &token, code.id).await;
        }
        result
    }

    /// Returns `None` when another redemption holds the code.
    async fn acquire(&self, key: &str, token: &str, code_id: Uuid) -> Option<LockHold> {
        let outcome = timeout(
            self.settings.lock_acquire_timeout,
            self.mutex.acquire(key, token, self.settings.lock_ttl),
        )
        .await;

        match outcome {
            Ok(LockOutcome::Acquired) => Some(LockHold::Exclusive),
            Ok(LockOutcome::Contended) => {
                tracing::debug!(code_id = %code_id, "Redemption lock contended");
                None
            }
            Ok(LockOutcome::Unavailable) => {
                tracing::warn!(
                    code_id = %code_id,
                    "Lock store unavailable, redeeming without mutual exclusion"
                );
                metrics::record_lock_degraded("unavailable");
                Some(LockHold::Degraded { may_be_set: false })
            }
            Err(_) => {
                tracing::warn!(
                    code_id = %code_id,
                    timeout = ?self.settings.lock_acquire_timeout,
                    "Lock acquisition timed out, redeeming without mutual exclusion"
                );
                metrics::record_lock_degraded("timeout");
                Some(LockHold::Degraded { may_be_set: true })
            }
        }
    }

    /// Only clears the marker if it still carries `token`, so releasing
    /// after an acquire timeout never removes another holder's lock.
    async fn release(&self, key: &str, token: &str, code_id: Uuid) {
        if timeout(self.settings.lock_acquire_timeout, self.mutex.release(key, token))
            .await
            .is_err()
        {
            tracing::warn!(code_id = %code_id, "Lock release timed out; marker expires by TTL");
        }
    }

    /// Authoritative re-check, decrement and ledger insert in one transaction,
    /// left uncommitted. Any error drops the transaction, which rolls it back.
    async fn stage_redemption(
        &self,
        code_id: Uuid,
        caller: &CallerContext,
    ) -> Result<Staged, StoreError> {
        let mut tx = self.store.begin().await?;

        let Some(current) = tx.fetch_for_update(code_id).await? else {
            tx.rollback().await?;
            return Ok(Staged::Rejected(RedemptionErrorKind::CodeInvalid));
        };

        let now = Utc::now();
        if let Some(kind) = RedemptionErrorKind::from_usability(current.usability(now)) {
            tracing::info!(
                code_id = %code_id,
                outcome = kind.as_str(),
                "Authoritative re-check rejected code"
            );
            tx.rollback().await?;
            return Ok(Staged::Rejected(kind));
        }

        let update = RedemptionUpdate {
            id: code_id,
            used_count: current.used_count + 1,
            remaining_uses: current.remaining_uses - 1,
            used_at: now,
            ip: caller.ip.clone(),
            user_agent: caller.user_agent.clone(),
        };

        if !tx.apply_redemption(&update).await? {
            tx.rollback().await?;
            return Ok(Staged::Rejected(RedemptionErrorKind::CodeInvalid));
        }

        tx.append_usage(&NewUsageLogEntry {
            code_id,
            ip_address: caller.ip.clone(),
            user_agent: caller.user_agent.clone(),
            success: true,
            used_at: now,
        })
        .await?;

        Ok(Staged::Ready(
            tx,
            RedemptionResult::redeemed(&update, current.total_uses),
        ))
    }
}
