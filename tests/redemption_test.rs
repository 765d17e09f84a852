mod common;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use codegate::lock::{DistributedMutex, LockError, LockOutcome, MemoryMutex, NoopMutex};
use codegate::services::{
    OutcomeClass, RedemptionCoordinator, RedemptionErrorKind, RedemptionSettings,
};
use codegate::store::{CodeStore, MemoryCodeStore};

use common::{assert_balanced, caller, coordinator, current, seed};

/// Lock store that answers slowly. With `set_first` the marker is written
/// before the delay, like a Redis reply lost on a congested link.
struct SlowMutex {
    inner: Arc<MemoryMutex>,
    delay: Duration,
    set_first: bool,
}

#[async_trait]
impl DistributedMutex for SlowMutex {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> LockOutcome {
        if self.set_first {
            let outcome = self.inner.acquire(key, token, ttl).await;
            tokio::time::sleep(self.delay).await;
            outcome
        } else {
            tokio::time::sleep(self.delay).await;
            self.inner.acquire(key, token, ttl).await
        }
    }

    async fn release(&self, key: &str, token: &str) {
        self.inner.release(key, token).await
    }

    async fn ping(&self) -> Result<(), LockError> {
        Ok(())
    }
}

fn with_slow_mutex(store: &MemoryCodeStore, mutex: SlowMutex) -> RedemptionCoordinator {
    RedemptionCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(mutex),
        RedemptionSettings {
            lock_acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_redeem_decrements_and_logs() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "ABC123", 3, None).await;
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    let result = coordinator.redeem("  abc123 ", &caller(1)).await;

    assert!(result.success, "{:?}", result);
    assert_eq!(result.outcome_class(), OutcomeClass::Success);
    assert_eq!(result.remaining_uses, Some(2));
    assert_eq!(result.total_uses, Some(3));
    assert_eq!(result.used_count, Some(1));

    let row = current(&store, "ABC123").await;
    assert_eq!(row.remaining_uses, 2);
    assert_eq!(row.last_user_ip.as_deref(), Some("198.51.100.1"));
    assert_eq!(row.last_user_agent.as_deref(), Some("test-agent/1"));
    assert!(row.last_used_at.is_some());
    assert_balanced(&row);

    let ledger = store.usage_entries(code.id);
    assert_eq!(ledger.len(), 1);
    assert!(ledger[0].success);
    assert_eq!(ledger[0].ip_address.as_deref(), Some("198.51.100.1"));
}

#[tokio::test]
async fn test_sequential_redemptions_until_exhausted() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "MULTI", 2, None).await;
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    assert_eq!(coordinator.redeem("MULTI", &caller(1)).await.remaining_uses, Some(1));
    assert_eq!(coordinator.redeem("MULTI", &caller(2)).await.remaining_uses, Some(0));

    let third = coordinator.redeem("MULTI", &caller(3)).await;
    assert!(!third.success);
    assert_eq!(third.error_kind, Some(RedemptionErrorKind::QuotaExhausted));

    let row = current(&store, "MULTI").await;
    assert_eq!((row.used_count, row.remaining_uses), (2, 0));
    assert_balanced(&row);
    assert_eq!(store.usage_entries(code.id).len(), 2);
}

#[tokio::test]
async fn test_empty_input_is_invalid_input() {
    let store = MemoryCodeStore::new();
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    for raw in ["", "   ", "\t\n"] {
        let result = coordinator.redeem(raw, &caller(1)).await;
        assert_eq!(result.error_kind, Some(RedemptionErrorKind::InvalidInput));
        assert_eq!(result.outcome_class(), OutcomeClass::ClientError);

        let result = coordinator.validate_only(raw).await;
        assert_eq!(result.error_kind, Some(RedemptionErrorKind::InvalidInput));
    }
}

#[tokio::test]
async fn test_unknown_code_is_invalid_without_ledger_entry() {
    let store = MemoryCodeStore::new();
    seed(&store, "ABC123", 1, None).await;
    let mutex = Arc::new(MemoryMutex::new());
    let coordinator = coordinator(&store, mutex.clone());

    let validated = coordinator.validate_only("ZZZZZZ").await;
    assert!(!validated.success);
    assert_eq!(validated.error_kind, Some(RedemptionErrorKind::CodeInvalid));

    let redeemed = coordinator.redeem("ZZZZZZ", &caller(1)).await;
    assert!(!redeemed.success);
    assert_eq!(redeemed.error_kind, Some(RedemptionErrorKind::CodeInvalid));

    assert_eq!(store.usage_count(), 0);
    assert!(!mutex.is_held("ZZZZZZ"));
}

#[tokio::test]
async fn test_expired_code_is_not_consumed() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "OLD1", 5, Some(Utc::now() - ChronoDuration::hours(1))).await;
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    let result = coordinator.redeem("OLD1", &caller(1)).await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(RedemptionErrorKind::CodeExpired));
    assert_eq!(result.message, "Activation code has expired");

    let row = current(&store, "OLD1").await;
    assert_eq!(row.remaining_uses, 5);
    assert_eq!(row.used_count, 0);
    assert!(store.usage_entries(code.id).is_empty());
}

#[tokio::test]
async fn test_future_expiry_still_redeemable() {
    let store = MemoryCodeStore::new();
    seed(&store, "SOON", 1, Some(Utc::now() + ChronoDuration::hours(1))).await;
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    assert!(coordinator.redeem("SOON", &caller(1)).await.success);
}

#[tokio::test]
async fn test_expiry_reached_between_calls() {
    let store = MemoryCodeStore::new();
    seed(&store, "EDGE", 2, Some(Utc::now() + ChronoDuration::milliseconds(150))).await;
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    assert!(coordinator.redeem("EDGE", &caller(1)).await.success);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = coordinator.redeem("EDGE", &caller(2)).await;
    assert_eq!(result.error_kind, Some(RedemptionErrorKind::CodeExpired));
    assert_eq!(current(&store, "EDGE").await.remaining_uses, 1);
}

#[tokio::test]
async fn test_deactivated_code_is_invalid() {
    let store = MemoryCodeStore::new();
    seed(&store, "GONE", 10, None).await;
    assert!(store.deactivate("gone").await.unwrap());
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    assert_eq!(
        coordinator.validate_only("GONE").await.error_kind,
        Some(RedemptionErrorKind::CodeInvalid)
    );
    assert_eq!(
        coordinator.redeem("GONE", &caller(1)).await.error_kind,
        Some(RedemptionErrorKind::CodeInvalid)
    );
    assert_eq!(current(&store, "GONE").await.remaining_uses, 10);
}

#[tokio::test]
async fn test_validate_only_never_mutates() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "ABC123", 4, None).await;
    let mutex = Arc::new(MemoryMutex::new());
    let coordinator = coordinator(&store, mutex.clone());

    for _ in 0..25 {
        let result = coordinator.validate_only("abc123").await;
        assert!(result.success);
        assert_eq!(result.remaining_uses, Some(4));
        assert_eq!(result.total_uses, None);
        assert_eq!(result.used_count, None);
    }

    // a held lock does not affect validation
    assert_eq!(
        mutex.acquire("ABC123", "admin", Duration::from_secs(10)).await,
        LockOutcome::Acquired
    );
    assert!(coordinator.validate_only("ABC123").await.success);

    let row = current(&store, "ABC123").await;
    assert_eq!((row.used_count, row.remaining_uses), (0, 4));
    assert!(row.last_used_at.is_none());
    assert!(store.usage_entries(code.id).is_empty());
}

#[tokio::test]
async fn test_validate_only_reports_exhausted() {
    let store = MemoryCodeStore::new();
    seed(&store, "ONCE", 1, None).await;
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    assert!(coordinator.redeem("ONCE", &caller(1)).await.success);
    let result = coordinator.validate_only("ONCE").await;
    assert_eq!(result.error_kind, Some(RedemptionErrorKind::QuotaExhausted));
}

#[tokio::test]
async fn test_contended_lock_returns_too_many_requests() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "BUSY", 3, None).await;
    let mutex = Arc::new(MemoryMutex::new());
    let coordinator = coordinator(&store, mutex.clone());

    // another redemption in flight
    assert_eq!(
        mutex.acquire("BUSY", "in-flight", Duration::from_secs(10)).await,
        LockOutcome::Acquired
    );

    let result = coordinator.redeem("busy", &caller(1)).await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(RedemptionErrorKind::TooManyRequests));
    assert_eq!(result.outcome_class(), OutcomeClass::TransientError);

    // the rejected attempt must not clear the other holder's lock
    assert!(mutex.is_held("BUSY"));
    assert_eq!(current(&store, "BUSY").await.remaining_uses, 3);
    assert!(store.usage_entries(code.id).is_empty());

    mutex.release("BUSY", "in-flight").await;
    assert!(coordinator.redeem("BUSY", &caller(1)).await.success);
}

#[tokio::test]
async fn test_lock_released_after_success_and_rejection() {
    let store = MemoryCodeStore::new();
    seed(&store, "ONCE", 1, None).await;
    let mutex = Arc::new(MemoryMutex::new());
    let coordinator = coordinator(&store, mutex.clone());

    assert!(coordinator.redeem("ONCE", &caller(1)).await.success);
    assert!(!mutex.is_held("ONCE"));

    assert!(!coordinator.redeem("ONCE", &caller(2)).await.success);
    assert!(!mutex.is_held("ONCE"));
}

#[tokio::test]
async fn test_commit_failure_rolls_back_and_releases_lock() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "FLAKY", 2, None).await;
    let mutex = Arc::new(MemoryMutex::new());
    let coordinator = coordinator(&store, mutex.clone());

    store.set_fail_commits(true);
    let result = coordinator.redeem("FLAKY", &caller(1)).await;

    assert!(!result.success);
    assert_eq!(
        result.error_kind,
        Some(RedemptionErrorKind::BackingStoreUnavailable)
    );
    assert_eq!(result.outcome_class(), OutcomeClass::TransientError);
    assert_eq!(result.message, "Service temporarily unavailable, please retry");
    assert!(!mutex.is_held("FLAKY"));

    let row = current(&store, "FLAKY").await;
    assert_eq!((row.used_count, row.remaining_uses), (0, 2));
    assert!(store.usage_entries(code.id).is_empty());

    store.set_fail_commits(false);
    assert_eq!(coordinator.redeem("FLAKY", &caller(1)).await.remaining_uses, Some(1));
}

#[tokio::test]
async fn test_unreachable_store_is_transient() {
    let store = MemoryCodeStore::new();
    seed(&store, "ABC123", 1, None).await;
    let coordinator = coordinator(&store, Arc::new(MemoryMutex::new()));

    store.set_unavailable(true);
    assert_eq!(
        coordinator.validate_only("ABC123").await.error_kind,
        Some(RedemptionErrorKind::BackingStoreUnavailable)
    );
    assert_eq!(
        coordinator.redeem("ABC123", &caller(1)).await.error_kind,
        Some(RedemptionErrorKind::BackingStoreUnavailable)
    );

    store.set_unavailable(false);
    assert_eq!(current(&store, "ABC123").await.remaining_uses, 1);
}

#[tokio::test]
async fn test_slow_transaction_times_out_and_rolls_back() {
    let store = MemoryCodeStore::new();
    seed(&store, "SLOW", 1, None).await;
    let mutex = Arc::new(MemoryMutex::new());
    let coordinator = RedemptionCoordinator::new(
        Arc::new(store.clone()),
        mutex.clone(),
        RedemptionSettings {
            store_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );

    store.set_latency(Duration::from_millis(300));
    let result = coordinator.redeem("SLOW", &caller(1)).await;

    assert_eq!(
        result.error_kind,
        Some(RedemptionErrorKind::BackingStoreUnavailable)
    );
    assert!(!mutex.is_held("SLOW"));
    assert_eq!(current(&store, "SLOW").await.remaining_uses, 1);
}

#[tokio::test]
async fn test_cancelled_caller_still_completes_and_releases() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "DROP", 1, None).await;
    let mutex = Arc::new(MemoryMutex::new());
    let coordinator = coordinator(&store, mutex.clone());

    store.set_latency(Duration::from_millis(100));
    let task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.redeem("DROP", &caller(1)).await })
    };

    // wait until the locked phase is running, then abandon the caller
    tokio::time::timeout(Duration::from_secs(2), async {
        while !mutex.is_held("DROP") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("locked phase started");
    task.abort();

    tokio::time::timeout(Duration::from_secs(2), async {
        while mutex.is_held("DROP") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("lock released after caller went away");

    let row = current(&store, "DROP").await;
    assert_eq!((row.used_count, row.remaining_uses), (1, 0));
    assert_eq!(store.usage_entries(code.id).len(), 1);
}

#[tokio::test]
async fn test_missing_lock_store_still_redeems() {
    let store = MemoryCodeStore::new();
    seed(&store, "NOLOCK", 2, None).await;
    let coordinator = coordinator(&store, Arc::new(NoopMutex));

    let result = coordinator.redeem("NOLOCK", &caller(1)).await;
    assert!(result.success);
    assert_eq!(result.remaining_uses, Some(1));
}

#[tokio::test]
async fn test_acquire_timeout_leaves_other_holders_lock() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "BUSY", 3, None).await;
    let inner = Arc::new(MemoryMutex::new());
    assert_eq!(
        inner.acquire("BUSY", "in-flight", Duration::from_secs(10)).await,
        LockOutcome::Acquired
    );
    let coordinator = with_slow_mutex(
        &store,
        SlowMutex {
            inner: inner.clone(),
            delay: Duration::from_millis(300),
            set_first: false,
        },
    );

    // degraded: the transactional re-check alone guards the quota
    let result = coordinator.redeem("BUSY", &caller(1)).await;
    assert!(result.success, "{:?}", result);
    assert!(inner.is_held("BUSY"));

    let row = current(&store, "BUSY").await;
    assert_eq!(row.remaining_uses, 2);
    assert_balanced(&row);
    assert_eq!(store.usage_entries(code.id).len(), 1);
}

#[tokio::test]
async fn test_acquire_timeout_clears_own_late_marker() {
    let store = MemoryCodeStore::new();
    seed(&store, "LATE", 2, None).await;
    let inner = Arc::new(MemoryMutex::new());
    let coordinator = with_slow_mutex(
        &store,
        SlowMutex {
            inner: inner.clone(),
            delay: Duration::from_millis(300),
            set_first: true,
        },
    );

    let result = coordinator.redeem("LATE", &caller(1)).await;
    assert!(result.success, "{:?}", result);
    assert!(!inner.is_held("LATE"));
}

#[tokio::test]
async fn test_slow_commit_is_not_reported_as_failure() {
    let store = MemoryCodeStore::new();
    let code = seed(&store, "SLOWCOMMIT", 2, None).await;
    let mutex = Arc::new(MemoryMutex::new());
    let coordinator = RedemptionCoordinator::new(
        Arc::new(store.clone()),
        mutex.clone(),
        RedemptionSettings {
            store_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );

    store.set_commit_latency(Duration::from_millis(150));
    let result = coordinator.redeem("SLOWCOMMIT", &caller(1)).await;

    // a commit that outlives the bound still lands, and the caller is told so
    assert!(result.success, "{:?}", result);
    assert_eq!(result.remaining_uses, Some(1));
    assert_eq!(current(&store, "SLOWCOMMIT").await.remaining_uses, 1);
    assert_eq!(store.usage_entries(code.id).len(), 1);
    assert!(!mutex.is_held("SLOWCOMMIT"));
}
