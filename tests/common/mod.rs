#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use codegate::caller::CallerContext;
use codegate::lock::DistributedMutex;
use codegate::models::{ActivationCode, NewActivationCode};
use codegate::services::{
    RedemptionCoordinator, RedemptionErrorKind, RedemptionResult, RedemptionSettings,
};
use codegate::store::{CodeStore, MemoryCodeStore};

pub fn coordinator(
    store: &MemoryCodeStore,
    mutex: Arc<dyn DistributedMutex>,
) -> RedemptionCoordinator {
    RedemptionCoordinator::new(Arc::new(store.clone()), mutex, RedemptionSettings::default())
}

pub fn caller(n: usize) -> CallerContext {
    CallerContext::new(format!("198.51.100.{}", n % 250), format!("test-agent/{}", n))
}

pub async fn seed(
    store: &MemoryCodeStore,
    code: &str,
    total_uses: i32,
    expires_at: Option<DateTime<Utc>>,
) -> ActivationCode {
    store
        .create(NewActivationCode {
            code: code.to_string(),
            total_uses,
            expires_at,
        })
        .await
        .expect("seed code")
}

pub async fn current(store: &MemoryCodeStore, code: &str) -> ActivationCode {
    store
        .find_by_code(code)
        .await
        .expect("store reachable")
        .expect("code exists")
}

/// Redeems, backing off while another redemption holds the code.
pub async fn redeem_with_retry(
    coordinator: &RedemptionCoordinator,
    code: &str,
    caller: &CallerContext,
) -> RedemptionResult {
    for _ in 0..500 {
        let result = coordinator.redeem(code, caller).await;
        if result.error_kind != Some(RedemptionErrorKind::TooManyRequests) {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("redemption of {} still contended after retries", code);
}

pub fn assert_balanced(code: &ActivationCode) {
    assert_eq!(
        code.used_count + code.remaining_uses,
        code.total_uses,
        "quota balance broken for {}",
        code.code
    );
}
