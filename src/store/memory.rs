//! In-process code store.
//!
//! Plain reads see the last committed state and never wait on an open
//! transaction, as with read-committed Postgres. A transaction locks each row
//! it reads for update until it ends, like `SELECT ... FOR UPDATE`, so only
//! transactions touching the same code wait on each other. Writes are staged
//! until commit. Used for tests and for embedding the coordinator without
//! Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{prepare_new_code, CodeStore, CodeTransaction, StoreError};
use crate::models::{
    normalize_code, ActivationCode, NewActivationCode, NewUsageLogEntry, RedemptionUpdate,
    UsageLogEntry,
};

#[derive(Debug, Default)]
struct Tables {
    codes: HashMap<Uuid, ActivationCode>,
    usage_logs: Vec<UsageLogEntry>,
}

impl Tables {
    fn find_by_code_mut(&mut self, code: &str) -> Option<&mut ActivationCode> {
        self.codes.values_mut().find(|c| c.code == code)
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_commits: AtomicBool,
    // milliseconds added to every authoritative read
    latency_ms: AtomicU64,
    // milliseconds added to every commit
    commit_latency_ms: AtomicU64,
}

/// Per-row locks held by open transactions.
#[derive(Debug, Default)]
struct RowLocks {
    rows: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RowLocks {
    async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let row = {
            let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
            rows.entry(id).or_default().clone()
        };
        row.lock_owned().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCodeStore {
    tables: Arc<RwLock<Tables>>,
    row_locks: Arc<RowLocks>,
    faults: Arc<Faults>,
}

fn read(tables: &RwLock<Tables>) -> RwLockReadGuard<'_, Tables> {
    tables.read().unwrap_or_else(|e| e.into_inner())
}

fn write(tables: &RwLock<Tables>) -> RwLockWriteGuard<'_, Tables> {
    tables.write().unwrap_or_else(|e| e.into_inner())
}

impl MemoryCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every read and `begin` fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes `commit` fail after the transaction's writes were staged.
    pub fn set_fail_commits(&self, fail: bool) {
        self.faults.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Delays every `fetch_for_update` by the given duration.
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delays every `commit` by the given duration, before anything is written.
    pub fn set_commit_latency(&self, latency: Duration) {
        self.faults
            .commit_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Committed ledger rows for a code, oldest first.
    pub fn usage_entries(&self, code_id: Uuid) -> Vec<UsageLogEntry> {
        read(&self.tables)
            .usage_logs
            .iter()
            .filter(|entry| entry.code_id == code_id)
            .cloned()
            .collect()
    }

    pub fn usage_count(&self) -> usize {
        read(&self.tables).usage_logs.len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct MemoryTransaction {
    held_rows: HashMap<Uuid, OwnedMutexGuard<()>>,
    row_locks: Arc<RowLocks>,
    tables: Arc<RwLock<Tables>>,
    staged_codes: HashMap<Uuid, ActivationCode>,
    staged_usage: Vec<UsageLogEntry>,
    faults: Arc<Faults>,
}

impl MemoryTransaction {
    async fn lock_row(&mut self, id: Uuid) {
        if !self.held_rows.contains_key(&id) {
            let guard = self.row_locks.lock(id).await;
            self.held_rows.insert(id, guard);
        }
    }

    fn current(&self, id: Uuid) -> Option<ActivationCode> {
        self.staged_codes
            .get(&id)
            .cloned()
            .or_else(|| read(&self.tables).codes.get(&id).cloned())
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn find_by_code(&self, code: &str) -> Result<Option<ActivationCode>, StoreError> {
        self.check_available()?;
        Ok(read(&self.tables)
            .codes
            .values()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn begin(&self) -> Result<Box<dyn CodeTransaction>, StoreError> {
        self.check_available()?;
        Ok(Box::new(MemoryTransaction {
            held_rows: HashMap::new(),
            row_locks: self.row_locks.clone(),
            tables: self.tables.clone(),
            staged_codes: HashMap::new(),
            staged_usage: Vec::new(),
            faults: self.faults.clone(),
        }))
    }

    async fn create(&self, data: NewActivationCode) -> Result<ActivationCode, StoreError> {
        self.check_available()?;
        let data = prepare_new_code(data)?;
        let mut tables = write(&self.tables);
        if tables.find_by_code_mut(&data.code).is_some() {
            return Err(StoreError::InvalidData(format!(
                "code {} already exists",
                data.code
            )));
        }

        let created = ActivationCode {
            id: Uuid::new_v4(),
            code: data.code,
            total_uses: data.total_uses,
            used_count: 0,
            remaining_uses: data.total_uses,
            is_active: true,
            expires_at: data.expires_at,
            last_used_at: None,
            last_user_ip: None,
            last_user_agent: None,
            created_at: Utc::now(),
        };
        tables.codes.insert(created.id, created.clone());
        Ok(created)
    }

    async fn deactivate(&self, code: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let Some(code) = normalize_code(code) else {
            return Ok(false);
        };
        let mut tables = write(&self.tables);
        Ok(match tables.find_by_code_mut(&code) {
            Some(row) => {
                row.is_active = false;
                true
            }
            None => false,
        })
    }

    async fn set_expiry(
        &self,
        code: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let Some(code) = normalize_code(code) else {
            return Ok(false);
        };
        let mut tables = write(&self.tables);
        Ok(match tables.find_by_code_mut(&code) {
            Some(row) => {
                row.expires_at = expires_at;
                true
            }
            None => false,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[async_trait]
impl CodeTransaction for MemoryTransaction {
    async fn fetch_for_update(&mut self, id: Uuid) -> Result<Option<ActivationCode>, StoreError> {
        self.lock_row(id).await;
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(self.current(id))
    }

    async fn apply_redemption(&mut self, update: &RedemptionUpdate) -> Result<bool, StoreError> {
        self.lock_row(update.id).await;
        let Some(mut row) = self.current(update.id) else {
            return Ok(false);
        };
        if row.remaining_uses <= 0 {
            return Ok(false);
        }

        if update.remaining_uses < 0 || update.used_count + update.remaining_uses != row.total_uses
        {
            return Err(StoreError::InvalidData(format!(
                "quota balance violated for code {}",
                update.id
            )));
        }

        row.used_count = update.used_count;
        row.remaining_uses = update.remaining_uses;
        row.last_used_at = Some(update.used_at);
        row.last_user_ip = Some(update.ip.clone());
        row.last_user_agent = Some(update.user_agent.clone());
        self.staged_codes.insert(row.id, row);
        Ok(true)
    }

    async fn append_usage(&mut self, entry: &NewUsageLogEntry) -> Result<(), StoreError> {
        self.staged_usage.push(UsageLogEntry {
            id: Uuid::new_v4(),
            code_id: entry.code_id,
            ip_address: Some(entry.ip_address.clone()),
            user_agent: Some(entry.user_agent.clone()),
            success: entry.success,
            used_at: entry.used_at,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let latency = self.faults.commit_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "commit failed: connection reset".to_string(),
            ));
        }

        let mut tables = write(&self.tables);
        for (id, row) in &self.staged_codes {
            // admin fields may have changed since the row was read
            if let Some(existing) = tables.codes.get_mut(id) {
                existing.used_count = row.used_count;
                existing.remaining_uses = row.remaining_uses;
                existing.last_used_at = row.last_used_at;
                existing.last_user_ip = row.last_user_ip.clone();
                existing.last_user_agent = row.last_user_agent.clone();
            }
        }
        tables.usage_logs.extend(self.staged_usage.iter().cloned());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
