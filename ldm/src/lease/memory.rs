use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{LeaseError, LeaseStore};

#[derive(Debug, Clone)]
struct Entry {
    holder: String,
    expires: Instant,
}

/// Process-local lease store, used in standalone mode and by tests.
/// Each operation runs under one lock, so check-and-set is atomic.
#[derive(Default)]
pub struct MemoryLeaseStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    leases: HashMap<String, Entry>,
    unavailable: bool,
    partitioned: HashSet<String>,
}

impl Inner {
    fn check(&self, holder: &str) -> Result<(), LeaseError> {
        if self.unavailable {
            return Err(LeaseError::Unavailable("store is down".into()));
        }
        if self.partitioned.contains(holder) {
            return Err(LeaseError::Unavailable(format!("{holder} is partitioned")));
        }
        Ok(())
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Fail calls made on behalf of `holder` only.
    pub async fn partition(&self, holder: &str) {
        self.inner.lock().await.partitioned.insert(holder.to_string());
    }

    pub async fn heal(&self, holder: &str) {
        self.inner.lock().await.partitioned.remove(holder);
    }

    /// Drop the record for `role`, as an operator deleting the lease would.
    pub async fn revoke(&self, role: &str) {
        self.inner.lock().await.leases.remove(role);
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        role: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let mut inner = self.inner.lock().await;
        inner.check(holder)?;
        let now = Instant::now();
        match inner.leases.get(role) {
            Some(e) if e.holder != holder && e.expires > now => Ok(false),
            _ => {
                inner.leases.insert(
                    role.to_string(),
                    Entry {
                        holder: holder.to_string(),
                        expires: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, role: &str, holder: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let mut inner = self.inner.lock().await;
        inner.check(holder)?;
        let now = Instant::now();
        match inner.leases.get_mut(role) {
            Some(e) if e.holder == holder && e.expires > now => {
                e.expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, role: &str, holder: &str) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock().await;
        inner.check(holder)?;
        if inner.leases.get(role).is_some_and(|e| e.holder == holder) {
            inner.leases.remove(role);
        }
        Ok(())
    }

    async fn holder(&self, role: &str) -> Result<Option<String>, LeaseError> {
        let inner = self.inner.lock().await;
        if inner.unavailable {
            return Err(LeaseError::Unavailable("store is down".into()));
        }
        let now = Instant::now();
        Ok(inner
            .leases
            .get(role)
            .filter(|e| e.expires > now)
            .map(|e| e.holder.clone()))
    }
}
