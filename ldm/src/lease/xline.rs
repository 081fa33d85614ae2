use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{LeaseError, LeaseStore};
use crate::api::xlinestore::XlineStore;

/// Leases backed by xline: the role key holds the holder identity and is
/// attached to an xline lease, so it disappears on its own once renewals stop.
/// Creation is a compare-and-swap transaction on the key version.
pub struct XlineLeaseStore {
    store: XlineStore,
    // role -> xline lease id we own
    granted: Mutex<HashMap<String, i64>>,
}

impl XlineLeaseStore {
    pub fn new(store: XlineStore) -> Self {
        Self {
            store,
            granted: Mutex::new(HashMap::new()),
        }
    }
}

fn unavailable(e: anyhow::Error) -> LeaseError {
    LeaseError::Unavailable(format!("{e:#}"))
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

#[async_trait]
impl LeaseStore for XlineLeaseStore {
    async fn try_acquire(
        &self,
        role: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let key = self.store.lease_key(role);
        let mut granted = self.granted.lock().await;

        if let Some(&lease_id) = granted.get(role) {
            let current = self.store.get_value(&key).await.map_err(unavailable)?;
            if current.as_deref() == Some(holder) {
                let remaining = self
                    .store
                    .keep_alive_once(lease_id)
                    .await
                    .map_err(unavailable)?;
                if remaining > 0 {
                    return Ok(true);
                }
            }
            granted.remove(role);
        }

        let lease_id = self
            .store
            .grant_lease(ttl_secs(ttl))
            .await
            .map_err(unavailable)?;
        match self.store.create_if_absent(&key, holder, lease_id).await {
            Ok(Ok(())) => {
                granted.insert(role.to_string(), lease_id);
                Ok(true)
            }
            Ok(Err(current)) => {
                debug!(role, holder = ?current, "lease held elsewhere");
                if let Err(e) = self.store.revoke_lease(lease_id).await {
                    warn!(role, "failed to revoke unused lease {lease_id:x}: {e:#}");
                }
                Ok(false)
            }
            Err(e) => {
                let _ = self.store.revoke_lease(lease_id).await;
                Err(unavailable(e))
            }
        }
    }

    async fn renew(&self, role: &str, holder: &str, _ttl: Duration) -> Result<bool, LeaseError> {
        let lease_id = match self.granted.lock().await.get(role) {
            Some(id) => *id,
            None => return Ok(false),
        };
        let remaining = self
            .store
            .keep_alive_once(lease_id)
            .await
            .map_err(unavailable)?;
        if remaining <= 0 {
            self.granted.lock().await.remove(role);
            return Ok(false);
        }
        let current = self
            .store
            .get_value(&self.store.lease_key(role))
            .await
            .map_err(unavailable)?;
        Ok(current.as_deref() == Some(holder))
    }

    async fn release(&self, role: &str, holder: &str) -> Result<(), LeaseError> {
        let key = self.store.lease_key(role);
        self.store
            .compare_and_delete(&key, holder)
            .await
            .map_err(unavailable)?;
        if let Some(lease_id) = self.granted.lock().await.remove(role) {
            self.store
                .revoke_lease(lease_id)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }

    async fn holder(&self, role: &str) -> Result<Option<String>, LeaseError> {
        self.store
            .get_value(&self.store.lease_key(role))
            .await
            .map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::XlineConfig;

    #[test]
    fn test_ttl_secs_rounds_up_to_one() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(15)), 15);
    }

    // needs a running xline/etcd on 127.0.0.1:2379
    #[tokio::test]
    #[ignore]
    async fn test_xline_lease_exclusive() {
        let cfg = XlineConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: format!("/ldm-test-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap()),
            ..Default::default()
        };
        let a = XlineLeaseStore::new(XlineStore::new(&cfg).await.expect("connect xline"));
        let b = XlineLeaseStore::new(XlineStore::new(&cfg).await.expect("connect xline"));
        let ttl = Duration::from_secs(5);
        let role = "cluster-controller-master";

        assert!(a.try_acquire(role, "storage/agent-1", ttl).await.unwrap());
        assert!(!b.try_acquire(role, "storage/agent-2", ttl).await.unwrap());
        assert!(a.renew(role, "storage/agent-1", ttl).await.unwrap());
        a.release(role, "storage/agent-1").await.unwrap();
        assert!(b.try_acquire(role, "storage/agent-2", ttl).await.unwrap());
        assert_eq!(
            b.holder(role).await.unwrap().as_deref(),
            Some("storage/agent-2")
        );
        b.release(role, "storage/agent-2").await.unwrap();
    }
}
