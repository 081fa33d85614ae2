use anyhow::{Result, anyhow};
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp,
    TxnOpResponse, WatchOptions, WatchStream, Watcher,
};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::XlineConfig;

/// Key layout under the configured prefix:
/// k:{prefix}/registry/localdisks/{name} v:yaml of the LocalDisk
/// k:{prefix}/leases/{role}              v:holder identity, bound to an xline lease
/// k:{prefix}/registry/services/{ns}/{name} v:json service record
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<RwLock<Client>>,
    prefix: String,
}

impl XlineStore {
    pub async fn new(cfg: &XlineConfig) -> Result<Self> {
        let endpoints: Vec<&str> = cfg.endpoints.iter().map(|s| s.as_str()).collect();
        let options = match (&cfg.username, &cfg.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user.clone(), password.clone()))
            }
            _ => None,
        };
        let client = Client::connect(&endpoints, options).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            prefix: cfg.prefix.trim_end_matches('/').to_string(),
        })
    }

    fn disks_prefix(&self) -> String {
        format!("{}/registry/localdisks/", self.prefix)
    }

    pub fn lease_key(&self, role: &str) -> String {
        format!("{}/leases/{role}", self.prefix)
    }

    pub fn service_key(&self, namespace: &str, name: &str) -> String {
        format!("{}/registry/services/{namespace}/{name}", self.prefix)
    }

    /// Snapshot of `/registry/localdisks/` with the revision it was read at.
    pub async fn localdisks_snapshot_with_rev(&self) -> Result<(Vec<(String, String)>, i64)> {
        let key_prefix = self.disks_prefix();
        let mut client = self.client.write().await;
        let resp = client
            .get(key_prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or(0);
        let items = resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).replace(&key_prefix, ""),
                    String::from_utf8_lossy(kv.value()).to_string(),
                )
            })
            .collect();
        Ok((items, rev))
    }

    pub async fn get_localdisk_yaml(&self, name: &str) -> Result<Option<String>> {
        let key = format!("{}{name}", self.disks_prefix());
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }

    pub async fn insert_localdisk_yaml(&self, name: &str, yaml: &str) -> Result<()> {
        let key = format!("{}{name}", self.disks_prefix());
        let mut client = self.client.write().await;
        client.put(key, yaml, Some(PutOptions::new())).await?;
        Ok(())
    }

    pub async fn delete_localdisk(&self, name: &str) -> Result<()> {
        let key = format!("{}{name}", self.disks_prefix());
        let mut client = self.client.write().await;
        client.delete(key, None).await?;
        Ok(())
    }

    /// Prefix watch over local disks (with prev_kv) starting at `start_rev`.
    pub async fn watch_localdisks(&self, start_rev: i64) -> Result<(Watcher, WatchStream)> {
        let opts = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(start_rev);
        let mut client = self.client.write().await;
        let (watcher, stream) = client.watch(self.disks_prefix(), Some(opts)).await?;
        Ok((watcher, stream))
    }

    pub fn localdisk_name(&self, key: &[u8]) -> String {
        String::from_utf8_lossy(key).replace(&self.disks_prefix(), "")
    }

    pub async fn grant_lease(&self, ttl_secs: i64) -> Result<i64> {
        let mut client = self.client.write().await;
        let resp = client.lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    pub async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        let mut client = self.client.write().await;
        client.lease_revoke(lease_id).await?;
        Ok(())
    }

    /// Send one keep-alive for `lease_id` and return the remaining ttl.
    /// A ttl of zero or less means the lease is gone.
    pub async fn keep_alive_once(&self, lease_id: i64) -> Result<i64> {
        let (mut keeper, mut stream) = {
            let mut client = self.client.write().await;
            client.lease_keep_alive(lease_id).await?
        };
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) => Ok(resp.ttl()),
            None => Err(anyhow!("keep-alive stream closed for lease {lease_id:x}")),
        }
    }

    /// Atomically put `value` at `key` bound to `lease_id` if the key does not exist.
    /// On conflict returns the value currently stored.
    pub async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease_id: i64,
    ) -> Result<std::result::Result<(), Option<String>>> {
        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else([TxnOp::get(key, None)]);

        let mut client = self.client.write().await;
        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            return Ok(Ok(()));
        }
        let current = resp.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => get
                .kvs()
                .first()
                .map(|kv| String::from_utf8_lossy(kv.value()).to_string()),
            _ => None,
        });
        Ok(Err(current))
    }

    /// Delete `key` only while it still holds `value`.
    pub async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let txn = Txn::new()
            .when([Compare::value(key, CompareOp::Equal, value)])
            .and_then([TxnOp::delete(key, None)]);
        let mut client = self.client.write().await;
        Ok(client.txn(txn).await?.succeeded())
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }

    pub async fn put_value(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.client.write().await;
        client.put(key, value, Some(PutOptions::new())).await?;
        Ok(())
    }
}
