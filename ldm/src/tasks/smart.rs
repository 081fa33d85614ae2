use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use common::{NODE_NAME_FIELD, SmartSummary};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::cache::CacheReader;
use crate::resource::ResourceBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartReading {
    pub passed: bool,
    pub temperature_celsius: Option<i64>,
    pub power_on_hours: Option<u64>,
}

/// Where S.M.A.R.T. attributes come from.
#[async_trait]
pub trait AttributeSource: Send + Sync {
    async fn collect(&self, device_path: &str) -> anyhow::Result<SmartReading>;
}

/// Runs `smartctl --json -H -A` against the device.
pub struct Smartctl {
    binary: String,
}

impl Default for Smartctl {
    fn default() -> Self {
        Smartctl {
            binary: "smartctl".to_string(),
        }
    }
}

pub fn parse_smartctl_json(raw: &[u8]) -> anyhow::Result<SmartReading> {
    let doc: Value = serde_json::from_slice(raw).context("smartctl output is not JSON")?;
    let passed = doc
        .pointer("/smart_status/passed")
        .and_then(Value::as_bool)
        .ok_or_else(|| anyhow!("smartctl reported no health status"))?;
    Ok(SmartReading {
        passed,
        temperature_celsius: doc.pointer("/temperature/current").and_then(Value::as_i64),
        power_on_hours: doc.pointer("/power_on_time/hours").and_then(Value::as_u64),
    })
}

#[async_trait]
impl AttributeSource for Smartctl {
    async fn collect(&self, device_path: &str) -> anyhow::Result<SmartReading> {
        // smartctl encodes disk warnings in its exit status, so only the
        // JSON body decides success
        let output = Command::new(&self.binary)
            .args(["--json", "-H", "-A", device_path])
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.binary))?;
        parse_smartctl_json(&output.stdout)
            .with_context(|| format!("smartctl exited with {}", output.status))
    }
}

/// Collects health data for this node's active disks: once at start, then
/// every `period`.
pub struct SmartCollector {
    node_name: String,
    period: Duration,
    source: Arc<dyn AttributeSource>,
    cache: CacheReader,
    backend: Arc<dyn ResourceBackend>,
}

impl SmartCollector {
    pub fn new(
        node_name: &str,
        period: Duration,
        source: Arc<dyn AttributeSource>,
        cache: CacheReader,
        backend: Arc<dyn ResourceBackend>,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            period,
            source,
            cache,
            backend,
        }
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        // the launch round needs the node's disks in the cache
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = self.cache.wait_synced() => {}
        }
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let updated = self.collect_once().await;
            info!(updated, "S.M.A.R.T. collection round done");
        }
    }

    /// One round over every active disk of this node. Per-device failures
    /// are logged and skipped. Returns how many disks were updated.
    pub async fn collect_once(&self) -> usize {
        let disks = match self.cache.by_index(NODE_NAME_FIELD, &self.node_name).await {
            Ok(d) => d,
            Err(e) => {
                warn!("cannot list disks for S.M.A.R.T. collection: {e}");
                return 0;
            }
        };
        let mut updated = 0;
        for disk in disks.into_iter().filter(|d| d.is_active()) {
            let reading = match self.source.collect(&disk.spec.device_path).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(device = %disk.spec.device_path, "S.M.A.R.T. collection failed: {e:#}");
                    continue;
                }
            };
            if !reading.passed {
                warn!(device = %disk.spec.device_path, "S.M.A.R.T. health check failed");
            }
            // smartctl can take seconds; patch the stored copy so a state
            // change written meanwhile is kept
            let mut disk = match self.backend.get(disk.name()).await {
                Ok(Some(current)) => current,
                Ok(None) => {
                    debug!(disk = disk.name(), "disk removed during collection");
                    continue;
                }
                Err(e) => {
                    warn!(disk = disk.name(), "failed to reload disk: {e}");
                    continue;
                }
            };
            disk.status.smart = Some(SmartSummary {
                passed: reading.passed,
                temperature_celsius: reading.temperature_celsius,
                power_on_hours: reading.power_on_hours,
                collected_at: Utc::now(),
            });
            match self.backend.put(&disk).await {
                Ok(()) => updated += 1,
                Err(e) => warn!(disk = disk.name(), "failed to store S.M.A.R.T. data: {e}"),
            }
        }
        debug!(updated, "S.M.A.R.T. round finished");
        updated
    }
}
