#![allow(dead_code)]

use async_trait::async_trait;
use ldm::config::AgentConfig;
use ldm::tasks::smart::{AttributeSource, SmartReading};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn fake_device(sys_block: &Path, name: &str, sectors: u64) {
    let dir = sys_block.join(name);
    std::fs::create_dir_all(dir.join("queue")).unwrap();
    std::fs::write(dir.join("size"), format!("{sectors}\n")).unwrap();
    std::fs::write(dir.join("queue").join("rotational"), "0\n").unwrap();
}

/// Standalone agent `storage/agent-1` on node `n1`, metrics on an ephemeral port.
pub fn standalone_config(sys_block: &Path) -> AgentConfig {
    let mut cfg = AgentConfig {
        namespace: "storage".into(),
        pod_name: "agent-1".into(),
        node_name: "n1".into(),
        standalone: true,
        sys_block_path: sys_block.to_path_buf(),
        disk_poll_interval_secs: 1,
        ..Default::default()
    };
    cfg.metrics.host = "127.0.0.1".into();
    cfg.metrics.port = 0;
    cfg.lease.lease_duration_secs = 3;
    cfg.lease.renew_deadline_secs = 2;
    cfg.lease.retry_period_secs = 1;
    cfg.validate().unwrap();
    cfg
}

/// Healthy disk readings, counting calls.
#[derive(Default)]
pub struct StaticSmart {
    pub calls: AtomicUsize,
}

#[async_trait]
impl AttributeSource for StaticSmart {
    async fn collect(&self, device_path: &str) -> anyhow::Result<SmartReading> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if device_path.ends_with("bad") {
            anyhow::bail!("no such device");
        }
        Ok(SmartReading {
            passed: true,
            temperature_celsius: Some(30),
            power_on_hours: Some(100),
        })
    }
}

/// Poll `check` until it holds or ten seconds pass.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
