use anyhow::Context;
use common::LocalDisk;
use common::{DiskState, NODE_NAME_FIELD};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::cache::CacheReader;
use crate::resource::ResourceBackend;

const SECTOR_SIZE: u64 = 512;
const IGNORED_PREFIXES: [&str; 4] = ["loop", "ram", "zram", "sr"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub capacity_bytes: u64,
    pub rotational: bool,
}

pub type DeviceSnapshot = BTreeMap<String, BlockDevice>;

#[derive(Debug, PartialEq, Eq)]
pub enum DiskEvent {
    Added(String, BlockDevice),
    Removed(String),
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

/// Read the whole-disk block devices under a sysfs `block` directory.
pub async fn scan_block_devices(sys_block: &Path) -> anyhow::Result<DeviceSnapshot> {
    let mut snapshot = DeviceSnapshot::new();
    let mut entries = tokio::fs::read_dir(sys_block)
        .await
        .with_context(|| format!("failed to read {}", sys_block.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if IGNORED_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        let dir = entry.path();
        let sectors = match read_trimmed(&dir.join("size")).await {
            Some(s) => s.parse::<u64>().unwrap_or(0),
            None => continue,
        };
        if sectors == 0 {
            continue;
        }
        let rotational = read_trimmed(&dir.join("queue").join("rotational"))
            .await
            .is_some_and(|s| s == "1");
        snapshot.insert(
            name,
            BlockDevice {
                capacity_bytes: sectors * SECTOR_SIZE,
                rotational,
            },
        );
    }
    Ok(snapshot)
}

pub fn diff(previous: &DeviceSnapshot, current: &DeviceSnapshot) -> Vec<DiskEvent> {
    let mut events = Vec::new();
    for (name, dev) in current {
        if previous.get(name) != Some(dev) {
            events.push(DiskEvent::Added(name.clone(), dev.clone()));
        }
    }
    for name in previous.keys() {
        if !current.contains_key(name) {
            events.push(DiskEvent::Removed(name.clone()));
        }
    }
    events
}

/// Polls the kernel's block devices and publishes changes as `LocalDisk`
/// objects for this node.
pub struct DiskMonitor {
    node_name: String,
    sys_block_path: PathBuf,
    interval: Duration,
    cache: CacheReader,
    backend: Arc<dyn ResourceBackend>,
}

impl DiskMonitor {
    pub fn new(
        node_name: &str,
        sys_block_path: &Path,
        interval: Duration,
        cache: CacheReader,
        backend: Arc<dyn ResourceBackend>,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            sys_block_path: sys_block_path.to_path_buf(),
            interval,
            cache,
            backend,
        }
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut known = DeviceSnapshot::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            if !self.cache.has_synced() {
                debug!("cache not synced yet, postponing disk scan");
                continue;
            }
            let current = match scan_block_devices(&self.sys_block_path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("disk scan failed: {e:#}");
                    continue;
                }
            };
            let mut failed = false;
            for event in diff(&known, &current) {
                if let Err(e) = self.publish(&event).await {
                    warn!("failed to publish {event:?}: {e:#}");
                    failed = true;
                }
            }
            // retry everything on the next tick if anything failed
            if !failed {
                known = current;
            }
        }
    }

    async fn publish(&self, event: &DiskEvent) -> anyhow::Result<()> {
        match event {
            DiskEvent::Added(dev, info) => {
                let mut disk =
                    LocalDisk::new(&self.node_name, dev, info.capacity_bytes, info.rotational);
                if let Some(existing) = self.cache.get(disk.name()).await {
                    if existing.spec == disk.spec && existing.is_active() {
                        return Ok(());
                    }
                    disk.status.smart = existing.status.smart;
                    disk.metadata.resource_version = existing.metadata.resource_version;
                }
                info!(disk = disk.name(), capacity = info.capacity_bytes, "disk attached");
                self.backend.put(&disk).await?;
            }
            DiskEvent::Removed(dev) => {
                let name = format!("{}-{dev}", self.node_name);
                let owned = self.cache.by_index(NODE_NAME_FIELD, &self.node_name).await?;
                if let Some(mut disk) = owned.into_iter().find(|d| d.name() == name) {
                    if disk.status.state != DiskState::Inactive {
                        info!(disk = %name, "disk detached");
                        disk.status.state = DiskState::Inactive;
                        self.backend.put(&disk).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::cache::{ResourceCache, node_name_index};
    use crate::manager::scheme::{Scheme, add_to_scheme};
    use crate::resource::MemoryBackend;
    use common::LOCAL_DISK_KIND;
    use std::fs;

    fn fake_device(root: &Path, name: &str, sectors: u64, rotational: bool) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("queue")).unwrap();
        fs::write(dir.join("size"), format!("{sectors}\n")).unwrap();
        fs::write(
            dir.join("queue").join("rotational"),
            if rotational { "1\n" } else { "0\n" },
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_scan_skips_virtual_devices() {
        let sys = tempfile::tempdir().unwrap();
        fake_device(sys.path(), "sda", 2048, true);
        fake_device(sys.path(), "nvme0n1", 4096, false);
        fake_device(sys.path(), "loop0", 100, false);
        fake_device(sys.path(), "sdz", 0, false);

        let snap = scan_block_devices(sys.path()).await.unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(
            snap["sda"],
            BlockDevice {
                capacity_bytes: 2048 * 512,
                rotational: true
            }
        );
        assert!(!snap["nvme0n1"].rotational);
    }

    #[test]
    fn test_diff() {
        let dev = BlockDevice {
            capacity_bytes: 1,
            rotational: false,
        };
        let before = DeviceSnapshot::from([("sda".to_string(), dev.clone())]);
        let after = DeviceSnapshot::from([("sdb".to_string(), dev.clone())]);
        assert_eq!(
            diff(&before, &after),
            vec![
                DiskEvent::Added("sdb".into(), dev),
                DiskEvent::Removed("sda".into())
            ]
        );
        assert!(diff(&after, &after).is_empty());
    }

    #[tokio::test]
    async fn test_publish_writes_through_backend() {
        let mut scheme = Scheme::new();
        add_to_scheme(&mut scheme).unwrap();
        let cache = Arc::new(ResourceCache::new());
        cache
            .index_field(&scheme, LOCAL_DISK_KIND, node_name_index())
            .await
            .unwrap();
        cache.replace(vec![LocalDisk::new("n1", "sdb", 1, false)]).await;
        cache.mark_started();
        let backend = Arc::new(MemoryBackend::new());
        let monitor = DiskMonitor::new(
            "n1",
            Path::new("/nonexistent"),
            Duration::from_secs(5),
            cache.reader(),
            backend.clone(),
        );

        let dev = BlockDevice {
            capacity_bytes: 4096,
            rotational: true,
        };
        monitor
            .publish(&DiskEvent::Added("sda".into(), dev))
            .await
            .unwrap();
        monitor.publish(&DiskEvent::Removed("sdb".into())).await.unwrap();

        let added = backend.get("n1-sda").await.unwrap().unwrap();
        assert_eq!(added.spec.capacity_bytes, 4096);
        assert!(added.is_active());
        let removed = backend.get("n1-sdb").await.unwrap().unwrap();
        assert_eq!(removed.status.state, DiskState::Inactive);
        // the cache is left to the informer
        assert!(cache.get("n1-sda").await.is_none());
    }
}
