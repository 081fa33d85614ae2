use anyhow::Context;
use async_trait::async_trait;
use common::{DiskState, NODE_NAME_FIELD};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{Controller, ReconcileContext};

/// Reconciles the disks owned by this node against the devices the kernel
/// currently exposes.
pub struct NodeDiskController {
    sys_block_path: PathBuf,
}

impl NodeDiskController {
    pub fn new(sys_block_path: &Path) -> Self {
        Self {
            sys_block_path: sys_block_path.to_path_buf(),
        }
    }

    async fn device_present(&self, device_path: &str) -> bool {
        let Some(dev) = Path::new(device_path).file_name() else {
            return false;
        };
        tokio::fs::try_exists(self.sys_block_path.join(dev))
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl Controller for NodeDiskController {
    fn name(&self) -> &'static str {
        "node-disk"
    }

    async fn reconcile(&self, ctx: &ReconcileContext, key: &str) -> anyhow::Result<()> {
        let owned = ctx.cache.by_index(NODE_NAME_FIELD, &ctx.node_name).await?;
        let Some(mut disk) = owned.into_iter().find(|d| d.name() == key) else {
            // deleted, or owned by another node
            return Ok(());
        };

        let present = self.device_present(&disk.spec.device_path).await;
        let want = if present {
            DiskState::Active
        } else {
            DiskState::Inactive
        };
        if disk.status.state == want {
            return Ok(());
        }
        info!(
            disk = key,
            device = %disk.spec.device_path,
            "disk state {:?} -> {:?}", disk.status.state, want
        );
        disk.status.state = want;
        ctx.backend
            .put(&disk)
            .await
            .with_context(|| format!("failed to update disk {key}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerScope;
    use crate::manager::cache::{ResourceCache, node_name_index};
    use crate::manager::metrics::MetricsRegistry;
    use crate::manager::scheme::{Scheme, add_to_scheme};
    use crate::resource::{MemoryBackend, ResourceBackend};
    use common::{LOCAL_DISK_KIND, LocalDisk};
    use std::sync::Arc;

    async fn setup(
        sys: &Path,
        disks: Vec<LocalDisk>,
    ) -> (NodeDiskController, ReconcileContext, Arc<MemoryBackend>) {
        let mut scheme = Scheme::new();
        add_to_scheme(&mut scheme).unwrap();
        let cache = Arc::new(ResourceCache::new());
        cache
            .index_field(&scheme, LOCAL_DISK_KIND, node_name_index())
            .await
            .unwrap();
        cache.replace(disks).await;
        let backend = Arc::new(MemoryBackend::new());
        let ctx = ReconcileContext {
            scope: ManagerScope::Node,
            node_name: "n1".into(),
            cache: cache.reader(),
            backend: backend.clone(),
            metrics: Arc::new(MetricsRegistry::new()),
        };
        (NodeDiskController::new(sys), ctx, backend)
    }

    #[tokio::test]
    async fn test_missing_device_marked_inactive() {
        let sys = tempfile::tempdir().unwrap();
        std::fs::create_dir(sys.path().join("sda")).unwrap();
        let (ctrl, ctx, backend) = setup(
            sys.path(),
            vec![
                LocalDisk::new("n1", "sda", 1, false),
                LocalDisk::new("n1", "sdb", 1, false),
            ],
        )
        .await;

        ctrl.reconcile(&ctx, "n1-sda").await.unwrap();
        assert!(backend.get("n1-sda").await.unwrap().is_none());

        ctrl.reconcile(&ctx, "n1-sdb").await.unwrap();
        let written = backend.get("n1-sdb").await.unwrap().unwrap();
        assert_eq!(written.status.state, DiskState::Inactive);
    }

    #[tokio::test]
    async fn test_other_nodes_ignored() {
        let sys = tempfile::tempdir().unwrap();
        let (ctrl, ctx, backend) =
            setup(sys.path(), vec![LocalDisk::new("n2", "sdb", 1, false)]).await;
        ctrl.reconcile(&ctx, "n2-sdb").await.unwrap();
        assert!(backend.list().await.unwrap().0.is_empty());
    }
}
