//! Reconcilers run by the managers, one set per scope.

pub mod inventory;
pub mod node_disk;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::manager::cache::CacheReader;
use crate::manager::metrics::MetricsRegistry;
use crate::manager::{ManagerBuilder, ManagerScope};
use crate::resource::ResourceBackend;

pub use inventory::DiskInventoryController;
pub use node_disk::NodeDiskController;

/// What a controller sees while reconciling: reads go to the cache,
/// writes go to the backend.
#[derive(Clone)]
pub struct ReconcileContext {
    pub scope: ManagerScope,
    pub node_name: String,
    pub cache: CacheReader,
    pub backend: Arc<dyn ResourceBackend>,
    pub metrics: Arc<MetricsRegistry>,
}

#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bring the object named `key` in line with the observed world. The
    /// object may already be gone from the cache.
    async fn reconcile(&self, ctx: &ReconcileContext, key: &str) -> anyhow::Result<()>;
}

/// Cluster scope controllers.
pub fn add_to_manager(builder: &mut ManagerBuilder) {
    builder.add_controller(Arc::new(DiskInventoryController::default()));
}

/// Node scope controllers.
pub fn add_to_node_manager(builder: &mut ManagerBuilder, sys_block_path: &Path) {
    builder.add_controller(Arc::new(NodeDiskController::new(sys_block_path)));
}
