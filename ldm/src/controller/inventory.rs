use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Controller, ReconcileContext};

pub const DISKS_GAUGE: &str = "ldm_node_disks";
pub const ACTIVE_DISKS_GAUGE: &str = "ldm_node_active_disks";

/// Keeps per-node disk counts current for the whole cluster. A node whose
/// last disk is gone keeps reporting zero.
#[derive(Default)]
pub struct DiskInventoryController {
    reported: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl Controller for DiskInventoryController {
    fn name(&self) -> &'static str {
        "disk-inventory"
    }

    async fn reconcile(&self, ctx: &ReconcileContext, key: &str) -> anyhow::Result<()> {
        debug!(object = key, "recounting disk inventory");
        // node -> (total, active)
        let mut per_node: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        for disk in ctx.cache.list().await {
            let entry = per_node.entry(disk.node_name().to_string()).or_default();
            entry.0 += 1;
            if disk.is_active() {
                entry.1 += 1;
            }
        }

        let mut reported = self.reported.lock().await;
        for node in reported.iter().filter(|n| !per_node.contains_key(*n)) {
            let labels = [("node", node.as_str())];
            ctx.metrics.set_gauge(DISKS_GAUGE, &labels, 0);
            ctx.metrics.set_gauge(ACTIVE_DISKS_GAUGE, &labels, 0);
        }
        for (node, (total, active)) in &per_node {
            let labels = [("node", node.as_str())];
            ctx.metrics.set_gauge(DISKS_GAUGE, &labels, *total);
            ctx.metrics.set_gauge(ACTIVE_DISKS_GAUGE, &labels, *active);
            if *active == 0 {
                warn!(node = %node, disks = total, "node has no active disk");
            }
        }
        reported.extend(per_node.into_keys());
        Ok(())
    }
}
