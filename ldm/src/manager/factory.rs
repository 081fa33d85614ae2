use common::LOCAL_DISK_KIND;
use std::sync::Arc;
use tracing::info;

use super::cache::node_name_index;
use super::scheme::add_to_scheme;
use super::{Manager, ManagerBuilder, ManagerError, ManagerOptions, ManagerScope};
use crate::config::AgentConfig;
use crate::controller;
use crate::resource::ResourceBackend;

fn options_for(scope: ManagerScope, cfg: &AgentConfig) -> Result<ManagerOptions, ManagerError> {
    let metrics_bind_address = match scope {
        ManagerScope::Cluster => Some(
            cfg.metrics
                .bind_address()
                .map_err(|e| ManagerError::InvalidMetricsAddress(e.to_string()))?,
        ),
        ManagerScope::Node => None,
    };
    Ok(ManagerOptions {
        metrics_bind_address,
        node_name: cfg.node_name.clone(),
    })
}

/// Build the manager for one scope: options, then scheme, then indexes, then
/// controllers. Any failure leaves nothing running.
pub async fn new_manager(
    scope: ManagerScope,
    cfg: &AgentConfig,
    backend: Arc<dyn ResourceBackend>,
) -> Result<Manager, ManagerError> {
    let options = options_for(scope, cfg)?;
    let mut builder = ManagerBuilder::new(scope, options, backend);

    add_to_scheme(builder.scheme_mut())?;
    builder.index_field(LOCAL_DISK_KIND, node_name_index()).await?;

    match scope {
        ManagerScope::Cluster => controller::add_to_manager(&mut builder),
        ManagerScope::Node => controller::add_to_node_manager(&mut builder, &cfg.sys_block_path),
    }

    let manager = builder.build();
    info!(
        scope = %scope,
        metrics = ?manager.options().metrics_bind_address,
        controllers = ?manager.controller_names(),
        "manager built"
    );
    Ok(manager)
}
