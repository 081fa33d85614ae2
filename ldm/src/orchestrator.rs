//! Process-level wiring: both managers, the background tasks, the lease
//! runner and the shutdown sequence.

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::xlinestore::XlineStore;
use crate::config::AgentConfig;
use crate::lease::{LeaseError, LeaseGatedRunner, LeaseStore, MemoryLeaseStore, XlineLeaseStore};
use crate::manager::{Manager, ManagerError, ManagerScope, new_manager};
use crate::metrics_publisher::{ServiceRegistry, publish_metrics_service};
use crate::resource::{MemoryBackend, ResourceBackend, XlineResourceBackend};
use crate::shutdown::{DrainResult, ExitStatus, ShutdownCoordinator};
use crate::signal::SignalGate;
use crate::tasks::csi::CsiServer;
use crate::tasks::disk_monitor::DiskMonitor;
use crate::tasks::smart::{AttributeSource, SmartCollector, Smartctl};
use crate::tasks::{self, BackgroundTask, RestartPolicy};

/// External services the agent talks to.
pub struct Collaborators {
    pub lease_store: Arc<dyn LeaseStore>,
    pub backend: Arc<dyn ResourceBackend>,
    /// `None` outside a cluster; the service record is then skipped.
    pub service_registry: Option<Arc<dyn ServiceRegistry>>,
    pub smart_source: Arc<dyn AttributeSource>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Collaborators {
            lease_store: Arc::new(MemoryLeaseStore::new()),
            backend: Arc::new(MemoryBackend::new()),
            service_registry: None,
            smart_source: Arc::new(Smartctl::default()),
        }
    }

    /// Connect to the coordination store, or stay in memory when standalone.
    /// A connection failure here is fatal.
    pub async fn connect(cfg: &AgentConfig) -> anyhow::Result<Self> {
        if cfg.standalone {
            info!("running standalone, leases and resources stay in memory");
            return Ok(Self::in_memory());
        }
        let store = XlineStore::new(&cfg.xline_config)
            .await
            .with_context(|| format!("failed to connect to {:?}", cfg.xline_config.endpoints))?;
        info!(endpoints = ?cfg.xline_config.endpoints, "connected to coordination store");
        Ok(Collaborators {
            lease_store: Arc::new(XlineLeaseStore::new(store.clone())),
            backend: Arc::new(XlineResourceBackend::new(store.clone())),
            service_registry: Some(Arc::new(store)),
            smart_source: Arc::new(Smartctl::default()),
        })
    }
}

enum Stop {
    ClusterFailed(LeaseError),
    NodeStopped(Option<ManagerError>),
}

pub struct Orchestrator {
    cfg: AgentConfig,
    collaborators: Collaborators,
    gate: SignalGate,
}

impl Orchestrator {
    pub fn new(cfg: AgentConfig, collaborators: Collaborators, gate: SignalGate) -> Self {
        Self {
            cfg,
            collaborators,
            gate,
        }
    }

    fn background_tasks(&self, node: &Manager) -> anyhow::Result<Vec<BackgroundTask>> {
        let cfg = &self.cfg;
        let backend = &self.collaborators.backend;
        let mut list = Vec::new();

        let monitor = DiskMonitor::new(
            &cfg.node_name,
            &cfg.sys_block_path,
            cfg.disk_poll_interval(),
            node.cache_reader(),
            backend.clone(),
        );
        list.push(
            BackgroundTask::new("disk-monitor", move |token| monitor.run(token))
                .with_restart_policy(RestartPolicy::Internal),
        );

        let collector = SmartCollector::new(
            &cfg.node_name,
            cfg.smart_sync_period(),
            self.collaborators.smart_source.clone(),
            node.cache_reader(),
            backend.clone(),
        );
        list.push(
            BackgroundTask::new("smart-collector", move |token| collector.run(token))
                .with_restart_policy(RestartPolicy::Internal),
        );

        if cfg.csi.enable {
            let server = CsiServer::new(&cfg.csi)?;
            list.push(BackgroundTask::new("csi-server", move |token| server.run(token)));
        } else {
            info!("csi server disabled");
        }
        Ok(list)
    }

    /// Run until a signal or a fatal condition, then shut down within the
    /// grace period.
    pub async fn run(self) -> ExitStatus {
        let token = self.gate.token();
        let cfg = &self.cfg;

        let cluster = match new_manager(ManagerScope::Cluster, cfg, self.collaborators.backend.clone()).await {
            Ok(m) => Arc::new(m),
            Err(e) => {
                error!(scope = "cluster", "failed to build manager: {e}");
                return ExitStatus::Fatal;
            }
        };
        let node = match new_manager(ManagerScope::Node, cfg, self.collaborators.backend.clone()).await {
            Ok(m) => Arc::new(m),
            Err(e) => {
                error!(scope = "node", "failed to build manager: {e}");
                return ExitStatus::Fatal;
            }
        };
        let background = match self.background_tasks(&node) {
            Ok(t) => t,
            Err(e) => {
                error!("failed to prepare background tasks: {e:#}");
                return ExitStatus::Fatal;
            }
        };

        let handles = tasks::launch(background, &token);
        let (stop_tx, mut stop_rx) = mpsc::channel::<Stop>(2);

        let runner = LeaseGatedRunner::new(self.collaborators.lease_store.clone(), cfg.lease.timing());
        let cluster_unit = tokio::spawn({
            let identity = cfg.identity();
            let role = cfg.lease.role.clone();
            let token = token.clone();
            let stop_tx = stop_tx.clone();
            async move {
                let result = runner
                    .run_with_lease(&identity.namespace, &identity.pod_name, &role, token, move |child| {
                        let mgr = cluster.clone();
                        async move { mgr.start(child).await.map_err(anyhow::Error::from) }
                    })
                    .await;
                if let Err(e) = result {
                    let _ = stop_tx.send(Stop::ClusterFailed(e)).await;
                }
            }
        });

        let node_unit = tokio::spawn({
            let token = token.clone();
            let node = node.clone();
            async move {
                let result = node.start(token.clone()).await;
                if !token.is_cancelled() {
                    let _ = stop_tx.send(Stop::NodeStopped(result.err())).await;
                }
            }
        });

        // best effort: a hung registry must not hold up shutdown
        tokio::spawn({
            let cfg = cfg.clone();
            let registry = self.collaborators.service_registry.clone();
            let token = token.clone();
            async move {
                tokio::select! {
                    _ = token.cancelled() => debug!("shutdown before metrics service was published"),
                    _ = publish_metrics_service(&cfg, registry.as_deref()) => {}
                }
            }
        });

        let stop = tokio::select! {
            _ = token.cancelled() => None,
            stop = stop_rx.recv() => stop,
        };
        let forced = match stop {
            None => None,
            Some(Stop::ClusterFailed(e)) => {
                error!(role = %cfg.lease.role, "cluster manager stopped: {e}");
                Some(ExitStatus::Fatal)
            }
            Some(Stop::NodeStopped(e)) => {
                match e {
                    Some(e) => error!(scope = "node", "problem running manager: {e}"),
                    None => error!(scope = "node", "manager stopped unexpectedly"),
                }
                Some(ExitStatus::NodeManagerStopped)
            }
        };
        match forced {
            Some(ExitStatus::Fatal) => self.gate.trigger("cluster manager failed"),
            Some(_) => self.gate.trigger("node manager stopped"),
            None => false,
        };

        let mut units: Vec<BoxFuture<'static, ()>> =
            handles.into_iter().map(|h| h.join().boxed()).collect();
        units.push(cluster_unit.map(|_| ()).boxed());
        units.push(node_unit.map(|_| ()).boxed());

        let drained = ShutdownCoordinator::new(cfg.shutdown_grace()).drain(units).await;
        let status = match (forced, drained) {
            (Some(status), _) => status,
            (None, DrainResult::Drained) => ExitStatus::Drained,
            (None, DrainResult::GraceExpired) => {
                warn!("some units did not stop in time");
                ExitStatus::GraceExpired
            }
        };
        info!(status = %status, code = status.code(), "local disk manager exiting");
        status
    }
}

