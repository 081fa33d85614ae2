//! One-shot, best-effort publication of the metrics service record.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::xlinestore::XlineStore;
use crate::config::AgentConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    pub pod_name: String,
    pub ports: Vec<ServicePort>,
}

impl ServiceRecord {
    pub fn for_agent(cfg: &AgentConfig) -> Self {
        ServiceRecord {
            name: cfg.metrics.service_name.clone(),
            namespace: cfg.namespace.clone(),
            pod_name: cfg.pod_name.clone(),
            ports: vec![
                ServicePort {
                    name: "http-metrics".to_string(),
                    port: cfg.metrics.port,
                },
                ServicePort {
                    name: "cr-metrics".to_string(),
                    port: cfg.metrics.operator_port,
                },
            ],
        }
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(&self, record: &ServiceRecord) -> anyhow::Result<()>;
}

#[async_trait]
impl ServiceRegistry for XlineStore {
    async fn register(&self, record: &ServiceRecord) -> anyhow::Result<()> {
        let value = serde_json::to_string(record)?;
        self.put_value(&self.service_key(&record.namespace, &record.name), &value)
            .await
            .context("failed to write service record")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Skipped(&'static str),
    Failed(String),
}

/// Publish the service record once. Never fails: every outcome is logged
/// and returned for the caller to inspect.
pub async fn publish_metrics_service(
    cfg: &AgentConfig,
    registry: Option<&dyn ServiceRegistry>,
) -> PublishOutcome {
    let Some(registry) = registry else {
        info!("Skipping metrics service creation; not running in a cluster.");
        return PublishOutcome::Skipped("not running in a cluster");
    };
    let record = ServiceRecord::for_agent(cfg);
    match registry.register(&record).await {
        Ok(()) => {
            info!(service = %record.name, "metrics service published");
            PublishOutcome::Published
        }
        Err(e) => {
            warn!("Could not create metrics Service: {e:#}");
            PublishOutcome::Failed(format!("{e:#}"))
        }
    }
}
