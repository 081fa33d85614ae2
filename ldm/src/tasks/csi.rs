use anyhow::{Context, bail};
use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CsiConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Probe {
    pub ready: bool,
}

struct ServerState {
    plugin: PluginInfo,
    node: NodeInfo,
}

/// `unix://<path>` to `<path>`.
pub fn socket_path(endpoint: &str) -> anyhow::Result<PathBuf> {
    match endpoint.strip_prefix("unix://") {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => bail!("unsupported csi endpoint {endpoint}"),
    }
}

/// Serves the storage plugin's identity and node information on a unix socket.
pub struct CsiServer {
    socket: PathBuf,
    state: Arc<ServerState>,
}

impl CsiServer {
    pub fn new(cfg: &CsiConfig) -> anyhow::Result<Self> {
        Ok(Self {
            socket: socket_path(&cfg.endpoint)?,
            state: Arc::new(ServerState {
                plugin: PluginInfo {
                    name: cfg.driver_name.clone(),
                    vendor_version: cfg.vendor_version.clone(),
                },
                node: NodeInfo {
                    node_id: cfg.node_id.clone(),
                },
            }),
        })
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/identity", get(handle_identity))
            .route("/probe", get(handle_probe))
            .route("/node", get(handle_node))
            .with_state(self.state.clone())
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        if let Some(dir) = self.socket.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        // a socket left by a previous run blocks bind
        match tokio::fs::remove_file(&self.socket).await {
            Ok(()) => warn!("removed stale socket {}", self.socket.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to remove stale socket"),
        }
        let listener = UnixListener::bind(&self.socket)
            .with_context(|| format!("failed to bind {}", self.socket.display()))?;
        info!(driver = %self.state.plugin.name, "Listening for connections on {}", self.socket.display());

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        let _ = tokio::fs::remove_file(&self.socket).await;
        served.context("csi server failed")
    }
}

async fn handle_identity(State(state): State<Arc<ServerState>>) -> Json<PluginInfo> {
    Json(state.plugin.clone())
}

async fn handle_probe() -> Json<Probe> {
    Json(Probe { ready: true })
}

async fn handle_node(State(state): State<Arc<ServerState>>) -> Json<NodeInfo> {
    Json(state.node.clone())
}
