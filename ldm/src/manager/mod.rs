//! Scoped managers: a scheme, an indexed cache filled by an informer, and
//! the controllers reconciling its objects.

pub mod cache;
pub mod factory;
pub mod metrics;
pub mod scheme;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::{Controller, ReconcileContext};
use crate::resource::{BackendError, ResourceBackend, WatchEventStream};
use cache::{CacheReader, LookupIndex, ResourceCache};
use self::metrics::MetricsRegistry;
use scheme::Scheme;

pub use factory::new_manager;

const QUEUE_CAPACITY: usize = 1024;
const RELIST_BACKOFF_START: Duration = Duration::from_millis(200);
const RELIST_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerScope {
    Cluster,
    Node,
}

impl fmt::Display for ManagerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerScope::Cluster => write!(f, "cluster"),
            ManagerScope::Node => write!(f, "node"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// `None` disables the metrics endpoint.
    pub metrics_bind_address: Option<SocketAddr>,
    pub node_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("kind {0} is already registered")]
    DuplicateKind(String),
    #[error("kind {0} is not registered in the scheme")]
    KindNotRegistered(String),
    #[error("index {0} cannot be added after the cache has started")]
    CacheStarted(String),
    #[error("index {0} is already registered")]
    IndexConflict(String),
    #[error("no index registered for field {0}")]
    IndexNotFound(String),
    #[error("invalid metrics address: {0}")]
    InvalidMetricsAddress(String),
    #[error("failed to bind metrics endpoint {addr}: {source}")]
    MetricsBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} manager is already running")]
    AlreadyRunning(ManagerScope),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Assembles a [`Manager`]. Kinds go into the scheme first, then indexes,
/// then controllers; `build` freezes the result.
pub struct ManagerBuilder {
    scope: ManagerScope,
    options: ManagerOptions,
    scheme: Scheme,
    cache: Arc<ResourceCache>,
    backend: Arc<dyn ResourceBackend>,
    controllers: Vec<Arc<dyn Controller>>,
    metrics: Arc<MetricsRegistry>,
}

impl ManagerBuilder {
    pub fn new(
        scope: ManagerScope,
        options: ManagerOptions,
        backend: Arc<dyn ResourceBackend>,
    ) -> Self {
        Self {
            scope,
            options,
            scheme: Scheme::new(),
            cache: Arc::new(ResourceCache::new()),
            backend,
            controllers: Vec::new(),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn scope(&self) -> ManagerScope {
        self.scope
    }

    pub fn scheme_mut(&mut self) -> &mut Scheme {
        &mut self.scheme
    }

    pub async fn index_field(&self, kind: &str, index: LookupIndex) -> Result<(), ManagerError> {
        self.cache.index_field(&self.scheme, kind, index).await
    }

    pub fn add_controller(&mut self, controller: Arc<dyn Controller>) {
        debug!(scope = %self.scope, controller = controller.name(), "controller registered");
        self.controllers.push(controller);
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn build(self) -> Manager {
        let (metrics_addr, _) = watch::channel(None);
        let (running, _) = watch::channel(false);
        Manager {
            scope: self.scope,
            options: self.options,
            scheme: self.scheme,
            cache: self.cache,
            backend: self.backend,
            controllers: self.controllers,
            metrics: self.metrics,
            metrics_addr,
            running,
        }
    }
}

pub struct Manager {
    scope: ManagerScope,
    options: ManagerOptions,
    scheme: Scheme,
    cache: Arc<ResourceCache>,
    backend: Arc<dyn ResourceBackend>,
    controllers: Vec<Arc<dyn Controller>>,
    metrics: Arc<MetricsRegistry>,
    metrics_addr: watch::Sender<Option<SocketAddr>>,
    running: watch::Sender<bool>,
}

impl Manager {
    pub fn scope(&self) -> ManagerScope {
        self.scope
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn controller_names(&self) -> Vec<&'static str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    pub fn cache_reader(&self) -> CacheReader {
        self.cache.reader()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    /// Address the metrics endpoint is bound to while running.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        *self.metrics_addr.borrow()
    }

    pub fn subscribe_metrics_addr(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.metrics_addr.subscribe()
    }

    /// True while `start` is running.
    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// Run until `cancel` fires. Fails if the metrics endpoint cannot bind or
    /// the informer's first list fails.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), ManagerError> {
        if self.running.send_replace(true) {
            return Err(ManagerError::AlreadyRunning(self.scope));
        }
        info!(scope = %self.scope, "Starting manager");
        let run_token = cancel.child_token();
        let result = self.run(run_token.clone()).await;
        run_token.cancel();
        self.metrics_addr.send_replace(None);
        self.running.send_replace(false);
        match &result {
            Ok(()) => info!(scope = %self.scope, "Manager stopped"),
            Err(e) => error!(scope = %self.scope, "Manager failed: {e}"),
        }
        result
    }

    async fn run(&self, token: CancellationToken) -> Result<(), ManagerError> {
        let mut background = JoinSet::new();

        if let Some(addr) = self.options.metrics_bind_address {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ManagerError::MetricsBind { addr, source })?;
            let local = listener
                .local_addr()
                .map_err(|source| ManagerError::MetricsBind { addr, source })?;
            self.metrics_addr.send_replace(Some(local));
            let registry = self.metrics.clone();
            let cancel = token.clone();
            let scope = self.scope;
            background.spawn(async move {
                if let Err(e) = self::metrics::serve(listener, registry, cancel).await {
                    warn!(scope = %scope, "metrics endpoint stopped: {e}");
                }
            });
        } else {
            debug!(scope = %self.scope, "metrics endpoint disabled");
        }

        let (queue, _) = broadcast::channel::<String>(QUEUE_CAPACITY);
        let ctx = ReconcileContext {
            scope: self.scope,
            node_name: self.options.node_name.clone(),
            cache: self.cache.reader(),
            backend: self.backend.clone(),
            metrics: self.metrics.clone(),
        };
        for controller in &self.controllers {
            background.spawn(run_controller(
                controller.clone(),
                ctx.clone(),
                queue.subscribe(),
                token.clone(),
            ));
        }

        let mut stream = match self.sync(&queue).await {
            Ok(stream) => stream,
            Err(e) => {
                token.cancel();
                while background.join_next().await.is_some() {}
                return Err(e);
            }
        };
        self.cache.mark_started();
        info!(scope = %self.scope, "cache synced");

        let mut backoff = RELIST_BACKOFF_START;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => {
                            self.cache.apply(&event).await;
                            let _ = queue.send(event.name().to_string());
                            continue;
                        }
                        Some(Err(e)) => warn!(scope = %self.scope, "watch failed: {e}"),
                        None => debug!(scope = %self.scope, "watch closed"),
                    }
                }
            }
            // relist and rewatch until the backend answers again
            loop {
                match self.sync(&queue).await {
                    Ok(s) => {
                        stream = s;
                        backoff = RELIST_BACKOFF_START;
                        break;
                    }
                    Err(e) => {
                        warn!(scope = %self.scope, "relist failed, retrying in {backoff:?}: {e}");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(RELIST_BACKOFF_MAX);
                    }
                }
            }
            if token.is_cancelled() {
                break;
            }
        }

        while background.join_next().await.is_some() {}
        Ok(())
    }

    /// List into the cache, queue every object, and watch from the listed revision.
    async fn sync(&self, queue: &broadcast::Sender<String>) -> Result<WatchEventStream, ManagerError> {
        let (objects, revision) = self.backend.list().await?;
        let names: Vec<String> = objects.iter().map(|d| d.name().to_string()).collect();
        self.cache.replace(objects).await;
        let stream = self.backend.watch(revision + 1).await?;
        for name in names {
            let _ = queue.send(name);
        }
        Ok(stream)
    }
}

async fn run_controller(
    controller: Arc<dyn Controller>,
    ctx: ReconcileContext,
    mut queue: broadcast::Receiver<String>,
    token: CancellationToken,
) {
    let name = controller.name();
    loop {
        let key = tokio::select! {
            _ = token.cancelled() => return,
            key = queue.recv() => key,
        };
        match key {
            Ok(key) => reconcile_one(controller.as_ref(), &ctx, &key).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(scope = %ctx.scope, controller = name, skipped, "queue lagged, resyncing");
                for key in ctx.cache.list().await.iter().map(|d| d.name().to_string()) {
                    reconcile_one(controller.as_ref(), &ctx, &key).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn reconcile_one(controller: &dyn Controller, ctx: &ReconcileContext, key: &str) {
    let name = controller.name();
    match controller.reconcile(ctx, key).await {
        Ok(()) => {
            ctx.metrics
                .inc_counter("ldm_reconcile_total", &[("controller", name), ("result", "success")]);
        }
        Err(e) => {
            warn!(scope = %ctx.scope, controller = name, object = key, "reconcile failed: {e:#}");
            ctx.metrics
                .inc_counter("ldm_reconcile_total", &[("controller", name), ("result", "error")]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MemoryBackend;
    use async_trait::async_trait;
    use common::LocalDisk;
    use std::sync::Mutex;
    use tokio::time::timeout;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Controller for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn reconcile(&self, _ctx: &ReconcileContext, key: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    fn manager(backend: Arc<MemoryBackend>, seen: Arc<Mutex<Vec<String>>>) -> Manager {
        let mut builder = ManagerBuilder::new(ManagerScope::Node, ManagerOptions::default(), backend);
        scheme::add_to_scheme(builder.scheme_mut()).unwrap();
        builder.add_controller(Arc::new(Recorder(seen)));
        builder.build()
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, key: &str) {
        timeout(Duration::from_secs(5), async {
            while !seen.lock().unwrap().iter().any(|k| k == key) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("key never reconciled");
    }

    #[tokio::test]
    async fn test_informer_feeds_controllers() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put(&LocalDisk::new("n1", "sda", 1, false)).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mgr = Arc::new(manager(backend.clone(), seen.clone()));

        let token = CancellationToken::new();
        let mut live = mgr.liveness();
        let run = tokio::spawn({
            let mgr = mgr.clone();
            let token = token.clone();
            async move { mgr.start(token).await }
        });

        wait_for(&seen, "n1-sda").await;
        assert!(*live.borrow_and_update());
        backend.put(&LocalDisk::new("n1", "sdb", 1, false)).await.unwrap();
        wait_for(&seen, "n1-sdb").await;
        assert!(mgr.cache_reader().get("n1-sdb").await.is_some());

        assert!(matches!(
            mgr.start(CancellationToken::new()).await,
            Err(ManagerError::AlreadyRunning(ManagerScope::Node))
        ));

        token.cancel();
        run.await.unwrap().unwrap();
        assert!(!*mgr.liveness().borrow());
        assert!(mgr.metrics_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_fails_when_backend_down() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_unavailable(true).await;
        let mgr = manager(backend, Arc::new(Mutex::new(Vec::new())));
        let err = mgr.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Backend(BackendError::Unavailable(_))));
        assert!(!*mgr.liveness().borrow());
    }
}
