mod support;

use async_trait::async_trait;
use common::LocalDisk;
use ldm::lease::{LeaseStore, MemoryLeaseStore};
use ldm::metrics_publisher::{ServiceRecord, ServiceRegistry};
use ldm::resource::{BackendError, MemoryBackend, ResourceBackend, WatchEventStream};
use ldm::{Collaborators, ExitStatus, Orchestrator, SignalGate};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::{StaticSmart, fake_device, standalone_config, wait_until};
use tokio::net::TcpListener;
use tokio::time::timeout;

const ROLE: &str = "cluster-controller-master";

fn collaborators(store: Arc<MemoryLeaseStore>, backend: Arc<MemoryBackend>) -> Collaborators {
    Collaborators {
        lease_store: store,
        backend,
        service_registry: None,
        smart_source: Arc::new(StaticSmart::default()),
    }
}

/// A registry that never answers, like a store behind a partition.
struct Unanswered;

#[async_trait]
impl ServiceRegistry for Unanswered {
    async fn register(&self, _record: &ServiceRecord) -> anyhow::Result<()> {
        std::future::pending().await
    }
}

/// Memory backend whose list takes a while.
struct SlowList {
    inner: Arc<MemoryBackend>,
    delay: Duration,
}

#[async_trait]
impl ResourceBackend for SlowList {
    async fn list(&self) -> Result<(Vec<LocalDisk>, i64), BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.list().await
    }

    async fn get(&self, name: &str) -> Result<Option<LocalDisk>, BackendError> {
        self.inner.get(name).await
    }

    async fn put(&self, disk: &LocalDisk) -> Result<(), BackendError> {
        self.inner.put(disk).await
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.inner.delete(name).await
    }

    async fn watch(&self, since: i64) -> Result<WatchEventStream, BackendError> {
        self.inner.watch(since).await
    }
}

#[tokio::test]
async fn signal_shutdown_drains_within_grace() {
    let sys = tempfile::tempdir().unwrap();
    fake_device(sys.path(), "sda", 2048);
    let cfg = standalone_config(sys.path());
    let store = Arc::new(MemoryLeaseStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let gate = SignalGate::new();

    let run = tokio::spawn(
        Orchestrator::new(cfg, collaborators(store.clone(), backend.clone()), gate.clone()).run(),
    );

    wait_until("leadership", || {
        let store = store.clone();
        async move { store.holder(ROLE).await.unwrap().as_deref() == Some("storage/agent-1") }
    })
    .await;
    wait_until("disk published", || {
        let backend = backend.clone();
        async move { backend.get("n1-sda").await.unwrap().is_some() }
    })
    .await;

    // duplicate deliveries collapse into one transition
    let triggers: Vec<_> = (0..32)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.trigger("SIGTERM") })
        })
        .collect();
    let mut transitions = 0;
    for t in triggers {
        if t.await.unwrap() {
            transitions += 1;
        }
    }
    assert_eq!(transitions, 1);

    let status = timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Drained);
    assert_eq!(status.code(), 0);
    assert_eq!(store.holder(ROLE).await.unwrap(), None);
}

#[tokio::test]
async fn cluster_manager_failure_is_fatal() {
    let sys = tempfile::tempdir().unwrap();
    let mut cfg = standalone_config(sys.path());
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    cfg.metrics.port = taken.local_addr().unwrap().port();

    let status = timeout(
        Duration::from_secs(10),
        Orchestrator::new(
            cfg,
            collaborators(Arc::new(MemoryLeaseStore::new()), Arc::new(MemoryBackend::new())),
            SignalGate::new(),
        )
        .run(),
    )
    .await
    .unwrap();
    assert_eq!(status, ExitStatus::Fatal);
    assert_eq!(status.code(), 1);
}

#[tokio::test]
async fn node_manager_stop_exits_without_signal() {
    let sys = tempfile::tempdir().unwrap();
    let cfg = standalone_config(sys.path());
    let store = Arc::new(MemoryLeaseStore::new());
    // another agent leads, so only the node manager runs here
    assert!(
        store
            .try_acquire(ROLE, "storage/agent-2", Duration::from_secs(3600))
            .await
            .unwrap()
    );
    let backend = Arc::new(MemoryBackend::new());
    backend.set_unavailable(true).await;
    let gate = SignalGate::new();

    let status = timeout(
        Duration::from_secs(10),
        Orchestrator::new(cfg, collaborators(store, backend), gate.clone()).run(),
    )
    .await
    .unwrap();
    assert_eq!(status, ExitStatus::NodeManagerStopped);
    assert_eq!(status.code(), 3);
    assert!(gate.is_cancelled());
    // the forced stop already used up the one transition
    assert!(!gate.trigger("SIGTERM"));
}

#[tokio::test]
async fn hung_service_registry_does_not_block_shutdown() {
    let sys = tempfile::tempdir().unwrap();
    let cfg = standalone_config(sys.path());
    let mut collaborators = collaborators(Arc::new(MemoryLeaseStore::new()), Arc::new(MemoryBackend::new()));
    collaborators.service_registry = Some(Arc::new(Unanswered));
    let gate = SignalGate::new();

    let run = tokio::spawn(Orchestrator::new(cfg, collaborators, gate.clone()).run());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(gate.trigger("SIGTERM"));

    let status = timeout(Duration::from_secs(8), run).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Drained);
}

#[tokio::test]
async fn launch_collection_sees_disks_from_a_slow_list() {
    let sys = tempfile::tempdir().unwrap();
    fake_device(sys.path(), "sda", 2048);
    let cfg = standalone_config(sys.path());
    let memory = Arc::new(MemoryBackend::new());
    memory.put(&LocalDisk::new("n1", "sda", 2048 * 512, false)).await.unwrap();
    let smart = Arc::new(StaticSmart::default());
    let collaborators = Collaborators {
        lease_store: Arc::new(MemoryLeaseStore::new()),
        backend: Arc::new(SlowList {
            inner: memory.clone(),
            delay: Duration::from_millis(100),
        }),
        service_registry: None,
        smart_source: smart.clone(),
    };
    let gate = SignalGate::new();
    let run = tokio::spawn(Orchestrator::new(cfg, collaborators, gate.clone()).run());

    wait_until("launch collection", || {
        let memory = memory.clone();
        async move {
            memory
                .get("n1-sda")
                .await
                .unwrap()
                .is_some_and(|d| d.status.smart.is_some())
        }
    })
    .await;
    assert_eq!(smart.calls.load(Ordering::SeqCst), 1);

    gate.trigger("SIGTERM");
    let status = timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Drained);
}

#[tokio::test]
async fn failing_task_leaves_the_rest_running() {
    let sys = tempfile::tempdir().unwrap();
    fake_device(sys.path(), "sda", 2048);
    let mut cfg = standalone_config(sys.path());
    // a regular file where the socket directory should be
    let blocker = sys.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();
    cfg.csi.enable = true;
    cfg.csi.endpoint = format!("unix://{}/csi.sock", blocker.display());

    let store = Arc::new(MemoryLeaseStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let gate = SignalGate::new();
    let run = tokio::spawn(
        Orchestrator::new(cfg, collaborators(store.clone(), backend.clone()), gate.clone()).run(),
    );

    wait_until("first disk", || {
        let backend = backend.clone();
        async move { backend.get("n1-sda").await.unwrap().is_some() }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the monitor keeps working after the csi server died
    fake_device(sys.path(), "sdb", 4096);
    wait_until("second disk", || {
        let backend = backend.clone();
        async move { backend.get("n1-sdb").await.unwrap().is_some() }
    })
    .await;
    assert_eq!(
        store.holder(ROLE).await.unwrap().as_deref(),
        Some("storage/agent-1")
    );
    assert!(!run.is_finished());

    gate.trigger("SIGINT");
    let status = timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
    assert_eq!(status, ExitStatus::Drained);
}
