use axum::{Router, extract::State, http::StatusCode, routing::get};
use metrics::{Key, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

const METADATA: Metadata<'static> = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// One manager's metrics. Each manager owns its recorder instead of the
/// process-global one, so two managers never share series.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        Self { recorder, handle }
    }
}

fn key(name: &str, label_pairs: &[(&str, &str)]) -> Key {
    let labels: Vec<Label> = label_pairs
        .iter()
        .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
        .collect();
    Key::from_parts(name.to_string(), labels)
}

/// The sample line prefix the exporter writes for a series.
fn series(name: &str, label_pairs: &[(&str, &str)]) -> String {
    if label_pairs.is_empty() {
        return name.to_string();
    }
    let body: Vec<String> = label_pairs
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{name}{{{}}}", body.join(","))
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_counter(&self, name: &str, label_pairs: &[(&str, &str)]) {
        self.recorder
            .register_counter(&key(name, label_pairs), &METADATA)
            .increment(1);
    }

    pub fn set_gauge(&self, name: &str, label_pairs: &[(&str, &str)], value: i64) {
        self.recorder
            .register_gauge(&key(name, label_pairs), &METADATA)
            .set(value as f64);
    }

    pub fn counter(&self, name: &str, label_pairs: &[(&str, &str)]) -> u64 {
        self.sample(name, label_pairs).map_or(0, |v| v as u64)
    }

    pub fn gauge(&self, name: &str, label_pairs: &[(&str, &str)]) -> Option<i64> {
        self.sample(name, label_pairs).map(|v| v as i64)
    }

    /// Prometheus text exposition of every series.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    fn sample(&self, name: &str, label_pairs: &[(&str, &str)]) -> Option<f64> {
        let prefix = format!("{} ", series(name, label_pairs));
        self.render()
            .lines()
            .find_map(|line| line.strip_prefix(&prefix))
            .and_then(|value| value.trim().parse().ok())
    }
}

async fn handle_metrics(State(registry): State<Arc<MetricsRegistry>>) -> (StatusCode, String) {
    (StatusCode::OK, registry.render())
}

async fn handle_healthz() -> &'static str {
    "ok"
}

pub fn router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/healthz", get(handle_healthz))
        .with_state(registry)
}

/// Serve the registry on an already bound listener until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<MetricsRegistry>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!("Serving metrics on {}", listener.local_addr()?);
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_render() {
        let registry = MetricsRegistry::new();
        registry.inc_counter("ldm_reconcile_total", &[("controller", "a")]);
        registry.inc_counter("ldm_reconcile_total", &[("controller", "a")]);
        registry.inc_counter("ldm_reconcile_total", &[("controller", "b")]);
        registry.set_gauge("ldm_disks", &[("node", "n1")], 3);

        assert_eq!(registry.counter("ldm_reconcile_total", &[("controller", "a")]), 2);
        assert_eq!(registry.counter("ldm_reconcile_total", &[("controller", "c")]), 0);
        assert_eq!(registry.gauge("ldm_disks", &[("node", "n1")]), Some(3));
        assert_eq!(registry.gauge("ldm_disks", &[("node", "n2")]), None);

        registry.set_gauge("ldm_disks", &[("node", "n1")], 0);
        assert_eq!(registry.gauge("ldm_disks", &[("node", "n1")]), Some(0));

        let text = registry.render();
        assert!(text.contains("# TYPE ldm_reconcile_total counter"));
        assert!(text.contains("# TYPE ldm_disks gauge"));
    }

    #[test]
    fn test_registries_are_separate() {
        let cluster = MetricsRegistry::new();
        let node = MetricsRegistry::new();
        cluster.inc_counter("ldm_reconcile_total", &[("controller", "a")]);
        assert_eq!(cluster.counter("ldm_reconcile_total", &[("controller", "a")]), 1);
        assert_eq!(node.counter("ldm_reconcile_total", &[("controller", "a")]), 0);
        assert!(!node.render().contains("ldm_reconcile_total"));
    }

    #[tokio::test]
    async fn test_serve_until_cancelled() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.inc_counter("ldm_up", &[]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, registry, cancel.clone()));

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        conn.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("ldm_up 1"));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
