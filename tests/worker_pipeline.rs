use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metricbuf::agent::Agent;
use metricbuf::config::{Config, SourceConfig, WorkerConfig};
use metricbuf::fetcher::HttpFetcher;
use metricbuf::report::{JsonReporter, Reporter, SERVER_STATE};
use metricbuf::worker::{Snapshot, Worker};
use parking_lot::Mutex;
use tokio::net::TcpListener;

/// Sample source whose n-th request returns `cpu.load = n` plus a server
/// state gauge. Requests listed in `fail_on` answer 503.
#[derive(Default)]
struct Source {
    requests: AtomicUsize,
    fail_on: Vec<usize>,
}

async fn samples(State(source): State<Arc<Source>>) -> Response {
    let n = source.requests.fetch_add(1, Ordering::SeqCst) + 1;
    if source.fail_on.contains(&n) {
        return (StatusCode::SERVICE_UNAVAILABLE, "warming up").into_response();
    }
    Json(serde_json::json!([
        {"name": "cpu.load", "unit": "percent", "values": [n as f64]},
        {"name": SERVER_STATE, "unit": "state", "values": [1.0, 2.0]},
    ]))
    .into_response()
}

async fn spawn_source(source: Arc<Source>) -> String {
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics/samples", get(samples))
        .with_state(source);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn wait_for_requests(source: &Source, n: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while source.requests.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("source was not polled in time");
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        interval: Duration::from_millis(40),
        initial_delay: Duration::ZERO,
        shutdown_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn worker_accumulates_ticks_then_resets() {
    let source = Arc::new(Source::default());
    let endpoint = spawn_source(Arc::clone(&source)).await;
    let fetcher = HttpFetcher::connect(&SourceConfig {
        endpoint,
        ..Default::default()
    })
    .await
    .expect("connect");

    let worker = Worker::new("pipeline", fetcher, &worker_config());
    worker.start().expect("start");
    wait_for_requests(&source, 3).await;
    worker.stop().await;

    let requests = source.requests.load(Ordering::SeqCst);
    let snapshot = worker.snapshot().await;
    let Snapshot::Buffered(metrics) = snapshot else {
        panic!("expected buffered snapshot, got {snapshot:?}");
    };

    let cpu = metrics
        .iter()
        .find(|m| m.name() == "cpu.load")
        .expect("cpu.load aggregated");
    let expected_sum: usize = (1..=requests).sum();
    assert_eq!(cpu.count(), requests as u64);
    assert_eq!(cpu.sum(), expected_sum as f64);
    assert_eq!(cpu.min(), Some(1.0));
    assert_eq!(cpu.max(), Some(requests as f64));

    // Stopped worker with a drained buffer falls back to one direct fetch.
    let fallback = worker.get_and_clean_metrics().await;
    assert_eq!(source.requests.load(Ordering::SeqCst), requests + 1);
    let cpu = fallback
        .iter()
        .find(|m| m.name() == "cpu.load")
        .expect("cpu.load from fallback");
    assert_eq!(cpu.count(), 1);
}

#[tokio::test]
async fn failing_requests_do_not_stop_the_worker() {
    let source = Arc::new(Source {
        fail_on: vec![2, 3],
        ..Default::default()
    });
    let endpoint = spawn_source(Arc::clone(&source)).await;
    let fetcher = HttpFetcher::new(&SourceConfig {
        endpoint,
        ..Default::default()
    })
    .expect("client");

    let worker = Worker::new("pipeline", fetcher, &worker_config());
    worker.start().expect("start");
    wait_for_requests(&source, 5).await;
    assert!(worker.is_running());
    worker.stop().await;

    let requests = source.requests.load(Ordering::SeqCst);
    let metrics = worker.get_and_clean_metrics().await;
    let cpu = metrics
        .iter()
        .find(|m| m.name() == "cpu.load")
        .expect("cpu.load aggregated");

    // Requests 2 and 3 contributed nothing.
    assert_eq!(cpu.count(), (requests - 2) as u64);
    let expected_sum: usize = (1..=requests).filter(|n| *n != 2 && *n != 3).sum();
    assert_eq!(cpu.sum(), expected_sum as f64);
}

#[tokio::test]
async fn concurrent_snapshots_never_double_count() {
    let source = Arc::new(Source::default());
    let endpoint = spawn_source(Arc::clone(&source)).await;
    let fetcher = HttpFetcher::new(&SourceConfig {
        endpoint,
        ..Default::default()
    })
    .expect("client");

    let worker = Worker::new(
        "pipeline",
        fetcher,
        &WorkerConfig {
            interval: Duration::from_millis(5),
            ..worker_config()
        },
    );
    worker.start().expect("start");

    let mut seen = Vec::new();
    while source.requests.load(Ordering::SeqCst) < 20 {
        seen.extend(worker.snapshot().await.into_metrics());
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    worker.stop().await;
    seen.extend(worker.snapshot().await.into_metrics());

    // Each request carries a distinct value, so every request (tick or
    // fallback) must show up in exactly one snapshot.
    let requests = source.requests.load(Ordering::SeqCst);
    let cpu: Vec<_> = seen.iter().filter(|m| m.name() == "cpu.load").collect();
    let count: u64 = cpu.iter().map(|m| m.count()).sum();
    let sum: f64 = cpu.iter().map(|m| m.sum()).sum();
    let expected_sum: usize = (1..=requests).sum();

    assert_eq!(count, requests as u64);
    assert_eq!(sum, expected_sum as f64);
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn agent_reports_and_exposes_health() {
    let source = Arc::new(Source::default());
    let endpoint = spawn_source(Arc::clone(&source)).await;

    let mut cfg = Config {
        agent_name: "pipeline-agent".to_string(),
        source: SourceConfig {
            endpoint,
            ..Default::default()
        },
        worker: worker_config(),
        ..Default::default()
    };
    cfg.reporter.poll_interval = Duration::from_millis(150);
    cfg.health.addr = "127.0.0.1:0".to_string();
    cfg.validate().expect("valid config");

    let out = SharedBuf::default();
    let mut agent = Agent::new(cfg)
        .expect("agent")
        .with_reporter(Reporter::Json(JsonReporter::new(Box::new(out.clone()))));
    agent.start().await.expect("start");

    tokio::time::timeout(Duration::from_secs(10), async {
        while out.0.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent did not report in time");

    let addr = agent.health().local_addr().expect("health bound");
    let body = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .expect("scrape")
        .text()
        .await
        .expect("body");
    assert!(body.contains("metricbuf_ticks_total"));
    assert!(body.contains("metricbuf_metrics_reported_total"));

    agent.stop().await.expect("stop");

    let text = String::from_utf8(out.0.lock().clone()).expect("utf8");
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();

    let state = lines
        .iter()
        .find(|l| l["name"] == SERVER_STATE)
        .expect("server state reported");
    assert_eq!(state["kind"], "snapshot");
    assert_eq!(state["value"], 2.0);
    assert_eq!(state["agent"], "pipeline-agent");

    let cpu = lines
        .iter()
        .find(|l| l["name"] == "cpu.load")
        .expect("cpu.load reported");
    assert_eq!(cpu["kind"], "aggregate");
    assert!(cpu["count"].as_u64().expect("count") >= 1);
}
