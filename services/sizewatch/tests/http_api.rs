use serde_json::Value;
use sizewatch::api::{self, HistoryResponse, ObjectsResponse, QueueSummary, RedriveResponse};
use sizewatch::config::SizewatchConfig;
use sizewatch::observability::{self, Readiness};
use sizewatch::pipeline::Pipeline;
use sizewatch_common::SystemClock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct Server {
    base: String,
    readiness: Readiness,
    pipeline: Pipeline,
    client: reqwest::Client,
}

async fn start() -> Server {
    let config = SizewatchConfig {
        subject: "assignment-bucket".to_string(),
        receive_wait_ms: 50,
        ..SizewatchConfig::default()
    };
    let pipeline = Pipeline::start(&config, Arc::new(SystemClock))
        .await
        .expect("start pipeline");
    let readiness = Readiness::default();
    let router = api::build_router(
        pipeline.handles().clone(),
        observability::install_metrics_recorder(),
        readiness.clone(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service()).await;
    });
    Server {
        base: format!("http://{addr}"),
        readiness,
        pipeline,
        client: reqwest::Client::new(),
    }
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[tokio::test]
async fn objects_flow_into_history() {
    let server = start().await;

    let put: Value = server
        .client
        .put(server.url("/objects/reports/a.txt"))
        .body(vec![b'a'; 19])
        .send()
        .await
        .expect("put")
        .error_for_status()
        .expect("put status")
        .json()
        .await
        .expect("put body");
    assert_eq!(put["key"], "reports/a.txt");
    assert_eq!(put["size_bytes"], 19);

    let objects: ObjectsResponse = server
        .client
        .get(server.url("/objects"))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("list body");
    assert_eq!(objects.total_size_bytes, 19);
    assert_eq!(objects.objects.len(), 1);

    let mut history = None;
    for _ in 0..100 {
        let response: HistoryResponse = server
            .client
            .get(server.url("/history?window=60"))
            .send()
            .await
            .expect("history")
            .json()
            .await
            .expect("history body");
        if !response.points.is_empty() {
            history = Some(response);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let history = history.expect("history point recorded");
    assert_eq!(history.window_secs, 60);
    assert_eq!(history.points.last().map(|p| p.size_bytes), Some(19));
    assert_eq!(history.max.map(|p| p.size_bytes), Some(19));

    server.pipeline.shutdown().await;
}

#[tokio::test]
async fn zero_history_window_is_one_second() {
    let server = start().await;
    let history: HistoryResponse = server
        .client
        .get(server.url("/history?window=0"))
        .send()
        .await
        .expect("history")
        .json()
        .await
        .expect("history body");
    assert_eq!(history.window_secs, 1);
    assert!(history.points.is_empty());
    server.pipeline.shutdown().await;
}

#[tokio::test]
async fn delete_missing_object_is_not_found() {
    let server = start().await;
    let response = server
        .client
        .delete(server.url("/objects/nope.txt"))
        .send()
        .await
        .expect("delete");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["code"], "not_found");
    server.pipeline.shutdown().await;
}

#[tokio::test]
async fn alarm_metric_and_dead_letter_views() {
    let server = start().await;

    let alarm: Value = server
        .client
        .get(server.url("/alarm"))
        .send()
        .await
        .expect("alarm")
        .json()
        .await
        .expect("alarm body");
    assert_eq!(alarm["state"], "INSUFFICIENT_DATA");
    assert_eq!(alarm["threshold"], 20.0);
    assert_eq!(alarm["fired"], 0);

    let metric: Value = server
        .client
        .get(server.url("/metric"))
        .send()
        .await
        .expect("metric")
        .json()
        .await
        .expect("metric body");
    assert_eq!(metric["name"], "TotalObjectSize");
    assert_eq!(metric["period_ms"], 30_000);

    let queues: Vec<QueueSummary> = server
        .client
        .get(server.url("/dead-letters"))
        .send()
        .await
        .expect("dead letters")
        .json()
        .await
        .expect("dead letters body");
    let mut names: Vec<&str> = queues.iter().map(|q| q.queue.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["delta-logger", "remediation", "size-tracker"]);
    assert!(queues.iter().all(|q| q.dead_letters == 0));

    let redrive: RedriveResponse = server
        .client
        .post(server.url("/dead-letters/redrive"))
        .send()
        .await
        .expect("redrive")
        .json()
        .await
        .expect("redrive body");
    assert_eq!(redrive.redriven, 0);

    server.pipeline.shutdown().await;
}

#[tokio::test]
async fn readiness_and_liveness() {
    let server = start().await;
    let ready = server
        .client
        .get(server.url("/ready"))
        .send()
        .await
        .expect("ready");
    assert_eq!(ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    server.readiness.set_ready(true);
    let ready = server
        .client
        .get(server.url("/ready"))
        .send()
        .await
        .expect("ready");
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    let live = server
        .client
        .get(server.url("/live"))
        .send()
        .await
        .expect("live");
    assert_eq!(live.status(), reqwest::StatusCode::OK);

    let metrics = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .expect("metrics");
    assert_eq!(metrics.status(), reqwest::StatusCode::OK);
    server.pipeline.shutdown().await;
}
