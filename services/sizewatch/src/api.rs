//! HTTP surface: history for plotting, metric and alarm state, dead-letter
//! inspection and redrive, and direct object mutations for driving the
//! pipeline by hand.
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use sizewatch_common::{Clock, HistoryRecord, ObjectInfo};
use sizewatch_metrics::{AlarmState, Metric};
use sizewatch_storage::{HistoryStore, ObjectStore, StorageError};
use tower_http::trace::TraceLayer;

use crate::observability::{self, Readiness};
use crate::pipeline::PipelineHandles;

const DEFAULT_HISTORY_WINDOW_SECS: u64 = 3600;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
            }
            StorageError::Unavailable(reason) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", reason)
            }
            other => {
                tracing::error!(error = %other, "sizewatch storage error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "storage operation failed",
                )
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub window: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub subject: String,
    pub window_secs: u64,
    pub points: Vec<HistoryRecord>,
    pub max: Option<HistoryRecord>,
}

#[derive(Debug, Serialize)]
pub struct MetricResponse {
    pub name: String,
    pub period_ms: u64,
    pub current_window_sum: f64,
    pub late_records: u64,
    pub samples: Vec<Metric>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlarmResponse {
    pub name: String,
    pub threshold: f64,
    pub state: AlarmState,
    pub fired: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueSummary {
    pub topic: String,
    pub queue: String,
    pub visible: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedriveResponse {
    pub redriven: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectsResponse {
    pub subject: String,
    pub total_size_bytes: u64,
    pub objects: Vec<ObjectInfo>,
}

pub fn build_router(
    handles: PipelineHandles,
    metrics: PrometheusHandle,
    readiness: Readiness,
) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
            )
        });

    Router::new()
        .route("/history", axum::routing::get(history))
        .route("/metric", axum::routing::get(metric))
        .route("/alarm", axum::routing::get(alarm))
        .route("/dead-letters", axum::routing::get(dead_letters))
        .route("/dead-letters/redrive", axum::routing::post(redrive))
        .route("/objects", axum::routing::get(list_objects))
        .route(
            "/objects/*key",
            axum::routing::put(put_object).delete(delete_object),
        )
        .with_state(handles)
        .merge(observability::health_router(metrics, readiness))
        .layer(trace_layer)
}

async fn history(
    Query(query): Query<HistoryQuery>,
    State(state): State<PipelineHandles>,
) -> ApiResult<HistoryResponse> {
    // A zero window would be an empty range; the smallest window is one second.
    let window_secs = query.window.unwrap_or(DEFAULT_HISTORY_WINDOW_SECS).max(1);
    let now_ms = state.clock.now_ms();
    let from_ms = now_ms.saturating_sub(window_secs.saturating_mul(1000));
    let points = state.history.range(&state.subject, from_ms, now_ms).await?;
    let max = state.history.largest(&state.subject).await?;
    Ok(Json(HistoryResponse {
        subject: state.subject.clone(),
        window_secs,
        points,
        max,
    }))
}

async fn metric(State(state): State<PipelineHandles>) -> Json<MetricResponse> {
    let control = state.control.lock();
    let aggregator = control.aggregator();
    Json(MetricResponse {
        name: aggregator.name().to_string(),
        period_ms: aggregator.period_ms(),
        current_window_sum: aggregator.current_window_sum(),
        late_records: aggregator.late_records(),
        samples: aggregator.samples(),
    })
}

async fn alarm(State(state): State<PipelineHandles>) -> Json<AlarmResponse> {
    let control = state.control.lock();
    let alarm = control.alarm();
    Json(AlarmResponse {
        name: alarm.config().name.clone(),
        threshold: alarm.config().threshold,
        state: alarm.state(),
        fired: alarm.fired(),
    })
}

async fn dead_letters(State(state): State<PipelineHandles>) -> Json<Vec<QueueSummary>> {
    let queues = state.bus.all_queues().await;
    Json(
        queues
            .iter()
            .map(|queue| {
                let stats = queue.stats();
                QueueSummary {
                    topic: queue.topic().to_string(),
                    queue: queue.name().to_string(),
                    visible: stats.visible,
                    in_flight: stats.in_flight,
                    dead_letters: stats.dead_letters,
                }
            })
            .collect(),
    )
}

async fn redrive(State(state): State<PipelineHandles>) -> Json<RedriveResponse> {
    let mut redriven = 0;
    for queue in state.bus.all_queues().await {
        let moved = queue.redrive_dead_letters();
        if moved > 0 {
            tracing::info!(queue = queue.name(), moved, "dead letters redriven");
        }
        redriven += moved;
    }
    Json(RedriveResponse { redriven })
}

async fn list_objects(State(state): State<PipelineHandles>) -> ApiResult<ObjectsResponse> {
    let objects = state.store.list_all(&state.subject).await?;
    let total_size_bytes = state.store.total_size(&state.subject).await;
    Ok(Json(ObjectsResponse {
        subject: state.subject.clone(),
        total_size_bytes,
        objects,
    }))
}

async fn put_object(
    Path(key): Path<String>,
    State(state): State<PipelineHandles>,
    body: Bytes,
) -> ApiResult<ObjectInfo> {
    if key.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_key",
            "object key must not be empty",
        ));
    }
    Ok(Json(state.store.put(&state.subject, &key, body).await?))
}

async fn delete_object(
    Path(key): Path<String>,
    State(state): State<PipelineHandles>,
) -> ApiResult<ObjectInfo> {
    Ok(Json(state.store.delete(&state.subject, &key).await?))
}
