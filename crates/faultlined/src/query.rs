use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use faultline_analysis::MetricsTracker;
use faultline_config::DriftConfig;
use faultline_core::unix_timestamp_millis;
use faultline_store::{
    COUNTER_ALERTS_SUPPRESSED, COUNTER_DEAD_LETTERED, COUNTER_QUARANTINED, COUNTER_UNENRICHED,
    QueueName, SqliteStore, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state of the read-only query API.
#[derive(Clone)]
pub struct QueryState {
    store: Arc<SqliteStore>,
    drift: DriftConfig,
}

impl QueryState {
    pub fn new(store: Arc<SqliteStore>, drift: DriftConfig) -> Self {
        Self { store, drift }
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    window_secs: Option<u64>,
    namespace: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueueHealth {
    queue: &'static str,
    depth: u64,
    dead_letters: u64,
}

pub fn router(state: QueryState) -> Router {
    Router::new()
        .route("/v1/health", get(api_health))
        .route("/v1/namespaces/stats", get(api_namespace_stats))
        .route("/v1/drift/latest", get(api_drift_latest))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until the shutdown channel flips to true.
pub async fn serve_query_api(
    addr: SocketAddr,
    state: QueryState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|error| {
            if error.kind() == ErrorKind::AddrInUse {
                anyhow!("failed to bind {addr}: address already in use")
            } else {
                anyhow!("failed to bind {addr}: {error}")
            }
        })?;
    info!(addr = %addr, "query API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

fn json_response<T: Serialize>(payload: T, status: StatusCode) -> Response {
    let mut response = Json(payload).into_response();
    *response.status_mut() = status;
    response
}

fn error_response(error: impl std::fmt::Display) -> Response {
    json_response(
        json!({"ok": false, "error": error.to_string()}),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}

fn health_payload(store: &SqliteStore) -> Result<Value, StoreError> {
    let queues = QueueName::ALL
        .iter()
        .map(|queue| {
            Ok(QueueHealth {
                queue: queue.as_str(),
                depth: store.queue_depth(*queue)?,
                dead_letters: store.dead_letter_count(*queue)?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    let mut counters = serde_json::Map::new();
    for name in [
        COUNTER_QUARANTINED,
        COUNTER_DEAD_LETTERED,
        COUNTER_UNENRICHED,
        COUNTER_ALERTS_SUPPRESSED,
    ] {
        counters.insert(name.to_owned(), json!(store.counter_value(name)?));
    }

    Ok(json!({
        "ok": true,
        "queues": queues,
        "counters": counters,
    }))
}

async fn api_health(State(state): State<QueryState>) -> Response {
    match health_payload(&state.store) {
        Ok(body) => json_response(body, StatusCode::OK),
        Err(error) => error_response(error),
    }
}

async fn api_namespace_stats(
    Query(params): Query<StatsQuery>,
    State(state): State<QueryState>,
) -> Response {
    let window_secs = params.window_secs.unwrap_or(state.drift.window_secs).max(1);
    let tracker = MetricsTracker::new(state.store.clone(), state.drift.clone());
    let now = unix_timestamp_millis();

    let reports = match params.namespace.as_deref() {
        Some(namespace) => tracker.report(namespace, window_secs, now).map(|report| vec![report]),
        None => tracker.report_all(window_secs, now),
    };
    match reports {
        Ok(reports) => json_response(
            json!({"window_secs": window_secs, "namespaces": reports}),
            StatusCode::OK,
        ),
        Err(error) => error_response(error),
    }
}

async fn api_drift_latest(State(state): State<QueryState>) -> Response {
    let records = match state.store.latest_drift_reports() {
        Ok(records) => records,
        Err(error) => return error_response(error),
    };

    let reports = records
        .into_iter()
        .map(|record| {
            serde_json::from_str::<Value>(&record.report_json).unwrap_or_else(|error| {
                json!({
                    "namespace": record.namespace,
                    "generated_at": record.generated_at,
                    "error": format!("unreadable report: {error}"),
                })
            })
        })
        .collect::<Vec<_>>();
    json_response(json!({"reports": reports}), StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use faultline_store::{DriftReportRecord, NewQueueMessage};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn health_reports_queue_depths_and_counters() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open(temp.path()).expect("open store"));
        store
            .enqueue(
                &NewQueueMessage::new(QueueName::Logs, "linux-node-1|kernel|42", "{}", 4),
                1_000,
            )
            .expect("enqueue");
        store
            .increment_counter(COUNTER_QUARANTINED, 2)
            .expect("count");

        let app = router(QueryState::new(store, DriftConfig::default()));
        let (status, body) = get_json(app, "/v1/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
        let logs = body["queues"]
            .as_array()
            .expect("queues array")
            .iter()
            .find(|queue| queue["queue"] == json!("logs"))
            .expect("logs queue");
        assert_eq!(logs["depth"], json!(1));
        assert_eq!(body["counters"]["quarantined"], json!(2));
        assert_eq!(body["counters"]["unenriched"], json!(0));
    }

    #[tokio::test]
    async fn drift_latest_returns_stored_reports() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open(temp.path()).expect("open store"));
        store
            .insert_drift_report(&DriftReportRecord {
                namespace: "linux|mock|mock-64d|64".to_owned(),
                window_secs: 3_600,
                generated_at: 10_000,
                report_json: json!({
                    "namespace": "linux|mock|mock-64d|64",
                    "new_cluster_rate": 0.5,
                    "high_drift": true
                })
                .to_string(),
            })
            .expect("insert report");

        let app = router(QueryState::new(store, DriftConfig::default()));
        let (status, body) = get_json(app, "/v1/drift/latest").await;

        assert_eq!(status, StatusCode::OK);
        let reports = body["reports"].as_array().expect("reports array");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["high_drift"], json!(true));
    }

    #[tokio::test]
    async fn namespace_stats_is_empty_without_prototypes() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open(temp.path()).expect("open store"));

        let app = router(QueryState::new(store, DriftConfig::default()));
        let (status, body) = get_json(app, "/v1/namespaces/stats?window_secs=60").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["window_secs"], json!(60));
        assert_eq!(body["namespaces"], json!([]));
    }
}
