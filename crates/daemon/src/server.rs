//! HTTP surface for reelforge
//!
//! Exposes liveness, metrics and direct job invocation:
//! - `GET /health`: 200 while the queue is healthy, 503 when it is stalled
//! - `GET /metrics`: queue counters, uptime and memory
//! - `POST /jobs`: same contract as a change-feed record

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::info;

use crate::intake::{parse_event, watch_handle, IntakeEvent};
use crate::metrics::{collect_memory_metrics, MetricsSnapshot};
use crate::queue::{QueueError, RenderQueue};

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// State shared by the handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<RenderQueue>,
    pub started_at: Instant,
    /// Table whose change-feed records are accepted on `/jobs`
    pub table: String,
}

impl AppState {
    pub fn new(queue: Arc<RenderQueue>, table: impl Into<String>) -> Self {
        Self {
            queue,
            started_at: Instant::now(),
            table: table.into(),
        }
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let queue = state.queue.status();
    let label = if queue.healthy { "ok" } else { "degraded" };
    let mut body = json!({
        "status": label,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "queue": queue,
    });

    if queue.healthy {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        body["message"] = json!("running jobs have made no progress within the watchdog threshold");
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(MetricsSnapshot::new(
        &state.queue.status(),
        state.started_at,
        collect_memory_metrics(),
    ))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn submit_job(State(state): State<AppState>, body: Bytes) -> Response {
    let value = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) => value,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)),
    };

    let job = match parse_event(value, &state.table) {
        Ok(IntakeEvent::Job(job)) => job,
        Ok(IntakeEvent::Ignored { reason }) => {
            return (
                StatusCode::OK,
                Json(json!({ "accepted": false, "reason": reason })),
            )
                .into_response()
        }
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let job_id = job.id.clone();
    match state.queue.enqueue(job) {
        Ok(handle) => {
            watch_handle(handle);
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "accepted": true,
                    "job_id": job_id,
                    "queue": state.queue.status(),
                })),
            )
                .into_response()
        }
        Err(QueueError::ShuttingDown) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Render queue is shutting down")
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Creates the axum Router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/jobs", post(submit_job))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server<F>(bind: &str, state: AppState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "HTTP server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobStatus};
    use crate::orchestrator::{FailedJob, JobRunner};
    use crate::queue::QueueSettings;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    struct SleepyRunner(Duration);

    #[async_trait]
    impl JobRunner for SleepyRunner {
        async fn run(&self, mut job: Job) -> Result<Job, FailedJob> {
            tokio::time::sleep(self.0).await;
            job.status = JobStatus::Completed;
            Ok(job)
        }
    }

    fn state_with(runner_delay: Duration, watchdog: Duration) -> AppState {
        let queue = RenderQueue::new(
            Arc::new(SleepyRunner(runner_delay)),
            QueueSettings {
                concurrency_limit: 1,
                watchdog,
            },
        );
        AppState::new(Arc::new(queue), "generated_videos")
    }

    fn state() -> AppState {
        state_with(Duration::from_millis(1), Duration::from_secs(300))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_jobs(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/jobs")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_ok() {
        let app = create_router(state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["queue"]["running_count"], 0);
        assert_eq!(json["queue"]["concurrency_limit"], 1);
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_degraded_when_stalled() {
        let state = state_with(Duration::from_secs(3600), Duration::from_secs(60));
        let _handle = state.queue.enqueue(Job::new("stuck", Default::default())).unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert!(json["message"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_shape() {
        let app = create_router(state());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let json = body_json(response).await;
        for field in [
            "queue_length",
            "active_jobs",
            "completed_jobs",
            "failed_jobs",
            "uptime_seconds",
            "memory_usage_mb",
            "total_memory_mb",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }

    #[tokio::test]
    async fn test_submit_job_accepted() {
        let app = create_router(state());

        let response = app
            .oneshot(post_jobs(r#"{"id": 7, "data": {"remotion": {"caption": "hi"}}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["accepted"], true);
        assert_eq!(json["job_id"], "7");
    }

    #[tokio::test]
    async fn test_submit_job_bad_request() {
        let app = create_router(state());
        let response = app.clone().oneshot(post_jobs("{oops")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(post_jobs(r#"{"data": {}}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_job_ignored_table() {
        let app = create_router(state());
        let response = app
            .oneshot(post_jobs(
                r#"{"type": "INSERT", "table": "users", "record": {"id": 1}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["accepted"], false);
    }

    #[tokio::test]
    async fn test_submit_job_while_shutting_down() {
        let state = state();
        state.queue.shutdown(Duration::from_secs(1)).await;

        let response = create_router(state)
            .oneshot(post_jobs(r#"{"id": "1", "data": {}}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
