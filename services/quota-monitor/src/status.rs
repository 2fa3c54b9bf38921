//! Optional HTTP status endpoint
//!
//! - `GET /status`: latest `PollSnapshot` as JSON
//! - `GET /health`: 200 once the last fetch succeeded, 503 before that or after a failure
//! - `GET /metrics`: Prometheus text exposition
//! - `POST /refresh`: request an immediate fetch

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;

use crate::scheduler::{PollSnapshot, RefreshTrigger};

/// Concurrent request cap for the status listener.
const MAX_CONNECTIONS: usize = 64;

/// Shared state accessible from all handlers
#[derive(Clone)]
pub struct StatusState {
    pub snapshots: watch::Receiver<PollSnapshot>,
    pub trigger: RefreshTrigger,
    pub prometheus: PrometheusHandle,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/refresh", post(refresh_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_CONNECTIONS))
        .with_state(state)
}

async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let snapshot = state.snapshots.borrow().clone();
    let status_line = snapshot.quota.as_ref().map(|q| q.status_line());
    let mut body = serde_json::to_value(&snapshot).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("status_line".into(), status_line.into());
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let snapshot = state.snapshots.borrow().clone();
    let (code, body) = if snapshot.is_healthy() {
        (
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "updated_at": snapshot.updated_at,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "degraded",
                "error": snapshot.error.as_deref().unwrap_or("no fetch completed yet"),
                "updated_at": snapshot.updated_at,
            }),
        )
    };
    (code, [(header::CONTENT_TYPE, "application/json")], body.to_string())
}

async fn metrics_handler(State(state): State<StatusState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn refresh_handler(State(state): State<StatusState>) -> impl IntoResponse {
    state.trigger.refresh_now();
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use anthropic_quota::QuotaInfo;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn quota(utilization_5h: f64) -> QuotaInfo {
        QuotaInfo {
            utilization_5h,
            utilization_7d: 0.2,
            status: Some("allowed".into()),
            representative_claim: None,
            fallback_percentage: None,
            reset_at: None,
        }
    }

    fn app_with(snapshot: PollSnapshot) -> (Router, watch::Sender<PollSnapshot>, RefreshTrigger) {
        let (tx, rx) = watch::channel(snapshot);
        let trigger = RefreshTrigger::new();
        let state = StatusState {
            snapshots: rx,
            trigger: trigger.clone(),
            prometheus: test_prometheus_handle(),
        };
        (router(state), tx, trigger)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_req(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_is_unavailable_before_first_fetch() {
        let (app, _tx, _trigger) = app_with(PollSnapshot::default());

        let response = app.oneshot(get_req("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["error"], "no fetch completed yet");
    }

    #[tokio::test]
    async fn health_ok_after_successful_fetch() {
        let (app, _tx, _trigger) = app_with(PollSnapshot {
            quota: Some(quota(0.42)),
            error: None,
            interval_secs: 120,
            updated_at: Some(chrono::Utc::now()),
        });

        let response = app.oneshot(get_req("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn health_degraded_reports_last_error() {
        let (app, _tx, _trigger) = app_with(PollSnapshot {
            quota: Some(quota(0.42)),
            error: Some("credentials not found".into()),
            interval_secs: 120,
            updated_at: Some(chrono::Utc::now()),
        });

        let response = app.oneshot(get_req("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"], "credentials not found");
    }

    #[tokio::test]
    async fn status_serves_latest_snapshot() {
        let (app, tx, _trigger) = app_with(PollSnapshot::default());
        tx.send_replace(PollSnapshot {
            quota: Some(quota(0.91)),
            error: None,
            interval_secs: 30,
            updated_at: Some(chrono::Utc::now()),
        });

        let response = app.oneshot(get_req("/status")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let json = body_json(response).await;
        assert_eq!(json["interval_secs"], 30);
        assert_eq!(json["quota"]["utilization_5h"], 0.91);
        assert_eq!(json["quota"]["status"], "allowed");
        assert!(json["error"].is_null());
        assert!(
            json["status_line"].as_str().unwrap().starts_with("91% | "),
            "got: {}",
            json["status_line"]
        );
    }

    #[tokio::test]
    async fn status_before_first_fetch_has_no_quota() {
        let (app, _tx, _trigger) = app_with(PollSnapshot::default());

        let json = body_json(app.oneshot(get_req("/status")).await.unwrap()).await;

        assert!(json["quota"].is_null());
        assert!(json["status_line"].is_null());
    }

    #[tokio::test]
    async fn metrics_returns_prometheus_text() {
        let (app, _tx, _trigger) = app_with(PollSnapshot::default());

        let response = app.oneshot(get_req("/metrics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn refresh_is_accepted_and_signals_scheduler() {
        let (app, _tx, trigger) = app_with(PollSnapshot::default());

        let request = Request::builder()
            .method("POST")
            .uri("/refresh")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        tokio::time::timeout(Duration::from_secs(1), trigger.requested())
            .await
            .expect("refresh request must reach the trigger");
    }

    #[tokio::test]
    async fn refresh_requires_post() {
        let (app, _tx, _trigger) = app_with(PollSnapshot::default());
        let response = app.oneshot(get_req("/refresh")).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (app, _tx, _trigger) = app_with(PollSnapshot::default());
        let response = app.oneshot(get_req("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
