use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::engine::state::EngineStatus;

#[derive(Clone)]
pub struct AppState {
    status: watch::Receiver<EngineStatus>,
}

/// 200 while the engine is healthy, 503 once it has faulted.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    if status.is_healthy() {
        (StatusCode::OK, "OK".to_string())
    } else {
        let reason = status
            .last_error
            .map(|fault| format!("faulted: {}: {}", fault.kind, fault.message))
            .unwrap_or_else(|| "faulted".to_string());
        (StatusCode::SERVICE_UNAVAILABLE, reason)
    }
}

async fn get_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.status.borrow().clone())
}

pub fn create_router(status: watch::Receiver<EngineStatus>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .with_state(AppState { status })
        .layer(TraceLayer::new_for_http())
}

/// Serve `/health` and `/status` on `listen` until `shutdown` is cancelled.
pub async fn run_status_server(
    listen: &str,
    status: watch::Receiver<EngineStatus>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(status);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("Status server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("Status server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{EngineState, ErrorKind, StatusPublisher};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_ok_while_running() {
        let publisher = StatusPublisher::new();
        publisher.transition(EngineState::Following);

        let (code, body) = get(create_router(publisher.subscribe()), "/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_health_unavailable_when_faulted() {
        let publisher = StatusPublisher::new();
        publisher.fault(ErrorKind::SinkFailure, "batch 3 not delivered");

        let (code, body) = get(create_router(publisher.subscribe()), "/health").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("sink_failure"));
    }

    #[tokio::test]
    async fn test_status_returns_json() {
        let publisher = StatusPublisher::new();
        publisher.update(|s| {
            s.entries_read = 12;
            s.batches_acked = 3;
        });

        let (code, body) = get(create_router(publisher.subscribe()), "/status").await;
        assert_eq!(code, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["entries_read"], 12);
        assert_eq!(value["batches_acked"], 3);
        assert_eq!(value["state"], "starting");
    }
}
