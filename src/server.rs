//! HTTP surface of the stream service: WebSocket upgrade and health.

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::hub::HubHandle;
use crate::utils::shutdown::ShutdownSignal;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub sessions: usize,
}

/// Routes: `GET /ws` (upgrade) and `GET /health`.
pub fn router(hub: HubHandle) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let session = match hub.register().await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Rejecting connection");
            return;
        }
    };
    let (sink, stream) = socket.split();
    session.run(sink, stream).await;
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthStatus>, StatusCode> {
    let sessions = state
        .hub
        .session_count()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(HealthStatus {
        status: "ok",
        sessions,
    }))
}

/// Serve until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    hub: HubHandle,
    mut shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Stream server listening");
    }
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get_health(app: Router) -> (StatusCode, Option<Value>) {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).ok())
    }

    #[tokio::test]
    async fn test_health_reports_sessions() {
        let (hub, _task) = HubHandle::spawn(&HubConfig::default());
        let _a = hub.register().await.unwrap();
        let _b = hub.register().await.unwrap();

        let (status, body) = get_health(router(hub)).await;
        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 2);
    }

    #[tokio::test]
    async fn test_health_unavailable_after_hub_shutdown() {
        let (hub, _task) = HubHandle::spawn(&HubConfig::default());
        hub.shutdown(Duration::from_millis(10)).await.unwrap();

        let (status, _) = get_health(router(hub)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let (hub, _task) = HubHandle::spawn(&HubConfig::default());
        let request = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let response = router(hub).oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
