// Health endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use keel_durable::worker::WorkerStatus;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Reports the worker's lifecycle state
pub type StatusProbe = Arc<dyn Fn() -> WorkerStatus + Send + Sync>;

/// State for health endpoint
#[derive(Clone)]
pub struct HealthState {
    pub worker_id: String,
    pub task_queue: String,
    status: StatusProbe,
}

impl HealthState {
    pub fn new(
        worker_id: impl Into<String>,
        task_queue: impl Into<String>,
        status: impl Fn() -> WorkerStatus + Send + Sync + 'static,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_queue: task_queue.into(),
            status: Arc::new(status),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub worker_id: String,
    pub task_queue: String,
    pub worker_status: &'static str,
}

pub async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    let worker_status = match (state.status)() {
        WorkerStatus::Idle => "idle",
        WorkerStatus::Running => "running",
        WorkerStatus::Draining => "draining",
        WorkerStatus::Stopped => "stopped",
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        worker_id: state.worker_id.clone(),
        task_queue: state.task_queue.clone(),
        worker_status,
    })
}

pub fn health_router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Serve the health router until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    state: HealthState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "health endpoint listening");
    axum::serve(listener, health_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_health_handler() {
        let state = HealthState::new("w-1", "greetings", || WorkerStatus::Running);
        let Json(response) = health(State(state)).await;

        assert_eq!(response.status, "ok");
        assert_eq!(response.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(response.worker_id, "w-1");
        assert_eq!(response.worker_status, "running");
    }

    #[tokio::test]
    async fn test_health_over_http() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = HealthState::new("w-1", "greetings", || WorkerStatus::Draining);
        let shutdown = CancellationToken::new();
        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, health_router(state))
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            })
        };

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));
        assert!(response.contains(r#""worker_status":"draining""#));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
