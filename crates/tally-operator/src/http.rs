//! Liveness and readiness endpoints
//!
//! `/healthy` answers as soon as the server is up; `/ready` stays 503
//! until the orchestrator finishes its startup sequence.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub initialized: Arc<parking_lot::Mutex<bool>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            initialized: Arc::new(parking_lot::Mutex::new(false)),
        }
    }

    pub fn mark_initialized(&self) {
        *self.initialized.lock() = true;
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthy", get(healthy))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn healthy() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    if *state.initialized.lock() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not initialized")
    }
}

/// Serve until the stop signal fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.changed().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_flips_with_initialization() {
        let state = AppState::new();
        let response = ready(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.mark_initialized();
        let response = ready(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn healthy_always_answers() {
        assert_eq!(healthy().await, "ok");
    }
}
