//! Local HTTP query interface.

mod handlers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use log::info;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::history::HistoryStore;
use crate::store::ReadingStore;

pub use handlers::{ApiError, HealthReport, HistoricalParams, LatestParams};

pub struct ApiState {
    pub store: ReadingStore,
    pub history: Option<HistoryStore>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/latest", get(handlers::latest))
        .route("/historical", get(handlers::historical))
        .route("/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves until `cancel_token` fires.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("query interface listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel_token.cancelled().await })
        .await
        .context("query interface failed")?;

    info!("query interface stopped");
    Ok(())
}
