use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use berth_core::webhook::ReviewItem;
use berth_core::EngineError;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/reconciliation", get(review_queue))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
}

/// Parked webhook and confirm outcomes awaiting an operator, oldest first.
async fn review_queue(State(state): State<AppState>) -> Result<Json<Vec<ReviewItem>>, AppError> {
    let items = state.review.review_items().await.map_err(EngineError::from)?;
    Ok(Json(items))
}

async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state.monitor.render().map_err(|e| AppError::Internal(e.into()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn health() -> &'static str {
    "ok"
}
