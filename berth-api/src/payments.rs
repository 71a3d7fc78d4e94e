use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use berth_order::ConfirmOutcome;

use crate::bookings::parse_id;
use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/payments/{attempt_id}/confirm", post(confirm))
}

/// Ask the provider for the attempt's status and settle it if it has moved.
async fn confirm(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<ConfirmOutcome>, AppError> {
    let attempt_id = parse_id(&attempt_id, "payment attempt")?;
    Ok(Json(state.orchestrator.confirm(attempt_id).await?))
}
