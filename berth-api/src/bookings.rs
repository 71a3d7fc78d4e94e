use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use berth_core::BookingRequest;
use berth_order::{BookingView, PaymentSession, RefundOutcome};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundBody {
    guest_count: Option<u32>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/bookings/initiate", post(initiate))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/retry", post(retry))
        .route("/bookings/{id}/refund", post(refund))
}

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest(format!("{} is not a valid id: {}", what, raw)))
}

async fn initiate(
    State(state): State<AppState>,
    body: Result<Json<BookingRequest>, JsonRejection>,
) -> Result<Json<PaymentSession>, AppError> {
    let Json(request) = body?;
    let session = state.orchestrator.initiate(request).await?;
    Ok(Json(session))
}

async fn retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PaymentSession>, AppError> {
    let booking_id = parse_id(&id, "booking")?;
    let session = state.orchestrator.retry(booking_id).await?;
    Ok(Json(session))
}

/// Body is optional; `{}` or no body cancels every remaining guest.
async fn refund(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<RefundOutcome>, AppError> {
    let booking_id = parse_id(&id, "booking")?;
    let body: RefundBody = if body.iter().all(u8::is_ascii_whitespace) {
        RefundBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
    };

    let outcome = state.orchestrator.refund(booking_id, body.guest_count).await?;
    Ok(Json(outcome))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BookingView>, AppError> {
    let booking_id = parse_id(&id, "booking")?;
    Ok(Json(state.orchestrator.booking(booking_id).await?))
}
