use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use berth_core::Provider;
use berth_order::ReconcileOutcome;
use serde::Serialize;

use crate::error::{AppError, ErrorBody};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct Ack {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhooks/{provider}", post(receive))
}

fn provider_from_path(raw: &str) -> Option<Provider> {
    match raw {
        "global" => Some(Provider::Global),
        "regional" => Some(Provider::Regional),
        _ => None,
    }
}

/// POST /webhooks/{provider}
/// Raw body is needed for the signature check, so no Json extractor here.
async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let provider = provider_from_path(&provider)
        .ok_or_else(|| AppError::NotFound(format!("unknown provider: {}", provider)))?;

    let signature = headers
        .get(provider.signature_header())
        .and_then(|v| v.to_str().ok());

    let outcome = state.reconciler.handle(provider, &body, signature).await?;

    let response = match outcome {
        ReconcileOutcome::Rejected(err) => (
            StatusCode::UNAUTHORIZED,
            serde_json::to_value(ErrorBody {
                code: "INVALID_SIGNATURE",
                message: err.to_string(),
                remaining_spots: None,
            }),
        ),
        ReconcileOutcome::Parked(reason) => (
            StatusCode::OK,
            serde_json::to_value(Ack {
                status: "PARKED",
                reason: Some(reason),
            }),
        ),
        other => (
            StatusCode::OK,
            serde_json::to_value(Ack {
                status: other.as_str(),
                reason: None,
            }),
        ),
    };

    let (status, body) = response;
    let body = body.map_err(|e| AppError::Internal(e.into()))?;
    Ok((status, Json(body)))
}
