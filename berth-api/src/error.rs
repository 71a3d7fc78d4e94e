use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use berth_core::EngineError;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid request body: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_spots: Option<u32>,
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(_) | EngineError::PolicyExpired => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) | EngineError::NoRefundablePayment(_) => StatusCode::NOT_FOUND,
        EngineError::CapacityConflict { .. }
        | EngineError::RetryNotAllowed(_)
        | EngineError::ReconciliationConflict(_) => StatusCode::CONFLICT,
        EngineError::AdapterRejection(_) => StatusCode::PAYMENT_REQUIRED,
        EngineError::AdapterTransport(_) => StatusCode::BAD_GATEWAY,
        EngineError::Signature(_) => StatusCode::UNAUTHORIZED,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Engine(err) => engine_status(err),
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            AppError::Engine(EngineError::Storage(msg)) => {
                tracing::error!("Internal Server Error: {}", msg);
                internal()
            }
            AppError::Internal(err) => {
                tracing::error!("Internal Server Error: {:#}", err);
                internal()
            }
            AppError::Engine(err) => ErrorBody {
                code: err.code(),
                message: err.to_string(),
                remaining_spots: match err {
                    EngineError::CapacityConflict { remaining, .. } => Some(*remaining),
                    _ => None,
                },
            },
            AppError::BadRequest(msg) => ErrorBody {
                code: "VALIDATION_ERROR",
                message: msg.clone(),
                remaining_spots: None,
            },
            AppError::NotFound(msg) => ErrorBody {
                code: "NOT_FOUND",
                message: msg.clone(),
                remaining_spots: None,
            },
        }
    }
}

fn internal() -> ErrorBody {
    ErrorBody {
        code: "INTERNAL",
        message: "Internal Server Error".to_string(),
        remaining_spots: None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}
