pub mod booking;
pub mod payment;
pub mod repository;
pub mod telemetry;
pub mod webhook;

pub use booking::{Booking, BookingRequest, BookingStatus, CapacityCommitment, CapacityKey, Customer, Package, RefundPolicy, RefundTier};
pub use payment::{AdapterError, PaymentAdapter, PaymentAttempt, PaymentHandle, PaymentStatus, Provider, ProviderRegistry, RefundClaim, TierGuests};
pub use repository::{CapacityLedger, LedgerError, PackageCatalog, PaymentLedger, WebhookLog};
pub use telemetry::EventSink;
pub use webhook::{SignatureError, WebhookEvent, WebhookKind};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sold out: requested {requested} guests, {remaining} spots remaining")]
    CapacityConflict { requested: u32, remaining: u32 },

    #[error("Payment provider unavailable: {0}")]
    AdapterTransport(String),

    #[error("Payment declined: {0}")]
    AdapterRejection(String),

    #[error("Webhook rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("Retry not allowed: {0}")]
    RetryNotAllowed(String),

    #[error("Refund window has closed for this booking")]
    PolicyExpired,

    #[error("No refundable payment for booking {0}")]
    NoRefundablePayment(Uuid),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable code surfaced to API clients
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::CapacityConflict { .. } => "SOLD_OUT",
            EngineError::AdapterTransport(_) => "PROVIDER_UNAVAILABLE",
            EngineError::AdapterRejection(_) => "PAYMENT_DECLINED",
            EngineError::Signature(_) => "INVALID_SIGNATURE",
            EngineError::ReconciliationConflict(_) => "RECONCILIATION_CONFLICT",
            EngineError::RetryNotAllowed(_) => "RETRY_NOT_ALLOWED",
            EngineError::PolicyExpired => "REFUND_WINDOW_CLOSED",
            EngineError::NoRefundablePayment(_) => "NO_REFUNDABLE_PAYMENT",
            EngineError::Storage(_) => "INTERNAL",
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(what) => EngineError::NotFound(what),
            LedgerError::CapacityExceeded { requested, remaining } => {
                EngineError::CapacityConflict { requested, remaining }
            }
            LedgerError::LiveAttemptExists(booking_id) => EngineError::RetryNotAllowed(format!(
                "booking {} already has a payment in progress",
                booking_id
            )),
            LedgerError::Conflict(msg) => EngineError::ReconciliationConflict(msg),
            LedgerError::Storage(msg) => EngineError::Storage(msg),
        }
    }
}

impl From<AdapterError> for EngineError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Transport(msg) => EngineError::AdapterTransport(msg),
            AdapterError::Rejected(msg) => EngineError::AdapterRejection(msg),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
