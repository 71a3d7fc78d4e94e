use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payment::Provider;

/// Provider event types collapsed onto the transitions the engine understands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookKind {
    PaymentSucceeded,
    PaymentFailed,
    RefundCompleted,
    DisputeOpened,
    Unknown,
}

/// An authenticated provider notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub external_event_id: String,
    pub provider: Provider,
    pub kind: WebhookKind,
    /// Raw provider type, e.g. `payment_intent.succeeded`
    pub event_type: String,
    /// Provider charge reference the event is about
    pub reference: Option<String>,
    /// Our attempt id, when the provider echoes it back in metadata
    pub attempt_id: Option<Uuid>,
    pub amount: Option<i64>,
    pub payload_digest: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing signature header")]
    Missing,

    #[error("Malformed signature header: {0}")]
    Malformed(String),

    #[error("Signature does not match payload")]
    Mismatch,

    #[error("Signature timestamp outside tolerance ({age_secs}s)")]
    Expired { age_secs: i64 },

    #[error("Signed payload is not a valid event: {0}")]
    Payload(String),
}

/// Stored copy of a received event. Doubles as the idempotency key and audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRecord {
    pub external_event_id: String,
    pub provider: Provider,
    pub event_type: String,
    pub payload_digest: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
}

impl From<&WebhookEvent> for WebhookRecord {
    fn from(event: &WebhookEvent) -> Self {
        Self {
            external_event_id: event.external_event_id.clone(),
            provider: event.provider,
            event_type: event.event_type.clone(),
            payload_digest: event.payload_digest.clone(),
            received_at: event.received_at,
            processed_at: None,
            outcome: None,
        }
    }
}

/// Result of recording an inbound event against the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First time this event id is seen
    New,
    /// Seen and fully applied before
    AlreadyProcessed,
    /// Seen before but never marked processed (crash or concurrent delivery)
    Unprocessed,
}

/// A reconciliation ambiguity parked for an operator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: Uuid,
    pub provider: Provider,
    pub external_event_id: String,
    pub booking_id: Option<Uuid>,
    pub attempt_id: Option<Uuid>,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
}

impl ReviewItem {
    pub fn new(event: &WebhookEvent, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: event.provider,
            external_event_id: event.external_event_id.clone(),
            booking_id: None,
            attempt_id: event.attempt_id,
            reason: reason.into(),
            parked_at: Utc::now(),
        }
    }

    /// Item raised outside webhook handling, e.g. by a client-driven confirm
    pub fn raised(provider: Provider, source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            external_event_id: source.into(),
            booking_id: None,
            attempt_id: None,
            reason: reason.into(),
            parked_at: Utc::now(),
        }
    }

    pub fn with_booking(mut self, booking_id: Uuid, attempt_id: Uuid) -> Self {
        self.booking_id = Some(booking_id);
        self.attempt_id = Some(attempt_id);
        self
    }
}
