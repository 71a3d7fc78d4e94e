use uuid::Uuid;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct PaymentSucceededEvent {
    pub booking_id: Uuid,
    pub attempt_id: Uuid,
    pub provider: String,
    pub amount: i64,
    pub currency: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct PaymentFailedEvent {
    pub booking_id: Uuid,
    pub attempt_id: Uuid,
    pub provider: String,
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct PaymentRefundedEvent {
    pub booking_id: Uuid,
    pub attempt_id: Uuid,
    pub provider: String,
    pub amount: i64,
    pub currency: String,
    pub tier: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct FraudSuspectedEvent {
    pub provider: String,
    pub external_event_id: String,
    pub attempt_id: Option<Uuid>,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct WebhookRejectedEvent {
    pub provider: String,
    pub reason: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct CapacityConflictEvent {
    pub package_id: Uuid,
    pub date: String,
    pub requested: u32,
    pub remaining: u32,
    pub timestamp: i64,
}

/// Everything the engine reports to downstream consumers (dashboards, alerting, Kafka).
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    PaymentSucceeded(PaymentSucceededEvent),
    PaymentFailed(PaymentFailedEvent),
    PaymentRefunded(PaymentRefundedEvent),
    FraudSuspected(FraudSuspectedEvent),
    WebhookRejected(WebhookRejectedEvent),
    CapacityConflict(CapacityConflictEvent),
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::PaymentSucceeded(_) => "PAYMENT_SUCCEEDED",
            EngineEvent::PaymentFailed(_) => "PAYMENT_FAILED",
            EngineEvent::PaymentRefunded(_) => "PAYMENT_REFUNDED",
            EngineEvent::FraudSuspected(_) => "FRAUD_SUSPECTED",
            EngineEvent::WebhookRejected(_) => "WEBHOOK_REJECTED",
            EngineEvent::CapacityConflict(_) => "CAPACITY_CONFLICT",
        }
    }

    /// Partition key for ordered transports such as Kafka.
    pub fn key(&self) -> String {
        match self {
            EngineEvent::PaymentSucceeded(e) => e.booking_id.to_string(),
            EngineEvent::PaymentFailed(e) => e.booking_id.to_string(),
            EngineEvent::PaymentRefunded(e) => e.booking_id.to_string(),
            EngineEvent::FraudSuspected(e) => e.external_event_id.clone(),
            EngineEvent::WebhookRejected(e) => e.provider.clone(),
            EngineEvent::CapacityConflict(e) => format!("{}:{}", e.package_id, e.date),
        }
    }
}
