use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::booking::{Booking, Customer, RefundTier};
use crate::webhook::{SignatureError, WebhookEvent};

/// The two interchangeable payment services
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provider {
    Global,
    Regional,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Global => "GLOBAL",
            Provider::Regional => "REGIONAL",
        }
    }

    /// HTTP header carrying the webhook signature
    pub fn signature_header(&self) -> &'static str {
        match self {
            Provider::Global => "global-signature",
            Provider::Regional => "x-regional-signature",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GLOBAL" => Ok(Provider::Global),
            "REGIONAL" => Ok(Provider::Regional),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Currencies settled on regional rails go to the regional provider, everything else is global.
pub fn select_provider(currency: &str, regional_currencies: &[String]) -> Provider {
    if regional_currencies
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
    {
        Provider::Regional
    } else {
        Provider::Global
    }
}

/// Payment attempt status. SUCCEEDED is sticky except for the refund states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
        }
    }

    /// At most one live attempt may exist per booking.
    pub fn is_live(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    /// Money was collected at some point.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded
        )
    }

    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyRefunded
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PROCESSING" => Ok(PaymentStatus::Processing),
            "SUCCEEDED" => Ok(PaymentStatus::Succeeded),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            "PARTIALLY_REFUNDED" => Ok(PaymentStatus::PartiallyRefunded),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

/// One provider-side charge attempt tied to a booking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub attempt_number: u32,
    pub provider: Provider,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub external_reference: Option<String>,
    pub idempotency_key: String,
    pub refunded_amount: i64,
    /// Completed refunds, cancellations and provider-initiated alike
    pub refund_count: u32,
    pub refunded_guests: TierGuests,
    pub pending_refund: Option<RefundClaim>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentAttempt {
    pub fn new(booking: &Booking, attempt_number: u32, provider: Provider) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            attempt_number,
            provider,
            amount: booking.total_price,
            currency: booking.currency.clone(),
            status: PaymentStatus::Pending,
            external_reference: None,
            idempotency_key: idempotency_key(booking.id, attempt_number),
            refunded_amount: 0,
            refund_count: 0,
            refunded_guests: TierGuests::default(),
            pending_refund: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn refundable_amount(&self) -> i64 {
        (self.amount - self.refunded_amount).max(0)
    }

    /// Idempotency key of the next cancellation refund on this attempt
    pub fn next_refund_key(&self) -> String {
        format!("{}:refund:{}", self.id, self.refund_count + 1)
    }
}

/// Guests already refunded in each paying tier
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TierGuests {
    pub full: u32,
    pub partial: u32,
}

impl TierGuests {
    pub fn in_tier(&self, tier: RefundTier) -> u32 {
        match tier {
            RefundTier::Full => self.full,
            RefundTier::Partial => self.partial,
            RefundTier::None => 0,
        }
    }

    pub fn add(&mut self, tier: RefundTier, guests: u32) {
        match tier {
            RefundTier::Full => self.full += guests,
            RefundTier::Partial => self.partial += guests,
            RefundTier::None => {}
        }
    }
}

/// A cancellation refund reserved on an attempt before the provider is asked for the money.
///
/// An attempt holds at most one claim. It is applied exactly once, either by the
/// cancellation that took it or by the provider's refund notification, whichever lands
/// first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefundClaim {
    /// Sent to the provider as the refund's idempotency key
    pub key: String,
    pub amount: i64,
    pub guests: u32,
    /// The booking's cancelled guests when the claim was taken
    pub cancelled_before: u32,
    pub tier: RefundTier,
    /// Cancels every remaining guest
    pub closes_booking: bool,
}

/// A client timeout followed by a resend reuses the same key, so the provider charges once.
pub fn idempotency_key(booking_id: Uuid, attempt_number: u32) -> String {
    format!("{}:{}", booking_id, attempt_number)
}

/// What the orchestrator asks a provider to charge
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub booking_id: Uuid,
    pub attempt_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub customer: Customer,
    pub idempotency_key: String,
}

/// Continuation data the client needs to finish paying
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentHandle {
    pub provider: Provider,
    pub reference: String,
    pub client_secret: Option<String>,
    pub redirect_url: Option<String>,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub refund_reference: String,
    pub amount: i64,
    /// Provider accepted the refund but settles it later (confirmed by webhook).
    pub pending: bool,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Network failure, timeout or provider outage. Retryable with a new attempt.
    #[error("Provider transport failure: {0}")]
    Transport(String),

    /// Provider declined the operation (e.g. card declined). Terminal for the attempt.
    #[error("Provider rejected the request: {0}")]
    Rejected(String),
}

/// One external payment provider behind a uniform contract.
///
/// Adapters return data only; the orchestrator and reconciler own persistence.
#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Create a charge. One network call, deduplicated by `request.idempotency_key`.
    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentHandle, AdapterError>;

    /// Poll the provider for the current state of a charge
    async fn verify(&self, reference: &str) -> Result<PaymentStatus, AdapterError>;

    /// Refund `amount`, or whatever remains when `None`. Deduplicated by `idempotency_key`.
    async fn refund(
        &self,
        reference: &str,
        amount: Option<i64>,
        idempotency_key: &str,
    ) -> Result<RefundResult, AdapterError>;

    /// Authenticate and decode a notification. Fails closed on a missing or bad signature.
    fn parse_webhook(&self, raw: &[u8], signature: Option<&str>) -> Result<WebhookEvent, SignatureError>;
}

/// Both adapters plus the routing table that picks between them.
#[derive(Clone)]
pub struct ProviderRegistry {
    global: Arc<dyn PaymentAdapter>,
    regional: Arc<dyn PaymentAdapter>,
    regional_currencies: Vec<String>,
}

impl ProviderRegistry {
    pub fn new(
        global: Arc<dyn PaymentAdapter>,
        regional: Arc<dyn PaymentAdapter>,
        regional_currencies: Vec<String>,
    ) -> Self {
        Self {
            global,
            regional,
            regional_currencies,
        }
    }

    pub fn select(&self, currency: &str) -> Provider {
        select_provider(currency, &self.regional_currencies)
    }

    pub fn get(&self, provider: Provider) -> Arc<dyn PaymentAdapter> {
        match provider {
            Provider::Global => self.global.clone(),
            Provider::Regional => self.regional.clone(),
        }
    }
}
