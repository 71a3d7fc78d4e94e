//! In-process provider for tests and local runs.

use async_trait::async_trait;
use berth_core::payment::{PaymentRequest, RefundResult};
use berth_core::webhook::{WebhookEvent, WebhookKind};
use berth_core::{AdapterError, PaymentAdapter, PaymentHandle, PaymentStatus, Provider, SignatureError};
use chrono::Utc;
use serde::Deserialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::signature::{hmac_sha256_hex, payload_digest, verify_sha256};

/// How `create_payment` answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Accept and wait for a webhook
    Accept,
    /// Terminal success returned inline
    SucceedInline,
    /// Network failure
    Transport,
    /// Provider declines with this message
    Decline(String),
    /// Never answer within this duration
    Hang(Duration),
}

pub struct MockPaymentAdapter {
    provider: Provider,
    webhook_secret: String,
    behavior: Mutex<MockBehavior>,
    verify_status: Mutex<PaymentStatus>,
    payment_keys: Mutex<Vec<String>>,
    refunds: Mutex<Vec<(String, Option<i64>)>>,
    refund_keys: Mutex<Vec<String>>,
    refund_delay: Mutex<Duration>,
    refund_error: Mutex<Option<AdapterError>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MockEvent {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    attempt_id: Option<Uuid>,
    #[serde(default)]
    amount: Option<i64>,
}

impl MockPaymentAdapter {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            webhook_secret: format!("mock_{}_secret", provider.as_str().to_ascii_lowercase()),
            behavior: Mutex::new(MockBehavior::Accept),
            verify_status: Mutex::new(PaymentStatus::Processing),
            payment_keys: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
            refund_keys: Mutex::new(Vec::new()),
            refund_delay: Mutex::new(Duration::ZERO),
            refund_error: Mutex::new(None),
        }
    }

    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *guard(&self.behavior) = behavior;
    }

    pub fn set_verify_status(&self, status: PaymentStatus) {
        *guard(&self.verify_status) = status;
    }

    /// Idempotency keys seen by `create_payment`, in call order
    pub fn payment_keys(&self) -> Vec<String> {
        guard(&self.payment_keys).clone()
    }

    pub fn refunds(&self) -> Vec<(String, Option<i64>)> {
        guard(&self.refunds).clone()
    }

    /// Idempotency keys seen by `refund`, in call order
    pub fn refund_keys(&self) -> Vec<String> {
        guard(&self.refund_keys).clone()
    }

    /// Hold every refund call this long before answering
    pub fn set_refund_delay(&self, delay: Duration) {
        *guard(&self.refund_delay) = delay;
    }

    /// Answer refunds with this error until cleared
    pub fn set_refund_error(&self, error: Option<AdapterError>) {
        *guard(&self.refund_error) = error;
    }

    pub fn reference_for(attempt_id: Uuid) -> String {
        format!("mock_{}", attempt_id.simple())
    }

    /// Signature header value for a webhook body
    pub fn sign(&self, raw: &[u8]) -> String {
        hmac_sha256_hex(&self.webhook_secret, raw)
    }
}

fn map_event_type(event_type: &str) -> WebhookKind {
    match event_type {
        "payment.succeeded" => WebhookKind::PaymentSucceeded,
        "payment.failed" => WebhookKind::PaymentFailed,
        "refund.completed" => WebhookKind::RefundCompleted,
        "dispute.opened" => WebhookKind::DisputeOpened,
        _ => WebhookKind::Unknown,
    }
}

#[async_trait]
impl PaymentAdapter for MockPaymentAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentHandle, AdapterError> {
        guard(&self.payment_keys).push(request.idempotency_key.clone());
        let behavior = guard(&self.behavior).clone();

        let status = match behavior {
            MockBehavior::Accept => PaymentStatus::Processing,
            MockBehavior::SucceedInline => PaymentStatus::Succeeded,
            MockBehavior::Transport => {
                return Err(AdapterError::Transport("Simulated payment gateway failure".into()))
            }
            MockBehavior::Decline(reason) => return Err(AdapterError::Rejected(reason)),
            MockBehavior::Hang(duration) => {
                tokio::time::sleep(duration).await;
                PaymentStatus::Processing
            }
        };

        Ok(PaymentHandle {
            provider: self.provider,
            reference: Self::reference_for(request.attempt_id),
            client_secret: Some(format!("mock_secret_{}", request.attempt_id.simple())),
            redirect_url: match self.provider {
                Provider::Regional => Some(format!(
                    "https://checkout.mock/{}",
                    Self::reference_for(request.attempt_id)
                )),
                Provider::Global => None,
            },
            status,
        })
    }

    async fn verify(&self, _reference: &str) -> Result<PaymentStatus, AdapterError> {
        Ok(*guard(&self.verify_status))
    }

    async fn refund(
        &self,
        reference: &str,
        amount: Option<i64>,
        idempotency_key: &str,
    ) -> Result<RefundResult, AdapterError> {
        guard(&self.refund_keys).push(idempotency_key.to_string());
        let delay = *guard(&self.refund_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = guard(&self.refund_error).clone();
        if let Some(err) = failure {
            return Err(err);
        }

        guard(&self.refunds).push((reference.to_string(), amount));
        Ok(RefundResult {
            refund_reference: format!("mock_re_{}", Uuid::new_v4().simple()),
            amount: amount.unwrap_or_default(),
            pending: false,
        })
    }

    fn parse_webhook(&self, raw: &[u8], signature: Option<&str>) -> Result<WebhookEvent, SignatureError> {
        verify_sha256(&self.webhook_secret, signature, raw)?;
        let event: MockEvent =
            serde_json::from_slice(raw).map_err(|e| SignatureError::Payload(e.to_string()))?;

        Ok(WebhookEvent {
            external_event_id: event.id,
            provider: self.provider,
            kind: map_event_type(&event.type_),
            event_type: event.type_,
            reference: event.reference,
            attempt_id: event.attempt_id,
            amount: event.amount,
            payload_digest: payload_digest(raw),
            received_at: Utc::now(),
        })
    }
}
