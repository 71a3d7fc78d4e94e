//! Regional-Rails provider: redirect checkout on local bank and mobile-money rails.
//!
//! The provider accepts a caller-chosen transaction reference and rejects duplicates, so the
//! attempt id doubles as reference and idempotency key.

use async_trait::async_trait;
use berth_core::payment::{PaymentRequest, RefundResult};
use berth_core::webhook::{WebhookEvent, WebhookKind};
use berth_core::{AdapterError, PaymentAdapter, PaymentHandle, PaymentStatus, Provider, SignatureError};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::signature::{payload_digest, verify_sha512};
use crate::transport_error;

#[derive(Clone)]
pub struct RegionalConfig {
    pub secret_key: String,
    pub base_url: String,
    pub callback_url: Option<String>,
    pub request_timeout: Duration,
}

pub struct RegionalRailsAdapter {
    config: RegionalConfig,
    http: reqwest::Client,
}

/// Every response is wrapped as `{status, message, data}`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    #[serde(default)]
    access_code: Option<String>,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    event: String,
    data: Value,
}

impl RegionalRailsAdapter {
    pub fn new(config: RegionalConfig) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AdapterError::Transport(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, AdapterError> {
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::Transport(format!("provider returned {}", status)));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| AdapterError::Transport(format!("unreadable provider response: {}", e)))?;

        if !envelope.status || !status.is_success() {
            return Err(AdapterError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| format!("provider returned {}", status)),
            ));
        }

        envelope
            .data
            .ok_or_else(|| AdapterError::Transport("provider response without data".to_string()))
    }
}

pub(crate) fn map_transaction_status(status: &str) -> PaymentStatus {
    match status {
        "success" => PaymentStatus::Succeeded,
        "failed" | "abandoned" | "reversed" => PaymentStatus::Failed,
        "ongoing" | "processing" | "queued" => PaymentStatus::Processing,
        _ => PaymentStatus::Pending,
    }
}

pub(crate) fn map_event_type(event_type: &str) -> WebhookKind {
    match event_type {
        "charge.success" => WebhookKind::PaymentSucceeded,
        "charge.failed" => WebhookKind::PaymentFailed,
        "refund.processed" => WebhookKind::RefundCompleted,
        "charge.dispute.create" => WebhookKind::DisputeOpened,
        _ => WebhookKind::Unknown,
    }
}

#[async_trait]
impl PaymentAdapter for RegionalRailsAdapter {
    fn provider(&self) -> Provider {
        Provider::Regional
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentHandle, AdapterError> {
        let payload = json!({
            "email": request.customer.email.expose(),
            "amount": request.amount,
            "currency": request.currency,
            "reference": request.attempt_id.to_string(),
            "callback_url": self.config.callback_url,
            "metadata": {
                "booking_id": request.booking_id,
                "attempt_id": request.attempt_id,
                "idempotency_key": request.idempotency_key,
            }
        });

        let response = self
            .http
            .post(self.url("/transaction/initialize"))
            .bearer_auth(&self.config.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let data: InitializeData = Self::read(response).await?;
        tracing::info!(
            "Regional transaction {} initialized for booking {}",
            data.reference,
            request.booking_id
        );

        Ok(PaymentHandle {
            provider: Provider::Regional,
            reference: data.reference,
            client_secret: data.access_code,
            redirect_url: Some(data.authorization_url),
            status: PaymentStatus::Pending,
        })
    }

    async fn verify(&self, reference: &str) -> Result<PaymentStatus, AdapterError> {
        let response = self
            .http
            .get(self.url(&format!("/transaction/verify/{}", reference)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(transport_error)?;

        let data: VerifyData = Self::read(response).await?;
        Ok(map_transaction_status(&data.status))
    }

    async fn refund(
        &self,
        reference: &str,
        amount: Option<i64>,
        idempotency_key: &str,
    ) -> Result<RefundResult, AdapterError> {
        let mut payload = json!({ "transaction": reference, "idempotency_key": idempotency_key });
        if let Some(amount) = amount {
            payload["amount"] = json!(amount);
        }

        let response = self
            .http
            .post(self.url("/refund"))
            .bearer_auth(&self.config.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let data: RefundData = Self::read(response).await?;
        let refund_reference = match data.id {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => reference.to_string(),
        };

        Ok(RefundResult {
            refund_reference,
            amount: data.amount.or(amount).unwrap_or_default(),
            pending: data.status.as_deref() != Some("processed"),
        })
    }

    fn parse_webhook(&self, raw: &[u8], signature: Option<&str>) -> Result<WebhookEvent, SignatureError> {
        verify_sha512(&self.config.secret_key, signature, raw)?;
        parse_event(raw)
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn parse_event(raw: &[u8]) -> Result<WebhookEvent, SignatureError> {
    let envelope: EventEnvelope =
        serde_json::from_slice(raw).map_err(|e| SignatureError::Payload(e.to_string()))?;
    let data = &envelope.data;

    let reference = data
        .get("reference")
        .and_then(as_string)
        .or_else(|| data.get("transaction_reference").and_then(as_string))
        .or_else(|| {
            data.get("transaction")
                .and_then(|t| t.get("reference"))
                .and_then(as_string)
        });

    // No event id on this rail: the object id plus event name identifies a delivery.
    let object_id = data
        .get("id")
        .and_then(as_string)
        .or_else(|| reference.clone())
        .ok_or_else(|| SignatureError::Payload("event without id or reference".to_string()))?;

    let attempt_id = data
        .get("metadata")
        .and_then(|m| m.get("attempt_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .or_else(|| reference.as_deref().and_then(|r| Uuid::parse_str(r).ok()));

    Ok(WebhookEvent {
        external_event_id: format!("{}:{}", envelope.event, object_id),
        provider: Provider::Regional,
        kind: map_event_type(&envelope.event),
        event_type: envelope.event.clone(),
        reference,
        attempt_id,
        amount: data.get("amount").and_then(|a| a.as_i64()),
        payload_digest: payload_digest(raw),
        received_at: Utc::now(),
    })
}
