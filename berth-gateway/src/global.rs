//! Global-Card provider: intent-based card processor with client secrets.

use async_trait::async_trait;
use berth_core::payment::{PaymentRequest, RefundResult};
use berth_core::webhook::{WebhookEvent, WebhookKind};
use berth_core::{AdapterError, PaymentAdapter, PaymentHandle, PaymentStatus, Provider, SignatureError};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use crate::signature::{payload_digest, verify_timestamped};
use crate::transport_error;

#[derive(Clone)]
pub struct GlobalConfig {
    pub api_key: String,
    pub webhook_secret: String,
    pub base_url: String,
    pub webhook_tolerance_secs: i64,
    pub request_timeout: Duration,
}

pub struct GlobalCardAdapter {
    config: GlobalConfig,
    http: reqwest::Client,
}

impl GlobalCardAdapter {
    pub fn new(config: GlobalConfig) -> Result<Self, AdapterError> {
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
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| AdapterError::Transport(format!("unreadable provider response: {}", e)));
        }

        let body: ErrorEnvelope = response.json().await.unwrap_or_default();
        let message = body
            .error
            .and_then(|e| e.message)
            .unwrap_or_else(|| format!("provider returned {}", status));

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(AdapterError::Transport(message))
        } else {
            Err(AdapterError::Rejected(message))
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    status: String,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    amount: i64,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: EventObject,
}

#[derive(Debug, Deserialize)]
struct EventObject {
    id: String,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    amount_refunded: Option<i64>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

pub(crate) fn map_intent_status(status: &str) -> PaymentStatus {
    match status {
        "succeeded" => PaymentStatus::Succeeded,
        "canceled" => PaymentStatus::Failed,
        "processing" | "requires_capture" => PaymentStatus::Processing,
        _ => PaymentStatus::Pending,
    }
}

pub(crate) fn map_event_type(event_type: &str) -> WebhookKind {
    match event_type {
        "payment_intent.succeeded" => WebhookKind::PaymentSucceeded,
        "payment_intent.payment_failed" | "payment_intent.canceled" => WebhookKind::PaymentFailed,
        "charge.refunded" => WebhookKind::RefundCompleted,
        "charge.dispute.created" => WebhookKind::DisputeOpened,
        _ => WebhookKind::Unknown,
    }
}

#[async_trait]
impl PaymentAdapter for GlobalCardAdapter {
    fn provider(&self) -> Provider {
        Provider::Global
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentHandle, AdapterError> {
        let params = [
            ("amount", request.amount.to_string()),
            ("currency", request.currency.to_ascii_lowercase()),
            ("receipt_email", request.customer.email.expose().clone()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
            ("metadata[booking_id]", request.booking_id.to_string()),
            ("metadata[attempt_id]", request.attempt_id.to_string()),
        ];

        let response = self
            .http
            .post(self.url("/v1/payment_intents"))
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;

        let intent: IntentResponse = Self::read(response).await?;
        tracing::info!(
            "Global intent {} created for booking {} ({})",
            intent.id,
            request.booking_id,
            intent.status
        );

        Ok(PaymentHandle {
            provider: Provider::Global,
            status: map_intent_status(&intent.status),
            reference: intent.id,
            client_secret: intent.client_secret,
            redirect_url: None,
        })
    }

    async fn verify(&self, reference: &str) -> Result<PaymentStatus, AdapterError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/payment_intents/{}", reference)))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let intent: IntentResponse = Self::read(response).await?;
        Ok(map_intent_status(&intent.status))
    }

    async fn refund(
        &self,
        reference: &str,
        amount: Option<i64>,
        idempotency_key: &str,
    ) -> Result<RefundResult, AdapterError> {
        let mut params = vec![("payment_intent", reference.to_string())];
        if let Some(amount) = amount {
            params.push(("amount", amount.to_string()));
        }

        let response = self
            .http
            .post(self.url("/v1/refunds"))
            .bearer_auth(&self.config.api_key)
            .header("Idempotency-Key", idempotency_key)
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;

        let refund: RefundResponse = Self::read(response).await?;
        if refund.status == "failed" || refund.status == "canceled" {
            return Err(AdapterError::Rejected(format!("refund {} {}", refund.id, refund.status)));
        }

        Ok(RefundResult {
            refund_reference: refund.id,
            amount: refund.amount,
            pending: refund.status != "succeeded",
        })
    }

    fn parse_webhook(&self, raw: &[u8], signature: Option<&str>) -> Result<WebhookEvent, SignatureError> {
        verify_timestamped(
            &self.config.webhook_secret,
            signature,
            raw,
            Utc::now().timestamp(),
            self.config.webhook_tolerance_secs,
        )?;
        parse_event(raw)
    }
}

pub(crate) fn parse_event(raw: &[u8]) -> Result<WebhookEvent, SignatureError> {
    let envelope: EventEnvelope =
        serde_json::from_slice(raw).map_err(|e| SignatureError::Payload(e.to_string()))?;
    let object = envelope.data.object;

    // Intents carry their own id; charges and disputes point back at the intent.
    let reference = match object.object.as_deref() {
        Some("payment_intent") | None => Some(object.id.clone()),
        Some(_) => object.payment_intent.clone().or(Some(object.id.clone())),
    };

    let attempt_id = object
        .metadata
        .as_ref()
        .and_then(|m| m.get("attempt_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());

    let kind = map_event_type(&envelope.type_);
    let amount = match kind {
        WebhookKind::RefundCompleted => object.amount_refunded.or(object.amount),
        _ => object.amount,
    };

    Ok(WebhookEvent {
        external_event_id: envelope.id,
        provider: Provider::Global,
        kind,
        event_type: envelope.type_,
        reference,
        attempt_id,
        amount,
        payload_digest: payload_digest(raw),
        received_at: Utc::now(),
    })
}
