//! Applies provider notifications to the ledgers.
//!
//! Deliveries are at-least-once and unordered. An event is authenticated, recorded by
//! (provider, external event id), applied through the same compare-and-set transitions as
//! the confirm path, then marked processed. Anything ambiguous is parked, never guessed.

use berth_core::webhook::{Receipt, ReviewItem, WebhookRecord};
use berth_core::{
    BookingStatus, EngineError, EngineResult, EventSink, PaymentAttempt, PaymentStatus, Provider,
    ProviderRegistry, SignatureError, WebhookEvent, WebhookKind,
};
use berth_shared::models::events::{
    FraudSuspectedEvent, PaymentRefundedEvent, WebhookRejectedEvent,
};
use berth_shared::models::EngineEvent;
use chrono::Utc;
use std::sync::Arc;

use crate::settlement::{Settled, Settlement};
use crate::Ledgers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Duplicate,
    Ignored,
    Parked(String),
    Rejected(SignatureError),
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "APPLIED",
            ReconcileOutcome::Duplicate => "DUPLICATE",
            ReconcileOutcome::Ignored => "IGNORED",
            ReconcileOutcome::Parked(_) => "PARKED",
            ReconcileOutcome::Rejected(_) => "REJECTED",
        }
    }
}

pub struct WebhookReconciler {
    ledgers: Ledgers,
    providers: ProviderRegistry,
    settlement: Settlement,
    sink: Arc<dyn EventSink>,
}

impl WebhookReconciler {
    pub fn new(ledgers: Ledgers, providers: ProviderRegistry, sink: Arc<dyn EventSink>) -> Self {
        Self {
            settlement: Settlement::new(ledgers.clone(), sink.clone()),
            ledgers,
            providers,
            sink,
        }
    }

    /// Process one raw delivery. Storage failures are returned as errors so the provider
    /// redelivers; every other outcome is an acknowledgement.
    pub async fn handle(
        &self,
        provider: Provider,
        raw: &[u8],
        signature: Option<&str>,
    ) -> EngineResult<ReconcileOutcome> {
        let adapter = self.providers.get(provider);
        let event = match adapter.parse_webhook(raw, signature) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("Rejected {} webhook: {}", provider, err);
                self.sink.emit(EngineEvent::WebhookRejected(WebhookRejectedEvent {
                    provider: provider.to_string(),
                    reason: err.to_string(),
                    timestamp: Utc::now().timestamp(),
                }));
                return Ok(ReconcileOutcome::Rejected(err));
            }
        };

        let receipt = self
            .ledgers
            .webhooks
            .record_received(&WebhookRecord::from(&event))
            .await?;
        match receipt {
            Receipt::AlreadyProcessed => {
                tracing::debug!(
                    "Duplicate {} event {} acknowledged",
                    provider,
                    event.external_event_id
                );
                return Ok(ReconcileOutcome::Duplicate);
            }
            Receipt::Unprocessed => tracing::info!(
                "Reapplying unfinished {} event {}",
                provider,
                event.external_event_id
            ),
            Receipt::New => {}
        }

        let outcome = match self.apply(&event).await {
            Ok(outcome) => outcome,
            Err(EngineError::ReconciliationConflict(reason)) => {
                self.park(&event, None, reason).await?
            }
            Err(err) => return Err(err),
        };

        self.ledgers
            .webhooks
            .mark_processed(provider, &event.external_event_id, outcome.as_str())
            .await?;

        tracing::info!(
            "{} event {} ({}) -> {}",
            provider,
            event.external_event_id,
            event.event_type,
            outcome.as_str()
        );
        Ok(outcome)
    }

    async fn apply(&self, event: &WebhookEvent) -> EngineResult<ReconcileOutcome> {
        if event.kind == WebhookKind::Unknown {
            return Ok(ReconcileOutcome::Ignored);
        }

        let attempt = self.find_attempt(event).await?;

        if event.kind == WebhookKind::DisputeOpened {
            tracing::warn!(
                "Dispute opened on {} event {}",
                event.provider,
                event.external_event_id
            );
            self.sink.emit(EngineEvent::FraudSuspected(FraudSuspectedEvent {
                provider: event.provider.to_string(),
                external_event_id: event.external_event_id.clone(),
                attempt_id: attempt.as_ref().map(|a| a.id),
                timestamp: Utc::now().timestamp(),
            }));
            return self
                .park(event, attempt.as_ref(), "dispute opened".to_string())
                .await;
        }

        let attempt = match attempt {
            Some(attempt) => attempt,
            None => {
                return self
                    .park(event, None, "unknown payment reference".to_string())
                    .await
            }
        };
        if attempt.provider != event.provider {
            let reason = format!(
                "event from {} for attempt created with {}",
                event.provider, attempt.provider
            );
            return self.park(event, Some(&attempt), reason).await;
        }
        if let Some(reference) = &event.reference {
            self.ledgers
                .payments
                .attach_reference(attempt.id, reference)
                .await?;
        }

        match event.kind {
            WebhookKind::PaymentSucceeded => {
                if let Some(amount) = event.amount.filter(|a| *a != attempt.amount) {
                    let reason = format!(
                        "captured amount {} differs from attempt amount {}",
                        amount, attempt.amount
                    );
                    return self.park(event, Some(&attempt), reason).await;
                }
                match self.settlement.mark_succeeded(&attempt).await? {
                    Settled::Review(reason) => self.park(event, Some(&attempt), reason).await,
                    _ => Ok(ReconcileOutcome::Applied),
                }
            }
            WebhookKind::PaymentFailed => {
                let reason = format!("provider reported {}", event.event_type);
                match self.settlement.mark_failed(&attempt, &reason).await? {
                    Settled::Review(reason) => self.park(event, Some(&attempt), reason).await,
                    _ => Ok(ReconcileOutcome::Applied),
                }
            }
            WebhookKind::RefundCompleted => self.apply_refund(event, &attempt).await,
            WebhookKind::DisputeOpened | WebhookKind::Unknown => Ok(ReconcileOutcome::Ignored),
        }
    }

    async fn apply_refund(
        &self,
        event: &WebhookEvent,
        attempt: &PaymentAttempt,
    ) -> EngineResult<ReconcileOutcome> {
        if let Some(claim) = &attempt.pending_refund {
            // Amounts are either this refund alone or the running total including it
            let matches = match event.amount {
                None => true,
                Some(amount) => {
                    amount == claim.amount || amount == attempt.refunded_amount + claim.amount
                }
            };
            if !matches {
                let reason = format!(
                    "refund of {:?} reported while refund {} of {} is in flight",
                    event.amount, claim.key, claim.amount
                );
                return self.park(event, Some(attempt), reason).await;
            }
            self.settlement.settle_refund(attempt, claim).await?;
            return Ok(ReconcileOutcome::Applied);
        }

        if attempt.status == PaymentStatus::Refunded {
            return Ok(ReconcileOutcome::Applied);
        }
        if !attempt.status.is_refundable() {
            let reason = format!("refund reported for attempt in status {}", attempt.status);
            return self.park(event, Some(attempt), reason).await;
        }

        // A partial refund is only expected when the cancellation flow already booked it.
        if let Some(amount) = event.amount.filter(|a| *a < attempt.amount) {
            if attempt.refunded_amount >= amount {
                return Ok(ReconcileOutcome::Applied);
            }
            let reason = format!(
                "partial refund of {} was not initiated by a cancellation",
                amount
            );
            return self.park(event, Some(attempt), reason).await;
        }

        let remaining = attempt.refundable_amount();
        self.ledgers
            .payments
            .record_refund(attempt.id, remaining, true)
            .await?;
        self.ledgers
            .capacity
            .transition(
                attempt.booking_id,
                &[BookingStatus::Pending, BookingStatus::Confirmed],
                BookingStatus::Cancelled,
                true,
            )
            .await?;

        self.sink.emit(EngineEvent::PaymentRefunded(PaymentRefundedEvent {
            booking_id: attempt.booking_id,
            attempt_id: attempt.id,
            provider: attempt.provider.to_string(),
            amount: remaining,
            currency: attempt.currency.clone(),
            tier: "PROVIDER".to_string(),
            timestamp: Utc::now().timestamp(),
        }));
        Ok(ReconcileOutcome::Applied)
    }

    async fn find_attempt(&self, event: &WebhookEvent) -> EngineResult<Option<PaymentAttempt>> {
        if let Some(id) = event.attempt_id {
            if let Some(attempt) = self.ledgers.payments.get_attempt(id).await? {
                return Ok(Some(attempt));
            }
        }
        match &event.reference {
            Some(reference) => Ok(self
                .ledgers
                .payments
                .find_by_reference(event.provider, reference)
                .await?),
            None => Ok(None),
        }
    }

    async fn park(
        &self,
        event: &WebhookEvent,
        attempt: Option<&PaymentAttempt>,
        reason: String,
    ) -> EngineResult<ReconcileOutcome> {
        tracing::warn!(
            "Parking {} event {} for review: {}",
            event.provider,
            event.external_event_id,
            reason
        );
        let mut item = ReviewItem::new(event, reason.clone());
        if let Some(attempt) = attempt {
            item = item.with_booking(attempt.booking_id, attempt.id);
        }
        self.ledgers.webhooks.park(&item).await?;
        Ok(ReconcileOutcome::Parked(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{OrchestratorConfig, PaymentOrchestrator, PaymentSession};
    use berth_core::telemetry::MemorySink;
    use berth_core::{
        AdapterError, BookingRequest, CapacityLedger, Customer, Package, PaymentLedger,
        RefundPolicy, WebhookLog,
    };
    use std::time::Duration;
    use berth_gateway::{MockBehavior, MockPaymentAdapter};
    use berth_store::memory::InMemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    struct Harness {
        orchestrator: PaymentOrchestrator,
        reconciler: WebhookReconciler,
        store: Arc<InMemoryStore>,
        adapter: Arc<MockPaymentAdapter>,
        sink: Arc<MemorySink>,
        package: Package,
    }

    fn harness(max_guests: u32) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let package = Package {
            id: Uuid::new_v4(),
            name: "Harbour Dinner".to_string(),
            max_guests,
            price_per_guest: 25_000,
            currency: "USD".to_string(),
            refund_policy: RefundPolicy::default(),
        };
        store.insert_package(package.clone());

        let adapter = Arc::new(MockPaymentAdapter::new(Provider::Global));
        let regional = Arc::new(MockPaymentAdapter::new(Provider::Regional));
        let registry = ProviderRegistry::new(adapter.clone(), regional, vec!["NGN".to_string()]);
        let sink = Arc::new(MemorySink::new());
        let ledgers = Ledgers::from_store(store.clone());

        Harness {
            orchestrator: PaymentOrchestrator::new(
                ledgers.clone(),
                registry.clone(),
                sink.clone(),
                OrchestratorConfig::default(),
            ),
            reconciler: WebhookReconciler::new(ledgers, registry, sink.clone()),
            store,
            adapter,
            sink,
            package,
        }
    }

    async fn book(h: &Harness, guests: u32) -> PaymentSession {
        h.orchestrator
            .initiate(BookingRequest {
                package_id: h.package.id,
                date: (Utc::now().date_naive() + chrono::Duration::days(30)).to_string(),
                guest_count: guests,
                currency: "USD".to_string(),
                customer: Customer::new("guest@example.com"),
                provider: None,
            })
            .await
            .unwrap()
    }

    async fn deliver(h: &Harness, body: serde_json::Value) -> ReconcileOutcome {
        let raw = serde_json::to_vec(&body).unwrap();
        let signature = h.adapter.sign(&raw);
        h.reconciler
            .handle(Provider::Global, &raw, Some(&signature))
            .await
            .unwrap()
    }

    fn succeeded(id: &str, session: &PaymentSession) -> serde_json::Value {
        json!({
            "id": id,
            "type": "payment.succeeded",
            "reference": session.reference,
            "attemptId": session.attempt_id,
        })
    }

    async fn status(h: &Harness, booking_id: Uuid) -> BookingStatus {
        h.store.get_booking(booking_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_and_not_recorded() {
        let h = harness(4);
        let raw = br#"{"id":"evt_1","type":"payment.succeeded"}"#;

        let outcome = h
            .reconciler
            .handle(Provider::Global, raw, Some("deadbeef"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Rejected(SignatureError::Mismatch));

        let missing = h.reconciler.handle(Provider::Global, raw, None).await.unwrap();
        assert_eq!(missing, ReconcileOutcome::Rejected(SignatureError::Missing));

        assert_eq!(h.sink.count("WEBHOOK_REJECTED"), 2);
        assert!(h.store.webhook_records().is_empty());
    }

    #[tokio::test]
    async fn test_success_confirms_once_per_event_id() {
        let h = harness(4);
        let session = book(&h, 2).await;

        assert_eq!(deliver(&h, succeeded("evt_1", &session)).await, ReconcileOutcome::Applied);
        assert_eq!(deliver(&h, succeeded("evt_1", &session)).await, ReconcileOutcome::Duplicate);
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Confirmed);
        assert_eq!(h.sink.count("PAYMENT_SUCCEEDED"), 1);

        // A second delivery under a new id is a no-op on the ledgers
        assert_eq!(deliver(&h, succeeded("evt_2", &session)).await, ReconcileOutcome::Applied);
        assert_eq!(h.sink.count("PAYMENT_SUCCEEDED"), 1);
        assert!(h.store.review_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_found_by_reference_alone() {
        let h = harness(4);
        let session = book(&h, 1).await;

        let body = json!({ "id": "evt_ref", "type": "payment.succeeded", "reference": session.reference });
        assert_eq!(deliver(&h, body).await, ReconcileOutcome::Applied);
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_failure_releases_capacity() {
        let h = harness(2);
        let session = book(&h, 2).await;

        let body = json!({ "id": "evt_f", "type": "payment.failed", "attemptId": session.attempt_id });
        assert_eq!(deliver(&h, body).await, ReconcileOutcome::Applied);
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::PaymentFailed);

        let booking = h.store.get_booking(session.booking_id).await.unwrap().unwrap();
        assert_eq!(h.store.committed_guests(&booking.key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_after_success_is_parked() {
        let h = harness(4);
        let session = book(&h, 1).await;
        deliver(&h, succeeded("evt_ok", &session)).await;

        let body = json!({ "id": "evt_late_fail", "type": "payment.failed", "attemptId": session.attempt_id });
        assert!(matches!(deliver(&h, body).await, ReconcileOutcome::Parked(_)));

        let attempt = h.store.get_attempt(session.attempt_id).await.unwrap().unwrap();
        assert_eq!(attempt.status, PaymentStatus::Succeeded);
        let items = h.store.review_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].booking_id, Some(session.booking_id));
    }

    #[tokio::test]
    async fn test_unknown_reference_is_parked() {
        let h = harness(4);
        let body = json!({ "id": "evt_x", "type": "payment.succeeded", "reference": "mock_nothing" });
        assert_eq!(
            deliver(&h, body).await,
            ReconcileOutcome::Parked("unknown payment reference".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_type_is_acknowledged() {
        let h = harness(4);
        let body = json!({ "id": "evt_u", "type": "customer.updated" });
        assert_eq!(deliver(&h, body.clone()).await, ReconcileOutcome::Ignored);
        assert_eq!(deliver(&h, body).await, ReconcileOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_dispute_raises_fraud_signal() {
        let h = harness(4);
        let session = book(&h, 1).await;
        deliver(&h, succeeded("evt_ok", &session)).await;

        let body = json!({ "id": "evt_d", "type": "dispute.opened", "reference": session.reference });
        assert!(matches!(deliver(&h, body).await, ReconcileOutcome::Parked(_)));
        assert_eq!(h.sink.count("FRAUD_SUSPECTED"), 1);
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_amount_mismatch_is_parked() {
        let h = harness(4);
        let session = book(&h, 2).await;

        let body = json!({
            "id": "evt_short",
            "type": "payment.succeeded",
            "attemptId": session.attempt_id,
            "amount": 100,
        });
        assert!(matches!(deliver(&h, body).await, ReconcileOutcome::Parked(_)));
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn test_late_success_without_capacity_is_parked() {
        let h = harness(2);
        h.adapter.set_behavior(MockBehavior::Transport);
        let err = h
            .orchestrator
            .initiate(BookingRequest {
                package_id: h.package.id,
                date: (Utc::now().date_naive() + chrono::Duration::days(30)).to_string(),
                guest_count: 2,
                currency: "USD".to_string(),
                customer: Customer::new("late@example.com"),
                provider: None,
            })
            .await;
        assert!(err.is_err());
        let failed = h.store.bookings().pop().unwrap();
        let attempt = h
            .store
            .attempts_for_booking(failed.id)
            .await
            .unwrap()
            .pop()
            .unwrap();

        // Someone else takes the released spots
        h.adapter.set_behavior(MockBehavior::Accept);
        book(&h, 2).await;

        let body = json!({ "id": "evt_late", "type": "payment.succeeded", "attemptId": attempt.id });
        match deliver(&h, body).await {
            ReconcileOutcome::Parked(reason) => assert!(reason.contains("capacity")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let attempt = h.store.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(attempt.status, PaymentStatus::Succeeded);
        assert_eq!(status(&h, failed.id).await, BookingStatus::PaymentFailed);
    }

    #[tokio::test]
    async fn test_second_paid_attempt_is_a_duplicate_charge() {
        let h = harness(4);
        h.adapter.set_behavior(MockBehavior::Transport);
        let first = h
            .orchestrator
            .initiate(BookingRequest {
                package_id: h.package.id,
                date: (Utc::now().date_naive() + chrono::Duration::days(30)).to_string(),
                guest_count: 1,
                currency: "USD".to_string(),
                customer: Customer::new("twice@example.com"),
                provider: None,
            })
            .await;
        assert!(first.is_err());
        let booking = h.store.bookings().pop().unwrap();
        let first_attempt = h
            .store
            .attempts_for_booking(booking.id)
            .await
            .unwrap()
            .remove(0);

        h.adapter.set_behavior(MockBehavior::SucceedInline);
        h.orchestrator.retry(booking.id).await.unwrap();
        assert_eq!(status(&h, booking.id).await, BookingStatus::Confirmed);

        let body = json!({ "id": "evt_dup", "type": "payment.succeeded", "attemptId": first_attempt.id });
        match deliver(&h, body).await {
            ReconcileOutcome::Parked(reason) => assert!(reason.contains("duplicate charge")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_refund_cancels_the_booking() {
        let h = harness(4);
        let session = book(&h, 2).await;
        deliver(&h, succeeded("evt_ok", &session)).await;

        let body = json!({ "id": "evt_r", "type": "refund.completed", "reference": session.reference });
        assert_eq!(deliver(&h, body.clone()).await, ReconcileOutcome::Applied);

        let attempt = h.store.get_attempt(session.attempt_id).await.unwrap().unwrap();
        assert_eq!(attempt.status, PaymentStatus::Refunded);
        assert_eq!(attempt.refunded_amount, attempt.amount);
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Cancelled);

        let again = json!({ "id": "evt_r2", "type": "refund.completed", "reference": session.reference });
        assert_eq!(deliver(&h, again).await, ReconcileOutcome::Applied);
        assert_eq!(h.sink.count("PAYMENT_REFUNDED"), 1);
    }

    #[tokio::test]
    async fn test_refund_confirmation_of_a_partial_cancellation() {
        let h = harness(4);
        let session = book(&h, 4).await;
        deliver(&h, succeeded("evt_ok", &session)).await;
        h.orchestrator
            .refund(session.booking_id, Some(1))
            .await
            .unwrap();

        let body = json!({
            "id": "evt_pr",
            "type": "refund.completed",
            "reference": session.reference,
            "amount": 25_000,
        });
        assert_eq!(deliver(&h, body).await, ReconcileOutcome::Applied);
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Confirmed);
    }

    async fn claimed(h: &Harness, attempt_id: Uuid) -> PaymentAttempt {
        loop {
            let attempt = h.store.get_attempt(attempt_id).await.unwrap().unwrap();
            if attempt.pending_refund.is_some() {
                return attempt;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn refunded(id: &str, session: &PaymentSession, amount: i64) -> serde_json::Value {
        json!({
            "id": id,
            "type": "refund.completed",
            "reference": session.reference,
            "amount": amount,
        })
    }

    #[tokio::test]
    async fn test_refund_notice_during_cancellation_settles_it() {
        let h = harness(4);
        let session = book(&h, 2).await;
        deliver(&h, succeeded("evt_ok", &session)).await;
        h.adapter.set_refund_delay(Duration::from_millis(100));

        let notice = async {
            claimed(&h, session.attempt_id).await;
            deliver(&h, refunded("evt_rf", &session, 50_000)).await
        };
        let (cancelled, outcome) =
            tokio::join!(h.orchestrator.refund(session.booking_id, None), notice);

        assert_eq!(outcome, ReconcileOutcome::Applied);
        let cancelled = cancelled.unwrap();
        assert_eq!(cancelled.booking_status, BookingStatus::Cancelled);
        assert_eq!(cancelled.attempt_status, PaymentStatus::Refunded);
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Cancelled);
        assert_eq!(h.sink.count("PAYMENT_REFUNDED"), 1);
        assert!(h.store.review_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_refund_notice_during_cancellation_is_not_parked() {
        let h = harness(4);
        let session = book(&h, 4).await;
        deliver(&h, succeeded("evt_ok", &session)).await;
        h.adapter.set_refund_delay(Duration::from_millis(100));

        let notice = async {
            claimed(&h, session.attempt_id).await;
            deliver(&h, refunded("evt_prf", &session, 25_000)).await
        };
        let (cancelled, outcome) =
            tokio::join!(h.orchestrator.refund(session.booking_id, Some(1)), notice);

        assert_eq!(outcome, ReconcileOutcome::Applied);
        let cancelled = cancelled.unwrap();
        assert_eq!(cancelled.remaining_guests, 3);
        assert_eq!(cancelled.attempt_status, PaymentStatus::PartiallyRefunded);

        let attempt = h.store.get_attempt(session.attempt_id).await.unwrap().unwrap();
        assert_eq!(attempt.refunded_amount, 25_000);
        assert!(attempt.pending_refund.is_none());
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Confirmed);
        assert_eq!(h.sink.count("PAYMENT_REFUNDED"), 1);
        assert!(h.store.review_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refund_notice_settles_a_refund_that_timed_out() {
        let h = harness(4);
        let session = book(&h, 2).await;
        deliver(&h, succeeded("evt_ok", &session)).await;
        h.adapter
            .set_refund_error(Some(AdapterError::Transport("read timed out".to_string())));
        assert!(h.orchestrator.refund(session.booking_id, None).await.is_err());
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Confirmed);

        let stray = deliver(&h, refunded("evt_odd", &session, 1_000)).await;
        assert!(matches!(stray, ReconcileOutcome::Parked(_)));

        let outcome = deliver(&h, refunded("evt_rf", &session, 50_000)).await;
        assert_eq!(outcome, ReconcileOutcome::Applied);
        assert_eq!(status(&h, session.booking_id).await, BookingStatus::Cancelled);

        let attempt = h.store.get_attempt(session.attempt_id).await.unwrap().unwrap();
        assert_eq!(attempt.status, PaymentStatus::Refunded);
        assert_eq!(attempt.refunded_amount, 50_000);
        assert_eq!(attempt.refunded_guests.full, 2);
        assert_eq!(h.sink.count("PAYMENT_REFUNDED"), 1);
    }
}
