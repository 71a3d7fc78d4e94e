use berth_core::payment::PaymentRequest;
use berth_core::webhook::ReviewItem;
use berth_core::{
    AdapterError, Booking, BookingRequest, BookingStatus, EngineError, EngineResult, EventSink,
    LedgerError, Package, PaymentAttempt, PaymentHandle, PaymentStatus, Provider,
    ProviderRegistry, RefundClaim,
};
use berth_shared::models::events::CapacityConflictEvent;
use berth_shared::models::EngineEvent;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::breaker::ProviderBreakers;
use crate::refund::{self, RefundDecision, RefundTier};
use crate::settlement::{Settled, Settlement};
use crate::Ledgers;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on a single provider call
    pub provider_timeout: Duration,
    pub max_payment_attempts: u32,
    pub breaker_threshold: usize,
    pub breaker_reset: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(10),
            max_payment_attempts: 3,
            breaker_threshold: 5,
            breaker_reset: Duration::from_secs(30),
        }
    }
}

/// What the client needs to finish paying
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub booking_id: Uuid,
    pub attempt_id: Uuid,
    pub attempt_number: u32,
    pub provider: Provider,
    pub status: PaymentStatus,
    pub reference: String,
    pub client_secret: Option<String>,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    pub booking: Booking,
    pub attempts: Vec<PaymentAttempt>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOutcome {
    pub attempt: PaymentAttempt,
    pub booking_status: BookingStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundOutcome {
    pub booking_id: Uuid,
    pub decision: RefundDecision,
    pub refund_reference: String,
    pub pending: bool,
    pub attempt_status: PaymentStatus,
    pub booking_status: BookingStatus,
    pub remaining_guests: u32,
}

pub struct PaymentOrchestrator {
    ledgers: Ledgers,
    providers: ProviderRegistry,
    breakers: ProviderBreakers,
    settlement: Settlement,
    sink: Arc<dyn EventSink>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        ledgers: Ledgers,
        providers: ProviderRegistry,
        sink: Arc<dyn EventSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            settlement: Settlement::new(ledgers.clone(), sink.clone()),
            breakers: ProviderBreakers::new(config.breaker_threshold, config.breaker_reset),
            ledgers,
            providers,
            sink,
            config,
        }
    }

    pub fn settlement(&self) -> &Settlement {
        &self.settlement
    }

    pub fn breakers(&self) -> &ProviderBreakers {
        &self.breakers
    }

    /// Open a booking under the capacity lock and start the first payment attempt.
    pub async fn initiate(&self, request: BookingRequest) -> EngineResult<PaymentSession> {
        let date = parse_booking_date(&request.date, Utc::now().date_naive())?;
        validate_request(&request)?;

        let package = self.package(request.package_id).await?;
        if request.guest_count > package.max_guests {
            return Err(EngineError::Validation(format!(
                "guestCount {} exceeds the package maximum of {}",
                request.guest_count, package.max_guests
            )));
        }
        if !request.currency.eq_ignore_ascii_case(&package.currency) {
            return Err(EngineError::Validation(format!(
                "currency {} does not match package currency {}",
                request.currency, package.currency
            )));
        }

        let provider = request
            .provider
            .unwrap_or_else(|| self.providers.select(&package.currency));

        let booking = Booking::new(&package, date, request.guest_count, request.customer);
        if let Err(err) = self
            .ledgers
            .capacity
            .reserve(&booking, package.max_guests)
            .await
        {
            return Err(self.capacity_error(&booking, err));
        }

        tracing::info!(
            "Booking {} reserved {} guests on {} (customer {})",
            booking.id,
            booking.guest_count,
            booking.key(),
            booking.customer.email
        );

        self.start_attempt(&booking, 1, provider).await
    }

    /// Start a new attempt for a booking whose last attempt failed.
    pub async fn retry(&self, booking_id: Uuid) -> EngineResult<PaymentSession> {
        let booking = self.get_booking(booking_id).await?;
        let attempts = self.ledgers.payments.attempts_for_booking(booking_id).await?;

        let latest = attempts.last().ok_or_else(|| {
            EngineError::RetryNotAllowed(format!("booking {} has no previous attempt", booking_id))
        })?;
        if latest.status != PaymentStatus::Failed {
            return Err(EngineError::RetryNotAllowed(format!(
                "latest attempt is {}",
                latest.status
            )));
        }
        if !matches!(
            booking.status,
            BookingStatus::PaymentFailed | BookingStatus::Pending
        ) {
            return Err(EngineError::RetryNotAllowed(format!(
                "booking is {}",
                booking.status
            )));
        }
        let used = u32::try_from(attempts.len()).unwrap_or(u32::MAX);
        if used >= self.config.max_payment_attempts {
            return Err(EngineError::RetryNotAllowed(format!(
                "booking has used all {} payment attempts",
                self.config.max_payment_attempts
            )));
        }

        let held = self
            .ledgers
            .capacity
            .commitment(booking_id)
            .await?
            .map(|c| c.is_active())
            .unwrap_or(false);

        let booking = if held && booking.status == BookingStatus::Pending {
            booking
        } else {
            let package = self.package(booking.package_id).await?;
            match self
                .ledgers
                .capacity
                .reacquire(booking_id, package.max_guests, BookingStatus::Pending)
                .await
            {
                Ok(b) if b.status == BookingStatus::Pending => b,
                Ok(b) => {
                    return Err(EngineError::RetryNotAllowed(format!("booking is {}", b.status)))
                }
                Err(err) => return Err(self.capacity_error(&booking, err)),
            }
        };

        tracing::info!(
            "Retrying payment for booking {} (attempt {})",
            booking.id,
            latest.attempt_number + 1
        );
        self.start_attempt(&booking, latest.attempt_number + 1, latest.provider)
            .await
    }

    /// Client-driven status check; races the reconciler and loses gracefully.
    pub async fn confirm(&self, attempt_id: Uuid) -> EngineResult<ConfirmOutcome> {
        let attempt = self
            .ledgers
            .payments
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("payment attempt {}", attempt_id)))?;

        if attempt.status.is_paid() {
            self.settlement.ensure_confirmed(&attempt, false).await?;
        } else if attempt.status.is_live() {
            if let Some(reference) = attempt.external_reference.clone() {
                let adapter = self.providers.get(attempt.provider);
                let status = self
                    .call_provider(attempt.provider, adapter.verify(&reference))
                    .await?;

                let settled = match status {
                    PaymentStatus::Succeeded => Some(self.settlement.mark_succeeded(&attempt).await?),
                    PaymentStatus::Failed => Some(
                        self.settlement
                            .mark_failed(&attempt, "provider reported failure on verify")
                            .await?,
                    ),
                    _ => None,
                };

                if let Some(Settled::Review(reason)) = settled {
                    self.park_for_review(&attempt, &format!("confirm:{}", attempt.id), &reason)
                        .await?;
                }
            }
        }

        let attempt = self
            .ledgers
            .payments
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("payment attempt {}", attempt_id)))?;
        let booking = self.get_booking(attempt.booking_id).await?;

        Ok(ConfirmOutcome {
            attempt,
            booking_status: booking.status,
        })
    }

    /// Cancel `guest_count` guests (all remaining when `None`) and refund per policy.
    ///
    /// The refund is claimed on the attempt before the provider is called, so concurrent
    /// cancellations of one booking move money once.
    pub async fn refund(&self, booking_id: Uuid, guest_count: Option<u32>) -> EngineResult<RefundOutcome> {
        self.get_booking(booking_id).await?;
        let attempts = self.ledgers.payments.attempts_for_booking(booking_id).await?;
        let attempt = attempts
            .iter()
            .rev()
            .find(|a| a.status.is_refundable())
            .cloned()
            .ok_or(EngineError::NoRefundablePayment(booking_id))?;
        if let Some(claim) = &attempt.pending_refund {
            return Err(refund_in_flight(booking_id, claim));
        }

        // Read after the attempt: a refund completing in between bumps `refund_count`
        // and the claim below is refused.
        let booking = self.get_booking(booking_id).await?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::Validation(format!(
                "booking is {} and cannot be cancelled",
                booking.status
            )));
        }

        let remaining = booking.active_guests();
        let guests = guest_count.unwrap_or(remaining);
        if guests == 0 || guests > remaining {
            return Err(EngineError::Validation(format!(
                "guestCount must be between 1 and {}",
                remaining
            )));
        }

        let package = self.package(booking.package_id).await?;
        let decision = refund::evaluate_after(
            Utc::now(),
            booking.date,
            &package.refund_policy,
            attempt.amount,
            booking.guest_count,
            Some(guests),
            attempt.refunded_guests,
        );
        if decision.tier == RefundTier::None {
            return Err(EngineError::PolicyExpired);
        }
        let amount = decision.amount.min(attempt.refundable_amount());

        let reference = attempt.external_reference.clone().ok_or_else(|| {
            EngineError::ReconciliationConflict(format!(
                "attempt {} has no provider reference to refund",
                attempt.id
            ))
        })?;

        // Fail fast while no claim is held and nothing can have moved
        if !self.breakers.get(attempt.provider).check().await {
            return Err(circuit_open(attempt.provider));
        }

        let claim = RefundClaim {
            key: attempt.next_refund_key(),
            amount,
            guests,
            cancelled_before: booking.cancelled_guests,
            tier: decision.tier,
            closes_booking: guests == remaining,
        };
        let claimed = self
            .ledgers
            .payments
            .claim_refund(attempt.id, attempt.refund_count, &claim)
            .await?;
        if claimed.is_none() {
            return Err(EngineError::ReconciliationConflict(format!(
                "booking {} changed while cancelling; reload and try again",
                booking_id
            )));
        }

        let adapter = self.providers.get(attempt.provider);
        let result = match self
            .call_provider(
                attempt.provider,
                adapter.refund(&reference, Some(amount), &claim.key),
            )
            .await
        {
            Ok(result) => result,
            Err(err @ EngineError::AdapterRejection(_)) => {
                self.ledgers
                    .payments
                    .abandon_refund(attempt.id, &claim.key)
                    .await?;
                return Err(err);
            }
            Err(err) => {
                // The money may have moved; the provider's refund notification settles it.
                tracing::error!(
                    "Refund {} for booking {} has an unknown outcome: {}",
                    claim.key,
                    booking_id,
                    err
                );
                let reason = format!("refund {} outcome unknown: {}", claim.key, err);
                self.park_for_review(&attempt, &format!("refund:{}", claim.key), &reason)
                    .await?;
                return Err(err);
            }
        };

        let (updated, booking) = self.settlement.settle_refund(&attempt, &claim).await?;

        Ok(RefundOutcome {
            booking_id,
            decision: RefundDecision { amount, ..decision },
            refund_reference: result.refund_reference,
            pending: result.pending,
            attempt_status: updated.status,
            booking_status: booking.status,
            remaining_guests: booking.active_guests(),
        })
    }

    pub async fn booking(&self, booking_id: Uuid) -> EngineResult<BookingView> {
        let booking = self.get_booking(booking_id).await?;
        let attempts = self.ledgers.payments.attempts_for_booking(booking_id).await?;
        Ok(BookingView { booking, attempts })
    }

    async fn start_attempt(
        &self,
        booking: &Booking,
        attempt_number: u32,
        provider: Provider,
    ) -> EngineResult<PaymentSession> {
        let attempt = PaymentAttempt::new(booking, attempt_number, provider);
        if let Err(err) = self.ledgers.payments.insert_attempt(&attempt).await {
            // A concurrent retry owns the capacity; anything else leaves it orphaned.
            if !matches!(err, LedgerError::LiveAttemptExists(_)) {
                self.ledgers
                    .capacity
                    .transition(
                        booking.id,
                        &[BookingStatus::Pending],
                        BookingStatus::PaymentFailed,
                        true,
                    )
                    .await?;
            }
            return Err(err.into());
        }

        let request = PaymentRequest {
            booking_id: booking.id,
            attempt_id: attempt.id,
            amount: attempt.amount,
            currency: attempt.currency.clone(),
            customer: booking.customer.clone(),
            idempotency_key: attempt.idempotency_key.clone(),
        };

        let adapter = self.providers.get(provider);
        let handle = match self
            .call_provider(provider, adapter.create_payment(&request))
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(
                    "Payment attempt {} for booking {} failed at {}: {}",
                    attempt.id,
                    booking.id,
                    provider,
                    err
                );
                self.settlement.mark_failed(&attempt, &err.to_string()).await?;
                return Err(err);
            }
        };

        self.ledgers
            .payments
            .attach_reference(attempt.id, &handle.reference)
            .await?;

        match handle.status {
            PaymentStatus::Succeeded => {
                if let Settled::Review(reason) = self.settlement.mark_succeeded(&attempt).await? {
                    self.park_for_review(&attempt, &format!("confirm:{}", attempt.id), &reason)
                        .await?;
                }
            }
            PaymentStatus::Failed => {
                let reason = "provider declined the payment";
                self.settlement.mark_failed(&attempt, reason).await?;
                return Err(EngineError::AdapterRejection(reason.to_string()));
            }
            _ => {
                // A fast webhook may already have settled it; then this is a no-op.
                self.ledgers
                    .payments
                    .transition(
                        attempt.id,
                        &[PaymentStatus::Pending],
                        PaymentStatus::Processing,
                        None,
                    )
                    .await?;
            }
        }

        let status = self
            .ledgers
            .payments
            .get_attempt(attempt.id)
            .await?
            .map(|a| a.status)
            .unwrap_or(handle.status);

        Ok(session(booking.id, &attempt, handle, status))
    }

    /// One provider call behind the breaker and the bounded wait.
    async fn call_provider<T, F>(&self, provider: Provider, call: F) -> EngineResult<T>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        let breaker = self.breakers.get(provider);
        if !breaker.check().await {
            return Err(circuit_open(provider));
        }

        let outcome = match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Transport(format!(
                "{} did not answer within {}ms",
                provider,
                self.config.provider_timeout.as_millis()
            ))),
        };

        match &outcome {
            Err(AdapterError::Transport(_)) => breaker.record_failure().await,
            _ => breaker.record_success().await,
        }
        outcome.map_err(EngineError::from)
    }

    async fn park_for_review(
        &self,
        attempt: &PaymentAttempt,
        source: &str,
        reason: &str,
    ) -> EngineResult<()> {
        tracing::warn!("Parking attempt {} for review: {}", attempt.id, reason);
        let item = ReviewItem::raised(attempt.provider, source, reason)
            .with_booking(attempt.booking_id, attempt.id);
        self.ledgers.webhooks.park(&item).await?;
        Ok(())
    }

    fn capacity_error(&self, booking: &Booking, err: LedgerError) -> EngineError {
        if let LedgerError::CapacityExceeded { requested, remaining } = err {
            tracing::warn!(
                "Capacity conflict on {}: requested {}, remaining {}",
                booking.key(),
                requested,
                remaining
            );
            self.sink.emit(EngineEvent::CapacityConflict(CapacityConflictEvent {
                package_id: booking.package_id,
                date: booking.date.to_string(),
                requested,
                remaining,
                timestamp: Utc::now().timestamp(),
            }));
        }
        err.into()
    }

    async fn package(&self, id: Uuid) -> EngineResult<Package> {
        self.ledgers
            .catalog
            .get_package(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("package {}", id)))
    }

    async fn get_booking(&self, id: Uuid) -> EngineResult<Booking> {
        self.ledgers
            .capacity
            .get_booking(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("booking {}", id)))
    }
}

fn circuit_open(provider: Provider) -> EngineError {
    EngineError::AdapterTransport(format!("{} is unavailable (circuit open)", provider))
}

fn refund_in_flight(booking_id: Uuid, claim: &RefundClaim) -> EngineError {
    EngineError::ReconciliationConflict(format!(
        "refund {} of {} guests is still in flight for booking {}",
        claim.key, claim.guests, booking_id
    ))
}

fn session(
    booking_id: Uuid,
    attempt: &PaymentAttempt,
    handle: PaymentHandle,
    status: PaymentStatus,
) -> PaymentSession {
    PaymentSession {
        booking_id,
        attempt_id: attempt.id,
        attempt_number: attempt.attempt_number,
        provider: handle.provider,
        status,
        reference: handle.reference,
        client_secret: handle.client_secret,
        redirect_url: handle.redirect_url,
    }
}

fn parse_booking_date(raw: &str, today: NaiveDate) -> EngineResult<NaiveDate> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .filter(|_| raw.len() == 10)
        .ok_or_else(|| EngineError::Validation(format!("date must be YYYY-MM-DD, got {:?}", raw)))?;
    if date < today {
        return Err(EngineError::Validation(format!("date {} is in the past", date)));
    }
    Ok(date)
}

fn validate_request(request: &BookingRequest) -> EngineResult<()> {
    if request.guest_count == 0 {
        return Err(EngineError::Validation("guestCount must be at least 1".to_string()));
    }
    if !is_valid_email(request.customer.email.expose()) {
        return Err(EngineError::Validation(format!(
            "invalid customer email {}",
            request.customer.email
        )));
    }
    let currency = request.currency.as_str();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(EngineError::Validation(format!(
            "currency must be a 3-letter code, got {:?}",
            currency
        )));
    }
    Ok(())
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
