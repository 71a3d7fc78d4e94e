//! Terminal transitions of a payment attempt and their effect on the booking.
//!
//! The client-driven confirm path and the webhook reconciler both land here. Every step is
//! a compare-and-set, so whichever caller gets there first applies the change and the
//! other observes `Settled::Unchanged`.

use berth_core::{
    Booking, BookingStatus, EngineError, EngineResult, EventSink, LedgerError, PaymentAttempt,
    PaymentStatus, RefundClaim,
};
use berth_shared::models::events::{
    PaymentFailedEvent, PaymentRefundedEvent, PaymentSucceededEvent,
};
use berth_shared::models::EngineEvent;
use chrono::Utc;
use std::sync::Arc;

use crate::Ledgers;

/// What a settlement call did
#[derive(Debug, Clone)]
pub enum Settled {
    /// This call moved the attempt and the booking now reflects it
    Applied(Booking),
    /// Someone else already applied it
    Unchanged,
    /// Money and inventory disagree; needs an operator
    Review(String),
}

#[derive(Clone)]
pub struct Settlement {
    ledgers: Ledgers,
    sink: Arc<dyn EventSink>,
}

impl Settlement {
    pub fn new(ledgers: Ledgers, sink: Arc<dyn EventSink>) -> Self {
        Self { ledgers, sink }
    }

    /// Mark the attempt SUCCEEDED once, then bring its booking to CONFIRMED.
    ///
    /// FAILED is a valid source: a provider can still capture after we gave up waiting.
    pub async fn mark_succeeded(&self, attempt: &PaymentAttempt) -> EngineResult<Settled> {
        let won = self
            .ledgers
            .payments
            .transition(
                attempt.id,
                &[
                    PaymentStatus::Pending,
                    PaymentStatus::Processing,
                    PaymentStatus::Failed,
                ],
                PaymentStatus::Succeeded,
                None,
            )
            .await?;

        if !won {
            let current = self.current(attempt).await?;
            if !current.status.is_paid() {
                return Err(EngineError::ReconciliationConflict(format!(
                    "attempt {} is {} and cannot succeed",
                    attempt.id, current.status
                )));
            }
            // Repair a half-applied success, but never report a duplicate twice.
            return match self.ensure_confirmed(&current, false).await? {
                Settled::Review(reason) => {
                    tracing::debug!("Attempt {} already settled: {}", attempt.id, reason);
                    Ok(Settled::Unchanged)
                }
                Settled::Applied(booking) => Ok(Settled::Applied(booking)),
                Settled::Unchanged => Ok(Settled::Unchanged),
            };
        }

        tracing::info!(
            "Payment attempt {} for booking {} succeeded via {}",
            attempt.id,
            attempt.booking_id,
            attempt.provider
        );
        self.sink.emit(EngineEvent::PaymentSucceeded(PaymentSucceededEvent {
            booking_id: attempt.booking_id,
            attempt_id: attempt.id,
            provider: attempt.provider.to_string(),
            amount: attempt.amount,
            currency: attempt.currency.clone(),
            timestamp: Utc::now().timestamp(),
        }));

        self.ensure_confirmed(attempt, true).await
    }

    /// Mark a live attempt FAILED once and release the booking's capacity if it was
    /// still waiting on this payment.
    pub async fn mark_failed(&self, attempt: &PaymentAttempt, reason: &str) -> EngineResult<Settled> {
        let won = self
            .ledgers
            .payments
            .transition(
                attempt.id,
                &[PaymentStatus::Pending, PaymentStatus::Processing],
                PaymentStatus::Failed,
                Some(reason),
            )
            .await?;

        if !won {
            let current = self.current(attempt).await?;
            if current.status.is_paid() {
                return Ok(Settled::Review(format!(
                    "failure reported for attempt {} which is already {}",
                    attempt.id, current.status
                )));
            }
            return Ok(Settled::Unchanged);
        }

        tracing::info!(
            "Payment attempt {} for booking {} failed: {}",
            attempt.id,
            attempt.booking_id,
            reason
        );
        self.sink.emit(EngineEvent::PaymentFailed(PaymentFailedEvent {
            booking_id: attempt.booking_id,
            attempt_id: attempt.id,
            provider: attempt.provider.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now().timestamp(),
        }));

        let released = self
            .ledgers
            .capacity
            .transition(
                attempt.booking_id,
                &[BookingStatus::Pending],
                BookingStatus::PaymentFailed,
                true,
            )
            .await?;

        match released {
            Some(booking) => Ok(Settled::Applied(booking)),
            None => Ok(Settled::Applied(self.booking(attempt).await?)),
        }
    }

    /// Idempotently move the booking of a paid attempt to CONFIRMED.
    ///
    /// `first_settle` is true only for the caller that won the attempt transition; only it
    /// reports a duplicate charge.
    pub async fn ensure_confirmed(
        &self,
        attempt: &PaymentAttempt,
        first_settle: bool,
    ) -> EngineResult<Settled> {
        let mut booking = self.booking(attempt).await?;

        // Each pass either finishes or observes a concurrent change; three is plenty.
        for _ in 0..3 {
            match booking.status {
                BookingStatus::Confirmed => {
                    if !first_settle {
                        return Ok(Settled::Unchanged);
                    }
                    let others = self
                        .ledgers
                        .payments
                        .attempts_for_booking(booking.id)
                        .await?;
                    if let Some(other) = others
                        .iter()
                        .find(|a| a.id != attempt.id && a.status.is_paid())
                    {
                        return Ok(Settled::Review(format!(
                            "duplicate charge: booking {} already paid by attempt {}",
                            booking.id, other.id
                        )));
                    }
                    return Ok(Settled::Unchanged);
                }
                BookingStatus::Pending => {
                    let moved = self
                        .ledgers
                        .capacity
                        .transition(
                            booking.id,
                            &[BookingStatus::Pending],
                            BookingStatus::Confirmed,
                            false,
                        )
                        .await?;
                    match moved {
                        Some(confirmed) => {
                            tracing::info!("Booking {} confirmed", confirmed.id);
                            return Ok(Settled::Applied(confirmed));
                        }
                        None => booking = self.booking(attempt).await?,
                    }
                }
                BookingStatus::PaymentFailed => {
                    let max_guests = self.max_guests(&booking).await?;
                    match self
                        .ledgers
                        .capacity
                        .reacquire(booking.id, max_guests, BookingStatus::Confirmed)
                        .await
                    {
                        Ok(reacquired) if reacquired.status == BookingStatus::Confirmed => {
                            tracing::info!(
                                "Booking {} confirmed by late payment on attempt {}",
                                reacquired.id,
                                attempt.id
                            );
                            return Ok(Settled::Applied(reacquired));
                        }
                        Ok(reacquired) => booking = reacquired,
                        Err(LedgerError::CapacityExceeded { remaining, .. }) => {
                            return Ok(Settled::Review(format!(
                                "payment captured for booking {} after its capacity was released; {} spots left",
                                booking.id, remaining
                            )));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                BookingStatus::Cancelled | BookingStatus::Completed => {
                    if !first_settle {
                        return Ok(Settled::Unchanged);
                    }
                    return Ok(Settled::Review(format!(
                        "payment captured for booking {} which is {}",
                        booking.id, booking.status
                    )));
                }
            }
        }

        Err(EngineError::ReconciliationConflict(format!(
            "booking {} kept changing while confirming attempt {}",
            booking.id, attempt.id
        )))
    }

    /// Apply a claimed cancellation refund once the provider has the money moving.
    ///
    /// Both the cancellation and the provider's refund notification call this; the guest
    /// release and the claim completion are each idempotent, and only the caller that
    /// completes the claim reports the refund.
    pub async fn settle_refund(
        &self,
        attempt: &PaymentAttempt,
        claim: &RefundClaim,
    ) -> EngineResult<(PaymentAttempt, Booking)> {
        let booking = self
            .ledgers
            .capacity
            .release_guests(attempt.booking_id, claim.cancelled_before, claim.guests)
            .await?;

        let Some(updated) = self
            .ledgers
            .payments
            .complete_refund(attempt.id, &claim.key)
            .await?
        else {
            return Ok((self.current(attempt).await?, booking));
        };

        tracing::info!(
            "Refunded {} {} ({}) for {} guests of booking {}",
            claim.amount,
            attempt.currency,
            claim.tier,
            claim.guests,
            attempt.booking_id
        );
        self.sink.emit(EngineEvent::PaymentRefunded(PaymentRefundedEvent {
            booking_id: attempt.booking_id,
            attempt_id: attempt.id,
            provider: attempt.provider.to_string(),
            amount: claim.amount,
            currency: attempt.currency.clone(),
            tier: claim.tier.as_str().to_string(),
            timestamp: Utc::now().timestamp(),
        }));
        Ok((updated, booking))
    }

    async fn current(&self, attempt: &PaymentAttempt) -> EngineResult<PaymentAttempt> {
        self.ledgers
            .payments
            .get_attempt(attempt.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("payment attempt {}", attempt.id)))
    }

    async fn booking(&self, attempt: &PaymentAttempt) -> EngineResult<Booking> {
        self.ledgers
            .capacity
            .get_booking(attempt.booking_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("booking {}", attempt.booking_id)))
    }

    async fn max_guests(&self, booking: &Booking) -> EngineResult<u32> {
        let package = self
            .ledgers
            .catalog
            .get_package(booking.package_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("package {}", booking.package_id)))?;
        Ok(package.max_guests)
    }
}
