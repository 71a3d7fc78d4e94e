use async_trait::async_trait;
use uuid::Uuid;

use crate::booking::{Booking, BookingStatus, CapacityCommitment, CapacityKey, Package};
use crate::payment::{PaymentAttempt, PaymentStatus, Provider, RefundClaim};
use crate::webhook::{Receipt, ReviewItem, WebhookRecord};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Insufficient capacity: requested {requested}, remaining {remaining}")]
    CapacityExceeded { requested: u32, remaining: u32 },

    #[error("Booking {0} already has a live payment attempt")]
    LiveAttemptExists(Uuid),

    #[error("Conflicting state: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Read access to sellable packages
#[async_trait]
pub trait PackageCatalog: Send + Sync {
    async fn get_package(&self, id: Uuid) -> LedgerResult<Option<Package>>;
}

/// Bookings together with their guest-count commitments.
///
/// Every method that changes a booking's status changes its commitment in the same
/// transaction. Capacity checks are serialized per (package, date) key.
#[async_trait]
pub trait CapacityLedger: Send + Sync {
    /// Recompute committed guests for the booking's key and, if `max_guests` leaves room,
    /// insert the booking and its commitment. Otherwise `CapacityExceeded` with the real
    /// remaining count.
    async fn reserve(&self, booking: &Booking, max_guests: u32) -> LedgerResult<()>;

    /// Take capacity again for a booking whose commitment was released, moving it to
    /// `status`. Same check and serialization as `reserve`. A booking that already holds
    /// capacity is returned unchanged, so callers must check the returned status.
    async fn reacquire(
        &self,
        booking_id: Uuid,
        max_guests: u32,
        status: BookingStatus,
    ) -> LedgerResult<Booking>;

    /// Compare-and-set on booking status. Returns `None` when the current status is not
    /// in `from`. With `release` the commitment is released in the same step.
    async fn transition(
        &self,
        booking_id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        release: bool,
    ) -> LedgerResult<Option<Booking>>;

    /// Give back `guests` places of an active booking that had `cancelled_before` guests
    /// cancelled. When none remain the booking is cancelled and the commitment released.
    ///
    /// Replaying the same release is a no-op that returns the booking; a booking whose
    /// cancelled count moved elsewhere is a `Conflict`.
    async fn release_guests(
        &self,
        booking_id: Uuid,
        cancelled_before: u32,
        guests: u32,
    ) -> LedgerResult<Booking>;

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>>;

    async fn commitment(&self, booking_id: Uuid) -> LedgerResult<Option<CapacityCommitment>>;

    /// Sum of active commitments for a key
    async fn committed_guests(&self, key: &CapacityKey) -> LedgerResult<u32>;
}

/// Durable record of payment attempts; single source of truth for payment status.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    /// Insert a new attempt. Fails with `LiveAttemptExists` if the booking already has
    /// one in PENDING or PROCESSING.
    async fn insert_attempt(&self, attempt: &PaymentAttempt) -> LedgerResult<()>;

    async fn get_attempt(&self, id: Uuid) -> LedgerResult<Option<PaymentAttempt>>;

    async fn find_by_reference(
        &self,
        provider: Provider,
        reference: &str,
    ) -> LedgerResult<Option<PaymentAttempt>>;

    /// Attempts of a booking ordered by attempt number
    async fn attempts_for_booking(&self, booking_id: Uuid) -> LedgerResult<Vec<PaymentAttempt>>;

    /// Store the provider reference if none is stored yet
    async fn attach_reference(&self, id: Uuid, reference: &str) -> LedgerResult<bool>;

    /// Compare-and-set on attempt status; first writer wins. Terminal targets stamp
    /// `completed_at`. Returns whether this call performed the transition.
    async fn transition(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        to: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> LedgerResult<bool>;

    /// Add `amount` to the refunded total of a refundable attempt and move it to
    /// REFUNDED or PARTIALLY_REFUNDED. Never refunds past the charged amount; an attempt
    /// that is no longer refundable or has a claim outstanding is a `Conflict`.
    async fn record_refund(
        &self,
        id: Uuid,
        amount: i64,
        fully_refunded: bool,
    ) -> LedgerResult<PaymentAttempt>;

    /// Reserve a cancellation refund. Holds only if the attempt is refundable, has no
    /// claim outstanding, still has `claim.amount` left and has completed exactly
    /// `refunds_seen` refunds. Returns `None` when any of that no longer holds.
    async fn claim_refund(
        &self,
        id: Uuid,
        refunds_seen: u32,
        claim: &RefundClaim,
    ) -> LedgerResult<Option<PaymentAttempt>>;

    /// Apply the outstanding claim with `key`: add its amount and guests, move the
    /// attempt to REFUNDED or PARTIALLY_REFUNDED and clear the claim. Returns `None`
    /// when no such claim is outstanding.
    async fn complete_refund(&self, id: Uuid, key: &str) -> LedgerResult<Option<PaymentAttempt>>;

    /// Drop the outstanding claim with `key` after the provider refused the refund
    async fn abandon_refund(&self, id: Uuid, key: &str) -> LedgerResult<()>;
}

/// Inbound webhook log plus the operator review queue
#[async_trait]
pub trait WebhookLog: Send + Sync {
    /// Insert-if-absent on (provider, external event id)
    async fn record_received(&self, record: &WebhookRecord) -> LedgerResult<Receipt>;

    async fn mark_processed(
        &self,
        provider: Provider,
        external_event_id: &str,
        outcome: &str,
    ) -> LedgerResult<()>;

    async fn park(&self, item: &ReviewItem) -> LedgerResult<()>;

    async fn review_items(&self) -> LedgerResult<Vec<ReviewItem>>;
}
