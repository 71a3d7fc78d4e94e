//! In-memory ledgers for tests and local runs.
//!
//! Capacity checks take a per-(package, date) async lock, so two bookings on the same key
//! are checked one after the other while other keys proceed in parallel.

use async_trait::async_trait;
use berth_core::repository::LedgerResult;
use berth_core::webhook::{Receipt, ReviewItem, WebhookRecord};
use berth_core::{
    Booking, BookingStatus, CapacityCommitment, CapacityKey, CapacityLedger, LedgerError,
    Package, PackageCatalog, PaymentAttempt, PaymentLedger, PaymentStatus, Provider, RefundClaim,
    WebhookLog,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    packages: HashMap<Uuid, Package>,
    bookings: HashMap<Uuid, Booking>,
    commitments: HashMap<Uuid, CapacityCommitment>,
    attempts: HashMap<Uuid, PaymentAttempt>,
    webhooks: HashMap<(Provider, String), WebhookRecord>,
    review: Vec<ReviewItem>,
}

impl State {
    fn committed(&self, key: &CapacityKey) -> u32 {
        self.commitments
            .values()
            .filter(|c| c.is_active() && c.package_id == key.package_id && c.date == key.date)
            .filter(|c| {
                self.bookings
                    .get(&c.booking_id)
                    .map(|b| b.status.holds_capacity())
                    .unwrap_or(false)
            })
            .map(|c| c.guests)
            .sum()
    }

    fn booking_mut(&mut self, id: Uuid) -> LedgerResult<&mut Booking> {
        self.bookings
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("booking {}", id)))
    }

    fn attempt_mut(&mut self, id: Uuid) -> LedgerResult<&mut PaymentAttempt> {
        self.attempts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("payment attempt {}", id)))
    }

    fn release(&mut self, booking_id: Uuid) {
        if let Some(c) = self.commitments.get_mut(&booking_id) {
            if c.released_at.is_none() {
                c.released_at = Some(Utc::now());
            }
        }
    }
}

/// All four ledgers over one shared state
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    key_locks: Mutex<HashMap<CapacityKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_package(&self, package: Package) {
        self.write().packages.insert(package.id, package);
    }

    /// Every booking, oldest first
    pub fn bookings(&self) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self.read().bookings.values().cloned().collect();
        bookings.sort_by_key(|b| b.created_at);
        bookings
    }

    pub fn webhook_records(&self) -> Vec<WebhookRecord> {
        self.read().webhooks.values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key_lock(&self, key: CapacityKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Entries only the map still references have no holder or waiter left
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key).or_default().clone()
    }

    #[cfg(test)]
    fn key_lock_count(&self) -> usize {
        self.key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn exceeded(requested: u32, committed: u32, max_guests: u32) -> LedgerError {
    LedgerError::CapacityExceeded {
        requested,
        remaining: max_guests.saturating_sub(committed),
    }
}

#[async_trait]
impl PackageCatalog for InMemoryStore {
    async fn get_package(&self, id: Uuid) -> LedgerResult<Option<Package>> {
        Ok(self.read().packages.get(&id).cloned())
    }
}

#[async_trait]
impl CapacityLedger for InMemoryStore {
    async fn reserve(&self, booking: &Booking, max_guests: u32) -> LedgerResult<()> {
        let lock = self.key_lock(booking.key());
        let _held = lock.lock().await;

        let committed = self.read().committed(&booking.key());
        let requested = booking.active_guests();
        if committed + requested > max_guests {
            return Err(exceeded(requested, committed, max_guests));
        }

        let mut state = self.write();
        state
            .commitments
            .insert(booking.id, CapacityCommitment::for_booking(booking));
        state.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn reacquire(
        &self,
        booking_id: Uuid,
        max_guests: u32,
        status: BookingStatus,
    ) -> LedgerResult<Booking> {
        let key = self
            .read()
            .bookings
            .get(&booking_id)
            .map(|b| b.key())
            .ok_or_else(|| LedgerError::NotFound(format!("booking {}", booking_id)))?;
        let lock = self.key_lock(key);
        let _held = lock.lock().await;

        let (booking, committed) = {
            let state = self.read();
            let booking = state
                .bookings
                .get(&booking_id)
                .cloned()
                .ok_or_else(|| LedgerError::NotFound(format!("booking {}", booking_id)))?;
            let held = state
                .commitments
                .get(&booking_id)
                .map(|c| c.is_active())
                .unwrap_or(false);
            if held && booking.status.holds_capacity() {
                return Ok(booking);
            }
            (booking, state.committed(&key))
        };

        let requested = booking.active_guests();
        if committed + requested > max_guests {
            return Err(exceeded(requested, committed, max_guests));
        }

        let mut state = self.write();
        let entry = state.booking_mut(booking_id)?;
        entry.update_status(status);
        let updated = entry.clone();
        state
            .commitments
            .insert(booking_id, CapacityCommitment::for_booking(&updated));
        Ok(updated)
    }

    async fn transition(
        &self,
        booking_id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        release: bool,
    ) -> LedgerResult<Option<Booking>> {
        let mut state = self.write();
        let booking = state.booking_mut(booking_id)?;
        if !from.contains(&booking.status) {
            return Ok(None);
        }
        booking.update_status(to);
        let updated = booking.clone();
        if release {
            state.release(booking_id);
        }
        Ok(Some(updated))
    }

    async fn release_guests(
        &self,
        booking_id: Uuid,
        cancelled_before: u32,
        guests: u32,
    ) -> LedgerResult<Booking> {
        let mut state = self.write();
        let booking = state.booking_mut(booking_id)?;
        if booking.cancelled_guests == cancelled_before + guests {
            return Ok(booking.clone());
        }
        if booking.cancelled_guests != cancelled_before {
            return Err(LedgerError::Conflict(format!(
                "booking {} has {} cancelled guests, expected {}",
                booking_id, booking.cancelled_guests, cancelled_before
            )));
        }
        if guests > booking.active_guests() {
            return Err(LedgerError::Conflict(format!(
                "cannot release {} guests from booking {} with {} active",
                guests,
                booking_id,
                booking.active_guests()
            )));
        }

        booking.cancelled_guests += guests;
        let remaining = booking.active_guests();
        if remaining == 0 {
            booking.update_status(BookingStatus::Cancelled);
        } else {
            booking.updated_at = Utc::now();
        }
        let updated = booking.clone();

        if let Some(c) = state.commitments.get_mut(&booking_id) {
            c.guests = remaining;
        }
        if remaining == 0 {
            state.release(booking_id);
        }
        Ok(updated)
    }

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>> {
        Ok(self.read().bookings.get(&id).cloned())
    }

    async fn commitment(&self, booking_id: Uuid) -> LedgerResult<Option<CapacityCommitment>> {
        Ok(self.read().commitments.get(&booking_id).cloned())
    }

    async fn committed_guests(&self, key: &CapacityKey) -> LedgerResult<u32> {
        Ok(self.read().committed(key))
    }
}

#[async_trait]
impl PaymentLedger for InMemoryStore {
    async fn insert_attempt(&self, attempt: &PaymentAttempt) -> LedgerResult<()> {
        let mut state = self.write();
        let live = state
            .attempts
            .values()
            .any(|a| a.booking_id == attempt.booking_id && a.status.is_live());
        if live {
            return Err(LedgerError::LiveAttemptExists(attempt.booking_id));
        }
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> LedgerResult<Option<PaymentAttempt>> {
        Ok(self.read().attempts.get(&id).cloned())
    }

    async fn find_by_reference(
        &self,
        provider: Provider,
        reference: &str,
    ) -> LedgerResult<Option<PaymentAttempt>> {
        Ok(self
            .read()
            .attempts
            .values()
            .find(|a| a.provider == provider && a.external_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn attempts_for_booking(&self, booking_id: Uuid) -> LedgerResult<Vec<PaymentAttempt>> {
        let mut attempts: Vec<PaymentAttempt> = self
            .read()
            .attempts
            .values()
            .filter(|a| a.booking_id == booking_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn attach_reference(&self, id: Uuid, reference: &str) -> LedgerResult<bool> {
        let mut state = self.write();
        let attempt = state.attempt_mut(id)?;
        if attempt.external_reference.is_some() {
            return Ok(false);
        }
        attempt.external_reference = Some(reference.to_string());
        Ok(true)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        to: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> LedgerResult<bool> {
        let mut state = self.write();
        let attempt = state.attempt_mut(id)?;
        if !from.contains(&attempt.status) {
            return Ok(false);
        }
        attempt.status = to;
        if let Some(reason) = failure_reason {
            attempt.failure_reason = Some(reason.to_string());
        }
        if !to.is_live() {
            attempt.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn record_refund(
        &self,
        id: Uuid,
        amount: i64,
        fully_refunded: bool,
    ) -> LedgerResult<PaymentAttempt> {
        let mut state = self.write();
        let attempt = state.attempt_mut(id)?;
        if !attempt.status.is_refundable() {
            return Err(LedgerError::Conflict(format!(
                "attempt {} is {} and cannot be refunded",
                id, attempt.status
            )));
        }
        if let Some(claim) = &attempt.pending_refund {
            return Err(LedgerError::Conflict(format!(
                "attempt {} has refund {} in flight",
                id, claim.key
            )));
        }

        apply_refund(attempt, amount, fully_refunded);
        Ok(attempt.clone())
    }

    async fn claim_refund(
        &self,
        id: Uuid,
        refunds_seen: u32,
        claim: &RefundClaim,
    ) -> LedgerResult<Option<PaymentAttempt>> {
        let mut state = self.write();
        let attempt = state.attempt_mut(id)?;
        let free = attempt.status.is_refundable()
            && attempt.pending_refund.is_none()
            && attempt.refund_count == refunds_seen
            && claim.amount <= attempt.refundable_amount();
        if !free {
            return Ok(None);
        }
        attempt.pending_refund = Some(claim.clone());
        Ok(Some(attempt.clone()))
    }

    async fn complete_refund(&self, id: Uuid, key: &str) -> LedgerResult<Option<PaymentAttempt>> {
        let mut state = self.write();
        let attempt = state.attempt_mut(id)?;
        let claim = match attempt.pending_refund.take() {
            Some(claim) if claim.key == key => claim,
            other => {
                attempt.pending_refund = other;
                return Ok(None);
            }
        };

        attempt.refunded_guests.add(claim.tier, claim.guests);
        apply_refund(attempt, claim.amount, claim.closes_booking);
        Ok(Some(attempt.clone()))
    }

    async fn abandon_refund(&self, id: Uuid, key: &str) -> LedgerResult<()> {
        let mut state = self.write();
        let attempt = state.attempt_mut(id)?;
        if attempt.pending_refund.as_ref().map(|c| c.key.as_str()) == Some(key) {
            attempt.pending_refund = None;
        }
        Ok(())
    }
}

fn apply_refund(attempt: &mut PaymentAttempt, amount: i64, fully_refunded: bool) {
    attempt.refunded_amount = (attempt.refunded_amount + amount.max(0)).min(attempt.amount);
    attempt.refund_count += 1;
    attempt.status = if fully_refunded || attempt.refunded_amount >= attempt.amount {
        PaymentStatus::Refunded
    } else {
        PaymentStatus::PartiallyRefunded
    };
}

#[async_trait]
impl WebhookLog for InMemoryStore {
    async fn record_received(&self, record: &WebhookRecord) -> LedgerResult<Receipt> {
        let mut state = self.write();
        let key = (record.provider, record.external_event_id.clone());
        match state.webhooks.get(&key) {
            Some(existing) if existing.processed_at.is_some() => Ok(Receipt::AlreadyProcessed),
            Some(_) => Ok(Receipt::Unprocessed),
            None => {
                state.webhooks.insert(key, record.clone());
                Ok(Receipt::New)
            }
        }
    }

    async fn mark_processed(
        &self,
        provider: Provider,
        external_event_id: &str,
        outcome: &str,
    ) -> LedgerResult<()> {
        let mut state = self.write();
        let record = state
            .webhooks
            .get_mut(&(provider, external_event_id.to_string()))
            .ok_or_else(|| LedgerError::NotFound(format!("webhook event {}", external_event_id)))?;
        record.processed_at = Some(Utc::now());
        record.outcome = Some(outcome.to_string());
        Ok(())
    }

    async fn park(&self, item: &ReviewItem) -> LedgerResult<()> {
        self.write().review.push(item.clone());
        Ok(())
    }

    async fn review_items(&self) -> LedgerResult<Vec<ReviewItem>> {
        Ok(self.read().review.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{Customer, RefundPolicy};
    use chrono::NaiveDate;

    fn package(max_guests: u32) -> Package {
        Package {
            id: Uuid::new_v4(),
            name: "Canopy Walk".to_string(),
            max_guests,
            price_per_guest: 10_000,
            currency: "KES".to_string(),
            refund_policy: RefundPolicy::default(),
        }
    }

    fn booking(package: &Package, guests: u32) -> Booking {
        let date = NaiveDate::from_ymd_opt(2030, 3, 1).unwrap();
        Booking::new(package, date, guests, Customer::new("guest@example.com"))
    }

    #[tokio::test]
    async fn test_reserve_reports_real_remaining() {
        let store = InMemoryStore::new();
        let pkg = package(5);
        let first = booking(&pkg, 3);
        store.reserve(&first, 5).await.unwrap();

        let err = store.reserve(&booking(&pkg, 3), 5).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::CapacityExceeded {
                requested: 3,
                remaining: 2
            }
        );
        assert_eq!(store.committed_guests(&first.key()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_released_commitments_free_capacity() {
        let store = InMemoryStore::new();
        let pkg = package(2);
        let first = booking(&pkg, 2);
        store.reserve(&first, 2).await.unwrap();

        let moved = CapacityLedger::transition(
            &store,
            first.id,
            &[BookingStatus::Pending],
            BookingStatus::PaymentFailed,
            true,
        )
        .await
        .unwrap();
        assert_eq!(moved.unwrap().status, BookingStatus::PaymentFailed);
        assert!(!store.commitment(first.id).await.unwrap().unwrap().is_active());

        store.reserve(&booking(&pkg, 2), 2).await.unwrap();
        assert_eq!(
            store.reacquire(first.id, 2, BookingStatus::Pending).await.unwrap_err(),
            LedgerError::CapacityExceeded {
                requested: 2,
                remaining: 0
            }
        );
    }

    #[tokio::test]
    async fn test_booking_transition_is_compare_and_set() {
        let store = InMemoryStore::new();
        let pkg = package(2);
        let b = booking(&pkg, 1);
        store.reserve(&b, 2).await.unwrap();

        let from = [BookingStatus::Pending];
        assert!(CapacityLedger::transition(&store, b.id, &from, BookingStatus::Confirmed, false)
            .await
            .unwrap()
            .is_some());
        assert!(CapacityLedger::transition(&store, b.id, &from, BookingStatus::PaymentFailed, true)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.committed_guests(&b.key()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reacquire_leaves_holding_bookings_alone() {
        let store = InMemoryStore::new();
        let pkg = package(2);
        let b = booking(&pkg, 1);
        store.reserve(&b, 2).await.unwrap();

        let same = store
            .reacquire(b.id, 2, BookingStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(same.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn test_release_guests_cancels_when_empty() {
        let store = InMemoryStore::new();
        let pkg = package(6);
        let b = booking(&pkg, 4);
        store.reserve(&b, 6).await.unwrap();

        let after = store.release_guests(b.id, 0, 1).await.unwrap();
        assert_eq!(after.active_guests(), 3);
        assert_eq!(after.status, BookingStatus::Pending);
        assert_eq!(store.committed_guests(&b.key()).await.unwrap(), 3);

        // Replays land once
        let again = store.release_guests(b.id, 0, 1).await.unwrap();
        assert_eq!(again.active_guests(), 3);

        assert!(matches!(
            store.release_guests(b.id, 1, 4).await,
            Err(LedgerError::Conflict(_))
        ));
        assert!(matches!(
            store.release_guests(b.id, 0, 2).await,
            Err(LedgerError::Conflict(_))
        ));

        let after = store.release_guests(b.id, 1, 3).await.unwrap();
        assert_eq!(after.status, BookingStatus::Cancelled);
        assert_eq!(store.committed_guests(&b.key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_one_live_attempt_per_booking() {
        let store = InMemoryStore::new();
        let pkg = package(2);
        let b = booking(&pkg, 1);
        let first = PaymentAttempt::new(&b, 1, Provider::Regional);
        store.insert_attempt(&first).await.unwrap();

        let second = PaymentAttempt::new(&b, 2, Provider::Regional);
        assert_eq!(
            store.insert_attempt(&second).await.unwrap_err(),
            LedgerError::LiveAttemptExists(b.id)
        );

        assert!(PaymentLedger::transition(
            &store,
            first.id,
            &[PaymentStatus::Pending],
            PaymentStatus::Failed,
            Some("timeout")
        )
        .await
        .unwrap());
        store.insert_attempt(&second).await.unwrap();

        let attempts = store.attempts_for_booking(b.id).await.unwrap();
        assert_eq!(
            attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(attempts[0].completed_at.is_some());
        assert_eq!(attempts[0].failure_reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_attempt_transition_first_writer_wins() {
        let store = InMemoryStore::new();
        let b = booking(&package(2), 1);
        let attempt = PaymentAttempt::new(&b, 1, Provider::Global);
        store.insert_attempt(&attempt).await.unwrap();

        let live = [PaymentStatus::Pending, PaymentStatus::Processing];
        let won = PaymentLedger::transition(&store, attempt.id, &live, PaymentStatus::Succeeded, None)
            .await
            .unwrap();
        let lost = PaymentLedger::transition(&store, attempt.id, &live, PaymentStatus::Failed, None)
            .await
            .unwrap();
        assert!(won);
        assert!(!lost);
        assert_eq!(
            store.get_attempt(attempt.id).await.unwrap().unwrap().status,
            PaymentStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_reference_is_attached_once() {
        let store = InMemoryStore::new();
        let b = booking(&package(2), 1);
        let attempt = PaymentAttempt::new(&b, 1, Provider::Global);
        store.insert_attempt(&attempt).await.unwrap();

        assert!(store.attach_reference(attempt.id, "pi_1").await.unwrap());
        assert!(!store.attach_reference(attempt.id, "pi_2").await.unwrap());
        let found = store
            .find_by_reference(Provider::Global, "pi_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, attempt.id);
        assert!(store
            .find_by_reference(Provider::Regional, "pi_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_refunds_accumulate_and_cap() {
        let store = InMemoryStore::new();
        let b = booking(&package(4), 4);
        let attempt = PaymentAttempt::new(&b, 1, Provider::Regional);
        store.insert_attempt(&attempt).await.unwrap();

        assert!(matches!(
            store.record_refund(attempt.id, 100, false).await,
            Err(LedgerError::Conflict(_))
        ));

        PaymentLedger::transition(
            &store,
            attempt.id,
            &[PaymentStatus::Pending],
            PaymentStatus::Succeeded,
            None,
        )
        .await
        .unwrap();

        let partial = store.record_refund(attempt.id, 10_000, false).await.unwrap();
        assert_eq!(partial.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(partial.refunded_amount, 10_000);

        let rest = store.record_refund(attempt.id, 1_000_000, false).await.unwrap();
        assert_eq!(rest.status, PaymentStatus::Refunded);
        assert_eq!(rest.refunded_amount, 40_000);
    }

    fn claim(attempt: &PaymentAttempt, amount: i64, guests: u32) -> RefundClaim {
        RefundClaim {
            key: attempt.next_refund_key(),
            amount,
            guests,
            cancelled_before: 0,
            tier: berth_core::RefundTier::Partial,
            closes_booking: false,
        }
    }

    #[tokio::test]
    async fn test_one_refund_claim_at_a_time() {
        let store = InMemoryStore::new();
        let b = booking(&package(4), 4);
        let attempt = PaymentAttempt::new(&b, 1, Provider::Global);
        store.insert_attempt(&attempt).await.unwrap();

        // Nothing to refund before the money is in
        assert!(store
            .claim_refund(attempt.id, 0, &claim(&attempt, 5_000, 1))
            .await
            .unwrap()
            .is_none());

        PaymentLedger::transition(
            &store,
            attempt.id,
            &[PaymentStatus::Pending],
            PaymentStatus::Succeeded,
            None,
        )
        .await
        .unwrap();

        let first = claim(&attempt, 5_000, 1);
        let held = store.claim_refund(attempt.id, 0, &first).await.unwrap().unwrap();
        assert_eq!(held.pending_refund.as_ref(), Some(&first));
        assert!(store
            .claim_refund(attempt.id, 0, &claim(&attempt, 5_000, 1))
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            store.record_refund(attempt.id, 40_000, true).await,
            Err(LedgerError::Conflict(_))
        ));

        let done = store.complete_refund(attempt.id, &first.key).await.unwrap().unwrap();
        assert_eq!(done.refunded_amount, 5_000);
        assert_eq!(done.refund_count, 1);
        assert_eq!(done.refunded_guests.partial, 1);
        assert_eq!(done.status, PaymentStatus::PartiallyRefunded);
        assert!(done.pending_refund.is_none());

        // The second completer finds nothing left to apply
        assert!(store.complete_refund(attempt.id, &first.key).await.unwrap().is_none());

        // A claim taken against a stale view is refused
        let mut done_view = done.clone();
        done_view.refund_count = 0;
        assert!(store
            .claim_refund(attempt.id, 0, &claim(&done_view, 5_000, 1))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim_refund(attempt.id, 1, &claim(&done, 40_000, 3))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_abandoned_claim_frees_the_attempt() {
        let store = InMemoryStore::new();
        let b = booking(&package(4), 2);
        let attempt = PaymentAttempt::new(&b, 1, Provider::Regional);
        store.insert_attempt(&attempt).await.unwrap();
        PaymentLedger::transition(
            &store,
            attempt.id,
            &[PaymentStatus::Pending],
            PaymentStatus::Succeeded,
            None,
        )
        .await
        .unwrap();

        let first = claim(&attempt, 10_000, 1);
        store.claim_refund(attempt.id, 0, &first).await.unwrap().unwrap();
        store.abandon_refund(attempt.id, "someone-else").await.unwrap();
        assert!(store.get_attempt(attempt.id).await.unwrap().unwrap().pending_refund.is_some());

        store.abandon_refund(attempt.id, &first.key).await.unwrap();
        let after = store.get_attempt(attempt.id).await.unwrap().unwrap();
        assert!(after.pending_refund.is_none());
        assert_eq!(after.refunded_amount, 0);
        assert!(store
            .claim_refund(attempt.id, 0, &claim(&attempt, 10_000, 1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_idle_key_locks_are_pruned() {
        let store = InMemoryStore::new();
        for _ in 0..5 {
            let pkg = package(3);
            store.reserve(&booking(&pkg, 1), 3).await.unwrap();
        }
        assert_eq!(store.key_lock_count(), 1);
    }

    #[tokio::test]
    async fn test_webhook_receipts() {
        let store = InMemoryStore::new();
        let record = WebhookRecord {
            external_event_id: "evt_1".to_string(),
            provider: Provider::Global,
            event_type: "payment_intent.succeeded".to_string(),
            payload_digest: "00".to_string(),
            received_at: Utc::now(),
            processed_at: None,
            outcome: None,
        };

        assert_eq!(store.record_received(&record).await.unwrap(), Receipt::New);
        assert_eq!(store.record_received(&record).await.unwrap(), Receipt::Unprocessed);

        store
            .mark_processed(Provider::Global, "evt_1", "APPLIED")
            .await
            .unwrap();
        assert_eq!(
            store.record_received(&record).await.unwrap(),
            Receipt::AlreadyProcessed
        );

        // Event ids are scoped per provider
        let other = WebhookRecord {
            provider: Provider::Regional,
            ..record
        };
        assert_eq!(store.record_received(&other).await.unwrap(), Receipt::New);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserves_respect_capacity() {
        let store = Arc::new(InMemoryStore::new());
        let pkg = package(7);
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let b = booking(&pkg, 1);
            tasks.push(tokio::spawn(async move { store.reserve(&b, 7).await }));
        }

        let mut ok = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 7);
    }
}
