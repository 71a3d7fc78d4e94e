use async_trait::async_trait;
use berth_core::repository::LedgerResult;
use berth_core::webhook::{Receipt, ReviewItem, WebhookRecord};
use berth_core::{
    Booking, BookingStatus, CapacityCommitment, CapacityKey, CapacityLedger, Customer,
    LedgerError, Package, PackageCatalog, PaymentAttempt, PaymentLedger, PaymentStatus, Provider,
    RefundClaim, RefundPolicy, TierGuests, WebhookLog,
};
use berth_shared::pii::Masked;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

const LIVE_ATTEMPT_INDEX: &str = "payment_attempts_one_live_per_booking";

/// PostgreSQL ledgers. Capacity checks lock the `capacity_slots` row of the key.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(err: sqlx::Error) -> LedgerError {
    tracing::error!("Database error: {}", err);
    LedgerError::Storage(err.to_string())
}

fn corrupt(what: &str, value: impl std::fmt::Display) -> LedgerError {
    LedgerError::Storage(format!("unreadable {} in database: {}", what, value))
}

fn int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn count(value: i32, what: &str) -> LedgerResult<u32> {
    u32::try_from(value).map_err(|_| corrupt(what, value))
}

fn status_list<T: ToString>(statuses: &[T]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct PackageRow {
    id: Uuid,
    name: String,
    max_guests: i32,
    price_per_guest: i64,
    currency: String,
    full_refund_days_before: i32,
    partial_refund_days_before: i32,
    partial_refund_percentage: i16,
}

impl TryFrom<PackageRow> for Package {
    type Error = LedgerError;

    fn try_from(row: PackageRow) -> Result<Self, Self::Error> {
        Ok(Package {
            id: row.id,
            name: row.name,
            max_guests: count(row.max_guests, "max_guests")?,
            price_per_guest: row.price_per_guest,
            currency: row.currency.trim().to_string(),
            refund_policy: RefundPolicy {
                full_refund_days_before: i64::from(row.full_refund_days_before),
                partial_refund_days_before: i64::from(row.partial_refund_days_before),
                partial_refund_percentage: u8::try_from(row.partial_refund_percentage)
                    .map_err(|_| corrupt("partial_refund_percentage", row.partial_refund_percentage))?,
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    package_id: Uuid,
    event_date: NaiveDate,
    guest_count: i32,
    cancelled_guests: i32,
    status: String,
    total_price: i64,
    currency: String,
    customer_email: String,
    customer_name: Option<String>,
    customer_phone: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = LedgerError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            package_id: row.package_id,
            date: row.event_date,
            guest_count: count(row.guest_count, "guest_count")?,
            cancelled_guests: count(row.cancelled_guests, "cancelled_guests")?,
            status: row.status.parse().map_err(|e: String| corrupt("booking status", e))?,
            total_price: row.total_price,
            currency: row.currency.trim().to_string(),
            customer: Customer {
                email: Masked(row.customer_email),
                name: row.customer_name,
                phone: row.customer_phone,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommitmentRow {
    booking_id: Uuid,
    package_id: Uuid,
    event_date: NaiveDate,
    guests: i32,
    released_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    booking_id: Uuid,
    attempt_number: i32,
    provider: String,
    amount: i64,
    currency: String,
    status: String,
    external_reference: Option<String>,
    idempotency_key: String,
    refunded_amount: i64,
    refund_count: i32,
    full_refund_guests: i32,
    partial_refund_guests: i32,
    refund_claim_key: Option<String>,
    refund_claim_amount: Option<i64>,
    refund_claim_guests: Option<i32>,
    refund_claim_cancelled_before: Option<i32>,
    refund_claim_tier: Option<String>,
    refund_claim_closes: Option<bool>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl AttemptRow {
    fn claim(&self) -> LedgerResult<Option<RefundClaim>> {
        let Some(key) = &self.refund_claim_key else {
            return Ok(None);
        };
        let missing = |column: &str| corrupt(column, format!("NULL beside claim {}", key));
        Ok(Some(RefundClaim {
            key: key.clone(),
            amount: self
                .refund_claim_amount
                .ok_or_else(|| missing("refund_claim_amount"))?,
            guests: count(
                self.refund_claim_guests
                    .ok_or_else(|| missing("refund_claim_guests"))?,
                "refund_claim_guests",
            )?,
            cancelled_before: count(
                self.refund_claim_cancelled_before
                    .ok_or_else(|| missing("refund_claim_cancelled_before"))?,
                "refund_claim_cancelled_before",
            )?,
            tier: self
                .refund_claim_tier
                .as_deref()
                .ok_or_else(|| missing("refund_claim_tier"))?
                .parse()
                .map_err(|e: String| corrupt("refund tier", e))?,
            closes_booking: self
                .refund_claim_closes
                .ok_or_else(|| missing("refund_claim_closes"))?,
        }))
    }
}

impl TryFrom<AttemptRow> for PaymentAttempt {
    type Error = LedgerError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let pending_refund = row.claim()?;
        Ok(PaymentAttempt {
            id: row.id,
            booking_id: row.booking_id,
            attempt_number: count(row.attempt_number, "attempt_number")?,
            provider: row.provider.parse().map_err(|e: String| corrupt("provider", e))?,
            amount: row.amount,
            currency: row.currency.trim().to_string(),
            status: row.status.parse().map_err(|e: String| corrupt("payment status", e))?,
            external_reference: row.external_reference,
            idempotency_key: row.idempotency_key,
            refunded_amount: row.refunded_amount,
            refund_count: count(row.refund_count, "refund_count")?,
            refunded_guests: TierGuests {
                full: count(row.full_refund_guests, "full_refund_guests")?,
                partial: count(row.partial_refund_guests, "partial_refund_guests")?,
            },
            pending_refund,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReviewRow {
    id: Uuid,
    provider: String,
    external_event_id: String,
    booking_id: Option<Uuid>,
    attempt_id: Option<Uuid>,
    reason: String,
    parked_at: DateTime<Utc>,
}

const BOOKING_COLUMNS: &str = "id, package_id, event_date, guest_count, cancelled_guests, status, \
     total_price, currency, customer_email, customer_name, customer_phone, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, booking_id, attempt_number, provider, amount, currency, status, \
     external_reference, idempotency_key, refunded_amount, refund_count, full_refund_guests, \
     partial_refund_guests, refund_claim_key, refund_claim_amount, refund_claim_guests, \
     refund_claim_cancelled_before, refund_claim_tier, refund_claim_closes, failure_reason, \
     created_at, completed_at";

impl PgStore {
    /// Create the slot row if needed and lock it for the rest of the transaction.
    async fn lock_slot(tx: &mut Transaction<'_, Postgres>, key: &CapacityKey) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO capacity_slots (package_id, event_date) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(key.package_id)
        .bind(key.date)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;

        sqlx::query("SELECT 1 FROM capacity_slots WHERE package_id = $1 AND event_date = $2 FOR UPDATE")
            .bind(key.package_id)
            .bind(key.date)
            .execute(&mut **tx)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn committed_in(
        tx: &mut Transaction<'_, Postgres>,
        key: &CapacityKey,
    ) -> LedgerResult<u32> {
        let (sum,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(c.guests), 0)::BIGINT
            FROM capacity_commitments c
            JOIN bookings b ON b.id = c.booking_id
            WHERE c.package_id = $1 AND c.event_date = $2
              AND c.released_at IS NULL
              AND b.status IN ('PENDING', 'CONFIRMED')
            "#,
        )
        .bind(key.package_id)
        .bind(key.date)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage)?;
        u32::try_from(sum).map_err(|_| corrupt("committed guests", sum))
    }

    async fn booking_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> LedgerResult<Booking> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE id = $1 FOR UPDATE",
            BOOKING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage)?;
        row.ok_or_else(|| LedgerError::NotFound(format!("booking {}", id)))?
            .try_into()
    }

    async fn set_booking_status(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        status: BookingStatus,
    ) -> LedgerResult<Booking> {
        let row: BookingRow = sqlx::query_as(&format!(
            "UPDATE bookings SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING {}",
            BOOKING_COLUMNS
        ))
        .bind(id)
        .bind(status.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(storage)?;
        row.try_into()
    }
}

#[async_trait]
impl PackageCatalog for PgStore {
    async fn get_package(&self, id: Uuid) -> LedgerResult<Option<Package>> {
        let row: Option<PackageRow> = sqlx::query_as(
            r#"
            SELECT id, name, max_guests, price_per_guest, currency, full_refund_days_before,
                   partial_refund_days_before, partial_refund_percentage
            FROM packages WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(Package::try_from).transpose()
    }
}

#[async_trait]
impl CapacityLedger for PgStore {
    async fn reserve(&self, booking: &Booking, max_guests: u32) -> LedgerResult<()> {
        let key = booking.key();
        let mut tx = self.pool.begin().await.map_err(storage)?;
        Self::lock_slot(&mut tx, &key).await?;

        let committed = Self::committed_in(&mut tx, &key).await?;
        let requested = booking.active_guests();
        if committed + requested > max_guests {
            // Dropping the transaction rolls it back and frees the slot lock
            return Err(LedgerError::CapacityExceeded {
                requested,
                remaining: max_guests.saturating_sub(committed),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO bookings (id, package_id, event_date, guest_count, cancelled_guests, status,
                                  total_price, currency, customer_email, customer_name,
                                  customer_phone, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(booking.id)
        .bind(booking.package_id)
        .bind(booking.date)
        .bind(int(booking.guest_count))
        .bind(int(booking.cancelled_guests))
        .bind(booking.status.as_str())
        .bind(booking.total_price)
        .bind(&booking.currency)
        .bind(booking.customer.email.expose())
        .bind(&booking.customer.name)
        .bind(&booking.customer.phone)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            "INSERT INTO capacity_commitments (booking_id, package_id, event_date, guests) VALUES ($1, $2, $3, $4)",
        )
        .bind(booking.id)
        .bind(booking.package_id)
        .bind(booking.date)
        .bind(int(requested))
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn reacquire(
        &self,
        booking_id: Uuid,
        max_guests: u32,
        status: BookingStatus,
    ) -> LedgerResult<Booking> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let booking = Self::booking_for_update(&mut tx, booking_id).await?;
        let key = booking.key();
        Self::lock_slot(&mut tx, &key).await?;

        let held: Option<(Option<DateTime<Utc>>,)> =
            sqlx::query_as("SELECT released_at FROM capacity_commitments WHERE booking_id = $1")
                .bind(booking_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage)?;
        if matches!(held, Some((None,))) && booking.status.holds_capacity() {
            tx.commit().await.map_err(storage)?;
            return Ok(booking);
        }

        let committed = Self::committed_in(&mut tx, &key).await?;
        let requested = booking.active_guests();
        if committed + requested > max_guests {
            return Err(LedgerError::CapacityExceeded {
                requested,
                remaining: max_guests.saturating_sub(committed),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO capacity_commitments (booking_id, package_id, event_date, guests)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (booking_id) DO UPDATE SET guests = EXCLUDED.guests, released_at = NULL
            "#,
        )
        .bind(booking_id)
        .bind(booking.package_id)
        .bind(booking.date)
        .bind(int(requested))
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        let updated = Self::set_booking_status(&mut tx, booking_id, status).await?;
        tx.commit().await.map_err(storage)?;
        Ok(updated)
    }

    async fn transition(
        &self,
        booking_id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        release: bool,
    ) -> LedgerResult<Option<Booking>> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "UPDATE bookings SET status = $2, updated_at = NOW() WHERE id = $1 AND status = ANY($3) RETURNING {}",
            BOOKING_COLUMNS
        ))
        .bind(booking_id)
        .bind(to.as_str())
        .bind(status_list(from))
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM bookings WHERE id = $1")
                .bind(booking_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage)?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(LedgerError::NotFound(format!("booking {}", booking_id))),
            };
        };

        if release {
            sqlx::query(
                "UPDATE capacity_commitments SET released_at = NOW() WHERE booking_id = $1 AND released_at IS NULL",
            )
            .bind(booking_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(Some(row.try_into()?))
    }

    async fn release_guests(
        &self,
        booking_id: Uuid,
        cancelled_before: u32,
        guests: u32,
    ) -> LedgerResult<Booking> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let booking = Self::booking_for_update(&mut tx, booking_id).await?;
        if booking.cancelled_guests == cancelled_before + guests {
            tx.commit().await.map_err(storage)?;
            return Ok(booking);
        }
        if booking.cancelled_guests != cancelled_before {
            return Err(LedgerError::Conflict(format!(
                "booking {} has {} cancelled guests, expected {}",
                booking_id, booking.cancelled_guests, cancelled_before
            )));
        }
        let active = booking.active_guests();
        if guests > active {
            return Err(LedgerError::Conflict(format!(
                "cannot release {} guests from booking {} with {} active",
                guests, booking_id, active
            )));
        }

        let remaining = active - guests;
        let status = if remaining == 0 {
            BookingStatus::Cancelled
        } else {
            booking.status
        };

        let row: BookingRow = sqlx::query_as(&format!(
            "UPDATE bookings SET cancelled_guests = cancelled_guests + $2, status = $3, updated_at = NOW() \
             WHERE id = $1 RETURNING {}",
            BOOKING_COLUMNS
        ))
        .bind(booking_id)
        .bind(int(guests))
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            UPDATE capacity_commitments
            SET guests = $2,
                released_at = CASE WHEN $2 = 0 THEN COALESCE(released_at, NOW()) ELSE released_at END
            WHERE booking_id = $1
            "#,
        )
        .bind(booking_id)
        .bind(int(remaining))
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        row.try_into()
    }

    async fn get_booking(&self, id: Uuid) -> LedgerResult<Option<Booking>> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bookings WHERE id = $1",
            BOOKING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(Booking::try_from).transpose()
    }

    async fn commitment(&self, booking_id: Uuid) -> LedgerResult<Option<CapacityCommitment>> {
        let row: Option<CommitmentRow> = sqlx::query_as(
            "SELECT booking_id, package_id, event_date, guests, released_at FROM capacity_commitments WHERE booking_id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|r| {
            Ok(CapacityCommitment {
                booking_id: r.booking_id,
                package_id: r.package_id,
                date: r.event_date,
                guests: count(r.guests, "guests")?,
                released_at: r.released_at,
            })
        })
        .transpose()
    }

    async fn committed_guests(&self, key: &CapacityKey) -> LedgerResult<u32> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let committed = Self::committed_in(&mut tx, key).await?;
        tx.commit().await.map_err(storage)?;
        Ok(committed)
    }
}

#[async_trait]
impl PaymentLedger for PgStore {
    async fn insert_attempt(&self, attempt: &PaymentAttempt) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_attempts (id, booking_id, attempt_number, provider, amount, currency,
                                          status, external_reference, idempotency_key,
                                          refunded_amount, failure_reason, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.booking_id)
        .bind(int(attempt.attempt_number))
        .bind(attempt.provider.as_str())
        .bind(attempt.amount)
        .bind(&attempt.currency)
        .bind(attempt.status.as_str())
        .bind(&attempt.external_reference)
        .bind(&attempt.idempotency_key)
        .bind(attempt.refunded_amount)
        .bind(&attempt.failure_reason)
        .bind(attempt.created_at)
        .bind(attempt.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(LIVE_ATTEMPT_INDEX) => {
                Err(LedgerError::LiveAttemptExists(attempt.booking_id))
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn get_attempt(&self, id: Uuid) -> LedgerResult<Option<PaymentAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_attempts WHERE id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(PaymentAttempt::try_from).transpose()
    }

    async fn find_by_reference(
        &self,
        provider: Provider,
        reference: &str,
    ) -> LedgerResult<Option<PaymentAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_attempts WHERE provider = $1 AND external_reference = $2",
            ATTEMPT_COLUMNS
        ))
        .bind(provider.as_str())
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(PaymentAttempt::try_from).transpose()
    }

    async fn attempts_for_booking(&self, booking_id: Uuid) -> LedgerResult<Vec<PaymentAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_attempts WHERE booking_id = $1 ORDER BY attempt_number",
            ATTEMPT_COLUMNS
        ))
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(PaymentAttempt::try_from).collect()
    }

    async fn attach_reference(&self, id: Uuid, reference: &str) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempts SET external_reference = $2 WHERE id = $1 AND external_reference IS NULL",
        )
        .bind(id)
        .bind(reference)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[PaymentStatus],
        to: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_attempts
            SET status = $2,
                failure_reason = COALESCE($3, failure_reason),
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status = ANY($5)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(failure_reason)
        .bind(!to.is_live())
        .bind(status_list(from))
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_refund(
        &self,
        id: Uuid,
        amount: i64,
        fully_refunded: bool,
    ) -> LedgerResult<PaymentAttempt> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_attempts
            SET refunded_amount = LEAST(amount, refunded_amount + $2),
                refund_count = refund_count + 1,
                status = CASE
                    WHEN $3 OR LEAST(amount, refunded_amount + $2) >= amount THEN 'REFUNDED'
                    ELSE 'PARTIALLY_REFUNDED'
                END
            WHERE id = $1 AND status IN ('SUCCEEDED', 'PARTIALLY_REFUNDED')
              AND refund_claim_key IS NULL
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(id)
        .bind(amount.max(0))
        .bind(fully_refunded)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => row.try_into(),
            None => match self.get_attempt(id).await? {
                Some(attempt) => Err(LedgerError::Conflict(match attempt.pending_refund {
                    Some(claim) => format!("attempt {} has refund {} in flight", id, claim.key),
                    None => format!("attempt {} is {} and cannot be refunded", id, attempt.status),
                })),
                None => Err(LedgerError::NotFound(format!("payment attempt {}", id))),
            },
        }
    }

    async fn claim_refund(
        &self,
        id: Uuid,
        refunds_seen: u32,
        claim: &RefundClaim,
    ) -> LedgerResult<Option<PaymentAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_attempts
            SET refund_claim_key = $2,
                refund_claim_amount = $3,
                refund_claim_guests = $4,
                refund_claim_cancelled_before = $5,
                refund_claim_tier = $6,
                refund_claim_closes = $7
            WHERE id = $1
              AND refund_claim_key IS NULL
              AND refund_count = $8
              AND status IN ('SUCCEEDED', 'PARTIALLY_REFUNDED')
              AND refunded_amount + $3 <= amount
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(id)
        .bind(&claim.key)
        .bind(claim.amount.max(0))
        .bind(int(claim.guests))
        .bind(int(claim.cancelled_before))
        .bind(claim.tier.as_str())
        .bind(claim.closes_booking)
        .bind(int(refunds_seen))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => self.get_attempt(id).await?.map(|_| None).ok_or_else(|| {
                LedgerError::NotFound(format!("payment attempt {}", id))
            }),
        }
    }

    async fn complete_refund(&self, id: Uuid, key: &str) -> LedgerResult<Option<PaymentAttempt>> {
        // SET expressions see the row as it was before the update
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_attempts
            SET refunded_amount = LEAST(amount, refunded_amount + refund_claim_amount),
                refund_count = refund_count + 1,
                full_refund_guests = full_refund_guests
                    + CASE WHEN refund_claim_tier = 'FULL' THEN refund_claim_guests ELSE 0 END,
                partial_refund_guests = partial_refund_guests
                    + CASE WHEN refund_claim_tier = 'PARTIAL' THEN refund_claim_guests ELSE 0 END,
                status = CASE
                    WHEN refund_claim_closes OR refunded_amount + refund_claim_amount >= amount
                        THEN 'REFUNDED'
                    ELSE 'PARTIALLY_REFUNDED'
                END,
                refund_claim_key = NULL,
                refund_claim_amount = NULL,
                refund_claim_guests = NULL,
                refund_claim_cancelled_before = NULL,
                refund_claim_tier = NULL,
                refund_claim_closes = NULL
            WHERE id = $1 AND refund_claim_key = $2
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => self.get_attempt(id).await?.map(|_| None).ok_or_else(|| {
                LedgerError::NotFound(format!("payment attempt {}", id))
            }),
        }
    }

    async fn abandon_refund(&self, id: Uuid, key: &str) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_attempts
            SET refund_claim_key = NULL,
                refund_claim_amount = NULL,
                refund_claim_guests = NULL,
                refund_claim_cancelled_before = NULL,
                refund_claim_tier = NULL,
                refund_claim_closes = NULL
            WHERE id = $1 AND refund_claim_key = $2
            "#,
        )
        .bind(id)
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl WebhookLog for PgStore {
    async fn record_received(&self, record: &WebhookRecord) -> LedgerResult<Receipt> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (provider, external_event_id, event_type, payload_digest, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (provider, external_event_id) DO NOTHING
            "#,
        )
        .bind(record.provider.as_str())
        .bind(&record.external_event_id)
        .bind(&record.event_type)
        .bind(&record.payload_digest)
        .bind(record.received_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if inserted.rows_affected() == 1 {
            return Ok(Receipt::New);
        }

        let (processed_at,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT processed_at FROM webhook_events WHERE provider = $1 AND external_event_id = $2",
        )
        .bind(record.provider.as_str())
        .bind(&record.external_event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        Ok(match processed_at {
            Some(_) => Receipt::AlreadyProcessed,
            None => Receipt::Unprocessed,
        })
    }

    async fn mark_processed(
        &self,
        provider: Provider,
        external_event_id: &str,
        outcome: &str,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE webhook_events SET processed_at = NOW(), outcome = $3 WHERE provider = $1 AND external_event_id = $2",
        )
        .bind(provider.as_str())
        .bind(external_event_id)
        .bind(outcome)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("webhook event {}", external_event_id)));
        }
        Ok(())
    }

    async fn park(&self, item: &ReviewItem) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO review_items (id, provider, external_event_id, booking_id, attempt_id, reason, parked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(item.id)
        .bind(item.provider.as_str())
        .bind(&item.external_event_id)
        .bind(item.booking_id)
        .bind(item.attempt_id)
        .bind(&item.reason)
        .bind(item.parked_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn review_items(&self) -> LedgerResult<Vec<ReviewItem>> {
        let rows: Vec<ReviewRow> = sqlx::query_as(
            r#"
            SELECT id, provider, external_event_id, booking_id, attempt_id, reason, parked_at
            FROM review_items ORDER BY parked_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|r| {
                Ok(ReviewItem {
                    id: r.id,
                    provider: r.provider.parse().map_err(|e: String| corrupt("provider", e))?,
                    external_event_id: r.external_event_id,
                    booking_id: r.booking_id,
                    attempt_id: r.attempt_id,
                    reason: r.reason,
                    parked_at: r.parked_at,
                })
            })
            .collect()
    }
}
