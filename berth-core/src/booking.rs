use berth_shared::pii::Masked;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::payment::Provider;

/// Booking status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    PaymentFailed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::PaymentFailed => "PAYMENT_FAILED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        }
    }

    /// Only these statuses count against package capacity.
    pub fn holds_capacity(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "PAYMENT_FAILED" => Ok(BookingStatus::PaymentFailed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            "COMPLETED" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {}", other)),
        }
    }
}

/// Contact details of the guest paying for a booking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub email: Masked<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Customer {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: Masked(email.into()),
            name: None,
            phone: None,
        }
    }
}

/// Refund rules attached to a package, expressed relative to the event start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefundPolicy {
    pub full_refund_days_before: i64,
    pub partial_refund_days_before: i64,
    pub partial_refund_percentage: u8,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            full_refund_days_before: 7,
            partial_refund_days_before: 2,
            partial_refund_percentage: 50,
        }
    }
}

/// Which band of a refund policy a cancellation falls in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundTier {
    Full,
    Partial,
    None,
}

impl RefundTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundTier::Full => "FULL",
            RefundTier::Partial => "PARTIAL",
            RefundTier::None => "NONE",
        }
    }
}

impl fmt::Display for RefundTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FULL" => Ok(RefundTier::Full),
            "PARTIAL" => Ok(RefundTier::Partial),
            "NONE" => Ok(RefundTier::None),
            other => Err(format!("unknown refund tier: {}", other)),
        }
    }
}

/// Sellable inventory: an event slot, stay or experience with a per-date guest cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: Uuid,
    pub name: String,
    pub max_guests: u32,
    pub price_per_guest: i64,
    pub currency: String,
    pub refund_policy: RefundPolicy,
}

/// The (package, date) pair capacity is enforced on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapacityKey {
    pub package_id: Uuid,
    pub date: NaiveDate,
}

impl fmt::Display for CapacityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package_id, self.date)
    }
}

/// A guest's claim on package inventory for a date
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub package_id: Uuid,
    pub date: NaiveDate,
    pub guest_count: u32,
    pub cancelled_guests: u32,
    pub status: BookingStatus,
    pub total_price: i64,
    pub currency: String,
    pub customer: Customer,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(package: &Package, date: NaiveDate, guest_count: u32, customer: Customer) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            package_id: package.id,
            date,
            guest_count,
            cancelled_guests: 0,
            status: BookingStatus::Pending,
            total_price: package.price_per_guest * i64::from(guest_count),
            currency: package.currency.clone(),
            customer,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> CapacityKey {
        CapacityKey {
            package_id: self.package_id,
            date: self.date,
        }
    }

    /// Guests still holding a place after partial cancellations.
    pub fn active_guests(&self) -> u32 {
        self.guest_count.saturating_sub(self.cancelled_guests)
    }

    pub fn update_status(&mut self, status: BookingStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Reserved guest-slots for a booking. Released commitments stay on record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapacityCommitment {
    pub booking_id: Uuid,
    pub package_id: Uuid,
    pub date: NaiveDate,
    pub guests: u32,
    pub released_at: Option<DateTime<Utc>>,
}

impl CapacityCommitment {
    pub fn for_booking(booking: &Booking) -> Self {
        Self {
            booking_id: booking.id,
            package_id: booking.package_id,
            date: booking.date,
            guests: booking.active_guests(),
            released_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }
}

/// Inbound request to open a booking and start paying for it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub package_id: Uuid,
    pub date: String,
    pub guest_count: u32,
    pub currency: String,
    pub customer: Customer,
    #[serde(default)]
    pub provider: Option<Provider>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> Package {
        Package {
            id: Uuid::new_v4(),
            name: "Sunset Cruise".to_string(),
            max_guests: 10,
            price_per_guest: 50_000,
            currency: "NGN".to_string(),
            refund_policy: RefundPolicy::default(),
        }
    }

    #[test]
    fn test_new_booking_is_priced_per_guest() {
        let date = NaiveDate::from_ymd_opt(2030, 1, 15).unwrap();
        let booking = Booking::new(&package(), date, 4, Customer::new("guest@example.com"));

        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.total_price, 200_000);
        assert_eq!(booking.active_guests(), 4);
        assert_eq!(CapacityCommitment::for_booking(&booking).guests, 4);
    }

    #[test]
    fn test_only_pending_and_confirmed_hold_capacity() {
        assert!(BookingStatus::Pending.holds_capacity());
        assert!(BookingStatus::Confirmed.holds_capacity());
        assert!(!BookingStatus::PaymentFailed.holds_capacity());
        assert!(!BookingStatus::Cancelled.holds_capacity());
        assert!(!BookingStatus::Completed.holds_capacity());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::PaymentFailed,
            BookingStatus::Cancelled,
            BookingStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<BookingStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_request_accepts_camel_case_json() {
        let json = serde_json::json!({
            "packageId": Uuid::nil(),
            "date": "2030-01-15",
            "guestCount": 2,
            "currency": "USD",
            "customer": { "email": "guest@example.com" }
        });

        let req: BookingRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.guest_count, 2);
        assert!(req.provider.is_none());
        assert_eq!(req.customer.email.expose(), "guest@example.com");
    }
}
