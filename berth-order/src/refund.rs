//! Refund tiers for cancellations, resolved against the event start.
//!
//! The event instant is 00:00 UTC of the booking date. All money math is integer math in
//! minor units, and each cumulative total is floored once.

pub use berth_core::RefundTier;

use berth_core::payment::TierGuests;
use berth_core::RefundPolicy;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A package's relative policy pinned to absolute deadlines for one event date
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefundPolicyWindow {
    pub full_refund_until: DateTime<Utc>,
    pub partial_refund_until: DateTime<Utc>,
    pub partial_refund_percentage: u8,
}

impl RefundPolicyWindow {
    pub fn resolve(event_date: NaiveDate, policy: &RefundPolicy) -> Self {
        let start = event_start(event_date);
        Self {
            full_refund_until: start - Duration::days(policy.full_refund_days_before),
            partial_refund_until: start - Duration::days(policy.partial_refund_days_before),
            partial_refund_percentage: policy.partial_refund_percentage.min(100),
        }
    }

    pub fn tier_at(&self, now: DateTime<Utc>) -> RefundTier {
        if now < self.full_refund_until {
            RefundTier::Full
        } else if now < self.partial_refund_until {
            RefundTier::Partial
        } else {
            RefundTier::None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefundDecision {
    pub amount: i64,
    pub tier: RefundTier,
    pub guests_cancelled: u32,
}

pub fn event_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Work out what cancelling `guests_to_cancel` of `total_guests` is worth at `now`.
///
/// `paid_amount` is the full charge for all `total_guests`; each guest is worth an equal
/// share. Omitting `guests_to_cancel` cancels everyone.
pub fn evaluate(
    now: DateTime<Utc>,
    event_date: NaiveDate,
    policy: &RefundPolicy,
    paid_amount: i64,
    total_guests: u32,
    guests_to_cancel: Option<u32>,
) -> RefundDecision {
    evaluate_after(
        now,
        event_date,
        policy,
        paid_amount,
        total_guests,
        guests_to_cancel,
        TierGuests::default(),
    )
}

/// Like [`evaluate`] for a booking that already had `refunded` guests refunded.
///
/// The amount is the difference of two floored cumulative totals within the tier, so a
/// run of small cancellations refunds exactly what one cancellation of the same guests
/// would have.
pub fn evaluate_after(
    now: DateTime<Utc>,
    event_date: NaiveDate,
    policy: &RefundPolicy,
    paid_amount: i64,
    total_guests: u32,
    guests_to_cancel: Option<u32>,
    refunded: TierGuests,
) -> RefundDecision {
    let window = RefundPolicyWindow::resolve(event_date, policy);
    let tier = window.tier_at(now);
    let guests = guests_to_cancel.unwrap_or(total_guests).min(total_guests);

    let pct = match tier {
        RefundTier::Full => 100,
        RefundTier::Partial => window.partial_refund_percentage,
        RefundTier::None => 0,
    };
    let amount = if total_guests == 0 || paid_amount <= 0 || pct == 0 {
        0
    } else {
        let before = refunded.in_tier(tier).min(total_guests);
        let after = (before + guests).min(total_guests);
        scale(paid_amount, after, total_guests, pct) - scale(paid_amount, before, total_guests, pct)
    };

    RefundDecision {
        amount,
        tier,
        guests_cancelled: guests,
    }
}

/// paid × k × pct / (n × 100), floored once
fn scale(paid: i64, k: u32, n: u32, pct: u8) -> i64 {
    let numerator = i128::from(paid) * i128::from(k) * i128::from(pct);
    let denominator = i128::from(n) * 100;
    // k <= n and pct <= 100 keep the result within the paid amount
    i64::try_from(numerator / denominator).unwrap_or(paid)
}
