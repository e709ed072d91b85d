//! # Pricing
//!
//! Derived sale quantities. Nothing here is stored until completion; the
//! engine recomputes these after every item, discount or payment change.
//!
//! ```text
//! subtotal      = Σ qty × unit_price
//! service_fee   = subtotal × rate            (when enabled)
//! discount      = fixed | base × rate        (clamped to subtotal + fee)
//! total         = max(0, subtotal + service_fee − discount)
//! total_paid    = Σ payments
//! remaining_due = max(0, total − total_paid)
//! change_due    = max(0, total_paid − total)
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;
use crate::types::{DiscountKind, Rate};

/// Rounding tolerance accepted when completing a sale (0.01).
pub const COMPLETION_TOLERANCE: Money = Money::from_cents(1);

/// What a percentage discount is computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountBase {
    #[default]
    Subtotal,
    SubtotalWithServiceFee,
}

/// Tenant pricing rules applied to every sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub service_fee_rate: Rate,
    pub discount_base: DiscountBase,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        PricingPolicy {
            service_fee_rate: Rate::from_bps(1000),
            discount_base: DiscountBase::Subtotal,
        }
    }
}

/// A requested discount before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discount {
    pub kind: DiscountKind,
    /// Cents for `Fixed`, basis points for `Percentage`.
    pub value: i64,
}

impl Discount {
    pub fn fixed(amount: Money) -> Self {
        Discount {
            kind: DiscountKind::Fixed,
            value: amount.cents(),
        }
    }

    pub fn percentage(rate: Rate) -> Self {
        Discount {
            kind: DiscountKind::Percentage,
            value: rate.bps() as i64,
        }
    }
}

/// Every derived figure of a sale at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleTotals {
    pub subtotal: Money,
    pub service_fee: Money,
    pub discount: Money,
    pub total: Money,
    pub total_paid: Money,
    pub remaining_due: Money,
    pub change_due: Money,
}

impl SaleTotals {
    /// Whether completion is allowed (remaining due within tolerance).
    #[inline]
    pub fn is_settled(&self) -> bool {
        self.remaining_due <= COMPLETION_TOLERANCE
    }
}

/// Computes the service fee for a subtotal.
pub fn service_fee(subtotal: Money, enabled: bool, policy: &PricingPolicy) -> Money {
    if enabled {
        subtotal.apply_rate(policy.service_fee_rate)
    } else {
        Money::zero()
    }
}

/// Computes the discount actually applied, clamped so total stays ≥ 0.
pub fn discount_amount(
    discount: Option<Discount>,
    subtotal: Money,
    service_fee: Money,
    policy: &PricingPolicy,
) -> Money {
    let Some(discount) = discount else {
        return Money::zero();
    };

    let ceiling = (subtotal + service_fee).non_negative();
    let raw = match discount.kind {
        DiscountKind::Fixed => Money::from_cents(discount.value),
        DiscountKind::Percentage => {
            let base = match policy.discount_base {
                DiscountBase::Subtotal => subtotal,
                DiscountBase::SubtotalWithServiceFee => subtotal + service_fee,
            };
            let bps = discount.value.clamp(0, Rate::FULL.bps() as i64) as u32;
            base.apply_rate(Rate::from_bps(bps))
        }
    };

    raw.non_negative().min(ceiling)
}

/// Computes every derived figure from raw line and payment data.
///
/// `lines` yields `(quantity, unit_price)` pairs.
pub fn compute_totals<L, P>(
    lines: L,
    service_fee_enabled: bool,
    discount: Option<Discount>,
    payments: P,
    policy: &PricingPolicy,
) -> SaleTotals
where
    L: IntoIterator<Item = (i64, Money)>,
    P: IntoIterator<Item = Money>,
{
    let subtotal: Money = lines
        .into_iter()
        .map(|(qty, unit)| unit.multiply_quantity(qty))
        .sum();
    let fee = service_fee(subtotal, service_fee_enabled, policy);
    let discount = discount_amount(discount, subtotal, fee, policy);
    let total = (subtotal + fee - discount).non_negative();
    let total_paid: Money = payments.into_iter().sum();

    SaleTotals {
        subtotal,
        service_fee: fee,
        discount,
        total,
        total_paid,
        remaining_due: (total - total_paid).non_negative(),
        change_due: (total_paid - total).non_negative(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
