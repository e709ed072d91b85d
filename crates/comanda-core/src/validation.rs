//! # Validation Module
//!
//! Input validation for every operation that accepts free user input.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: Terminal / KDS front-end  - immediate feedback               │
//! │  Layer 2: THIS MODULE               - business rules, no side effects  │
//! │  Layer 3: SQLite                    - CHECK / UNIQUE / FK constraints  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A validation failure never leaves partial effects behind: the engine
//! calls these before opening a store transaction.

use crate::error::ValidationError;
use crate::money::Money;
use crate::types::{DiscountKind, Rate};
use crate::MAX_ITEM_QUANTITY;

pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a required free-text reason (cancellation, discount).
///
/// Returns the trimmed text.
///
/// ```rust
/// use comanda_core::validation::validate_reason;
///
/// assert_eq!(validate_reason("  wrong table ").unwrap(), "wrong table");
/// assert!(validate_reason("   ").is_err());
/// ```
pub fn validate_reason(reason: &str) -> ValidationResult<String> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(ValidationError::Required {
            field: "reason".to_string(),
        });
    }
    if reason.chars().count() > 500 {
        return Err(ValidationError::TooLong {
            field: "reason".to_string(),
            max: 500,
        });
    }
    Ok(reason.to_string())
}

/// Validates a cash movement description.
pub fn validate_description(description: &str) -> ValidationResult<String> {
    let description = description.trim();
    if description.is_empty() {
        return Err(ValidationError::Required {
            field: "description".to_string(),
        });
    }
    if description.chars().count() > 200 {
        return Err(ValidationError::TooLong {
            field: "description".to_string(),
            max: 200,
        });
    }
    Ok(description.to_string())
}

/// Validates a manager PIN attempt.
///
/// ## Rules
/// - 4 to 8 characters
/// - Digits only
pub fn validate_pin(pin: &str) -> ValidationResult<()> {
    let len = pin.chars().count();
    if !(4..=8).contains(&len) {
        return Err(ValidationError::OutOfRange {
            field: "pin length".to_string(),
            min: 4,
            max: 8,
        });
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: "pin".to_string(),
            reason: "must contain only digits".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a line quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_ITEM_QUANTITY (999)
pub fn validate_quantity(quantity: i64) -> ValidationResult<()> {
    if quantity <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }
    if quantity > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }
    Ok(())
}

/// Validates a people count on a table.
pub fn validate_people_count(people: i64) -> ValidationResult<()> {
    if !(1..=200).contains(&people) {
        return Err(ValidationError::OutOfRange {
            field: "people_count".to_string(),
            min: 1,
            max: 200,
        });
    }
    Ok(())
}

/// Validates an amount that must be strictly positive (supplies, withdrawals).
pub fn validate_positive_amount(field: &str, amount: Money) -> ValidationResult<()> {
    if !amount.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates an amount that may be zero but never negative (opening float,
/// counted drawer amounts).
pub fn validate_non_negative_amount(field: &str, amount: Money) -> ValidationResult<()> {
    if amount.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a discount value for its kind.
///
/// ## Rules
/// - Fixed: non-negative cents
/// - Percentage: 0 to 10000 bps (0% to 100%)
pub fn validate_discount(kind: DiscountKind, value: i64) -> ValidationResult<()> {
    match kind {
        DiscountKind::Fixed => validate_non_negative_amount("discount", Money::from_cents(value)),
        DiscountKind::Percentage => {
            let max = Rate::FULL.bps() as i64;
            if !(0..=max).contains(&value) {
                return Err(ValidationError::OutOfRange {
                    field: "discount percentage (bps)".to_string(),
                    min: 0,
                    max,
                });
            }
            Ok(())
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(999).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(-1).is_err());
        assert!(validate_quantity(1000).is_err());
    }

    #[test]
    fn test_validate_pin() {
        assert!(validate_pin("1234").is_ok());
        assert!(validate_pin("12345678").is_ok());
        assert!(validate_pin("123").is_err());
        assert!(validate_pin("12a4").is_err());
    }

    #[test]
    fn test_validate_discount() {
        assert!(validate_discount(DiscountKind::Fixed, 300).is_ok());
        assert!(validate_discount(DiscountKind::Fixed, -1).is_err());
        assert!(validate_discount(DiscountKind::Percentage, 10_000).is_ok());
        assert!(validate_discount(DiscountKind::Percentage, 10_001).is_err());
    }

    #[test]
    fn test_validate_amounts() {
        assert!(validate_positive_amount("amount", Money::from_cents(1)).is_ok());
        assert!(validate_positive_amount("amount", Money::zero()).is_err());
        assert!(validate_non_negative_amount("counted", Money::zero()).is_ok());
        assert!(validate_non_negative_amount("counted", Money::from_cents(-5)).is_err());
    }

    #[test]
    fn test_validate_text() {
        assert!(validate_description("troco").is_ok());
        assert!(validate_description("").is_err());
        assert!(validate_reason(&"x".repeat(501)).is_err());
    }
}
