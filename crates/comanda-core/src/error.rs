//! # Error Types
//!
//! Domain-specific error types for comanda-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  comanda-core (this file)                                               │
//! │  ├── CoreError        - Sale aggregate and state machine rules          │
//! │  └── ValidationError  - Input validation failures                       │
//! │                                                                         │
//! │  comanda-db                                                             │
//! │  └── DbError          - Database operation failures                     │
//! │                                                                         │
//! │  comanda-engine                                                         │
//! │  └── EngineError      - What terminals see, with an ErrorKind           │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → EngineError ← DbError              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations detected without touching the store.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The sale is not in a state that allows the requested operation.
    ///
    /// ## When This Occurs
    /// - Adding items to a completed sale
    /// - Recording a payment on a cancelled sale
    /// - Transferring items out of a transferred sale
    #[error("Sale {sale_id} is {status}, cannot perform operation")]
    InvalidSaleStatus { sale_id: String, status: String },

    #[error("Sale item not found: {0}")]
    ItemNotFound(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// Delivered items are final; they can no longer be removed.
    #[error("Item {0} was already delivered and cannot be removed")]
    ItemAlreadyDelivered(String),

    /// Production status may only move forward.
    #[error("Invalid production transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Sale cannot have more than {max} lines")]
    SaleTooLarge { max: usize },

    #[error("Quantity {requested} exceeds maximum allowed ({max})")]
    QuantityTooLarge { requested: i64, max: i64 },

    /// Completion attempted while money is still owed.
    ///
    /// ## User Workflow
    /// ```text
    /// Total 24.50, paid 20.00
    ///      │
    ///      ▼
    /// complete ──► PaymentIncomplete { remaining_cents: 450 }
    ///      │
    ///      ▼
    /// UI keeps the tender screen open with 4.50 due
    /// ```
    #[error("Sale is not fully paid: {remaining_cents} cents remaining")]
    PaymentIncomplete { remaining_cents: i64 },

    /// Payment method id is not in the configured registry.
    #[error("Unknown payment method: {0}")]
    UnknownPaymentMethod(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: String },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    #[error("{field} must be positive")]
    MustBePositive { field: String },

    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::PaymentIncomplete { remaining_cents: 450 };
        assert_eq!(err.to_string(), "Sale is not fully paid: 450 cents remaining");

        let err = CoreError::InvalidSaleStatus {
            sale_id: "s-1".to_string(),
            status: "completed".to_string(),
        };
        assert_eq!(err.to_string(), "Sale s-1 is completed, cannot perform operation");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let err: CoreError = ValidationError::Required {
            field: "reason".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(err.to_string(), "Validation error: reason is required");
    }
}
