//! # Payment Method Registry
//!
//! Payment methods are configured per tenant as `id → category`. Payments
//! store the registry id; the Z report buckets by id.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  id        label             category                                  │
//! │  ───────   ───────────────   ────────                                  │
//! │  cash      Dinheiro          cash      ◄── drawer float lands here     │
//! │  credit    Cartão crédito    card                                      │
//! │  debit     Cartão débito     card                                      │
//! │  pix       PIX               instant                                   │
//! │  voucher   Vale refeição     voucher                                   │
//! │                                                                         │
//! │  anything else ──► "other"  (never guessed from the label text)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};

/// Bucket used for labels that are not in the registry.
pub const OTHER_BUCKET: &str = "other";

/// Category of a payment method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MethodCategory {
    Cash,
    Card,
    Instant,
    Voucher,
    Other,
}

/// One configured payment method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentMethodDef {
    pub id: String,
    pub label: String,
    pub category: MethodCategory,
}

impl PaymentMethodDef {
    pub fn new(id: &str, label: &str, category: MethodCategory) -> Self {
        PaymentMethodDef {
            id: id.to_string(),
            label: label.to_string(),
            category,
        }
    }
}

/// The configured payment methods of a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentMethodRegistry {
    methods: Vec<PaymentMethodDef>,
}

impl PaymentMethodRegistry {
    pub fn new(methods: Vec<PaymentMethodDef>) -> Self {
        PaymentMethodRegistry { methods }
    }

    pub fn methods(&self) -> &[PaymentMethodDef] {
        &self.methods
    }

    /// Looks a method up by id (case-insensitive).
    pub fn get(&self, id: &str) -> Option<&PaymentMethodDef> {
        self.methods.iter().find(|m| m.id.eq_ignore_ascii_case(id.trim()))
    }

    /// Resolves a method id for a new payment.
    ///
    /// Unknown ids are rejected; payments must use a configured method.
    pub fn resolve(&self, id: &str) -> CoreResult<&PaymentMethodDef> {
        self.get(id)
            .ok_or_else(|| CoreError::UnknownPaymentMethod(id.to_string()))
    }

    /// Maps a stored label onto a reconciliation bucket.
    ///
    /// Registered ids keep their canonical id; anything else goes to
    /// [`OTHER_BUCKET`].
    pub fn bucket_for(&self, label: &str) -> String {
        match self.get(label) {
            Some(def) => def.id.clone(),
            None => OTHER_BUCKET.to_string(),
        }
    }

    /// The bucket that receives the drawer float and manual movements.
    ///
    /// First method of category `Cash`, or `"cash"` when none is configured.
    pub fn cash_bucket(&self) -> String {
        self.methods
            .iter()
            .find(|m| m.category == MethodCategory::Cash)
            .map(|m| m.id.clone())
            .unwrap_or_else(|| "cash".to_string())
    }
}

impl Default for PaymentMethodRegistry {
    fn default() -> Self {
        PaymentMethodRegistry::new(vec![
            PaymentMethodDef::new("cash", "Dinheiro", MethodCategory::Cash),
            PaymentMethodDef::new("credit", "Cartão de crédito", MethodCategory::Card),
            PaymentMethodDef::new("debit", "Cartão de débito", MethodCategory::Card),
            PaymentMethodDef::new("pix", "PIX", MethodCategory::Instant),
            PaymentMethodDef::new("voucher", "Vale refeição", MethodCategory::Voucher),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unknown() {
        let registry = PaymentMethodRegistry::default();
        assert_eq!(registry.resolve("CASH").unwrap().id, "cash");
        assert!(matches!(
            registry.resolve("bitcoin"),
            Err(CoreError::UnknownPaymentMethod(_))
        ));
    }

    #[test]
    fn test_unmapped_labels_bucket_to_other() {
        let registry = PaymentMethodRegistry::default();
        assert_eq!(registry.bucket_for("debit"), "debit");
        // No keyword guessing: "Cash (USD)" is not "cash"
        assert_eq!(registry.bucket_for("Cash (USD)"), OTHER_BUCKET);
    }

    #[test]
    fn test_cash_bucket() {
        assert_eq!(PaymentMethodRegistry::default().cash_bucket(), "cash");

        let registry = PaymentMethodRegistry::new(vec![
            PaymentMethodDef::new("card", "Card", MethodCategory::Card),
            PaymentMethodDef::new("especie", "Espécie", MethodCategory::Cash),
        ]);
        assert_eq!(registry.cash_bucket(), "especie");
    }
}
