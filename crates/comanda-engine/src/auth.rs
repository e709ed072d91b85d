//! # Authorization Gate
//!
//! Manager PIN verification for privileged actions.
//!
//! ## Gated Actions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Authorization Gate                                │
//! │                                                                         │
//! │   cashier ──► apply discount ──┐                                        │
//! │   cashier ──► remove item ─────┤      ┌──────────────────────────┐     │
//! │   cashier ──► cancel sale ─────┼─────►│ actor is manager/admin?  │     │
//! │   cashier ──► transfer items ──┤      └────────────┬─────────────┘     │
//! │   cashier ──► big withdrawal ──┘           no      │ yes → proceed      │
//! │                                            ▼                            │
//! │                              ┌──────────────────────────┐              │
//! │                              │ Approver from verify()?  │              │
//! │                              └────────────┬─────────────┘              │
//! │                                   none    │ some → proceed, record id   │
//! │                                           ▼                             │
//! │                               AuthorizationRequired                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `verify` checks the PIN against every active manager/admin hash, even
//! after a match, so the time to answer does not reveal which employee (if
//! any) owns the PIN. Every failure is the same [`EngineError::AuthorizationDenied`].

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use comanda_core::validation::validate_pin;
use comanda_core::{Actor, Role};
use comanda_db::Database;

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Approver
// =============================================================================

/// A manager whose PIN was verified for this request.
///
/// Only [`AuthorizationGate::verify`] builds one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Approver {
    pub employee_id: String,
    pub name: String,
    pub role: Role,
    #[serde(skip)]
    _verified: (),
}

/// Who allowed a privileged action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// The actor is a manager.
    Actor,
    /// A manager approved with their PIN.
    Approved(Approver),
}

impl Authorization {
    /// Employee id recorded as approver, when one was involved.
    pub fn approver_id(&self) -> Option<&str> {
        match self {
            Authorization::Actor => None,
            Authorization::Approved(approver) => Some(&approver.employee_id),
        }
    }

    pub fn approver_name(&self) -> Option<&str> {
        match self {
            Authorization::Actor => None,
            Authorization::Approved(approver) => Some(&approver.name),
        }
    }
}

/// Decides whether `actor` may perform `action`.
///
/// Managers act on their own authority; anyone else needs a verified approver.
pub fn authorize(
    actor: &Actor,
    approver: Option<&Approver>,
    action: &str,
) -> EngineResult<Authorization> {
    if actor.role.is_manager() {
        return Ok(Authorization::Actor);
    }
    match approver {
        Some(approver) => {
            info!(
                actor = %actor.employee_id,
                approver = %approver.employee_id,
                action,
                "Privileged action approved"
            );
            Ok(Authorization::Approved(approver.clone()))
        }
        None => {
            debug!(actor = %actor.employee_id, action, "Authorization required");
            Err(EngineError::authorization_required(action))
        }
    }
}

// =============================================================================
// Gate
// =============================================================================

/// Verifies manager PINs against the employee directory.
#[derive(Clone)]
pub struct AuthorizationGate {
    db: Database,
}

impl AuthorizationGate {
    pub fn new(db: Database) -> Self {
        AuthorizationGate { db }
    }

    /// Checks `pin` against the active managers of the tenant.
    pub async fn verify(&self, tenant_id: &str, pin: &str) -> EngineResult<Approver> {
        if validate_pin(pin).is_err() {
            warn!(tenant_id, "Manager PIN rejected");
            return Err(EngineError::AuthorizationDenied);
        }

        let candidates = self.db.employees().list_approvers(tenant_id).await?;

        let mut matched = None;
        for employee in &candidates {
            if verify_pin(pin, &employee.pin_hash) && matched.is_none() {
                matched = Some(employee);
            }
        }

        match matched {
            Some(employee) => {
                debug!(employee_id = %employee.id, "Manager PIN verified");
                Ok(Approver {
                    employee_id: employee.id.clone(),
                    name: employee.name.clone(),
                    role: employee.role,
                    _verified: (),
                })
            }
            None => {
                warn!(tenant_id, candidates = candidates.len(), "Manager PIN rejected");
                Err(EngineError::AuthorizationDenied)
            }
        }
    }
}

// =============================================================================
// PIN Hashing
// =============================================================================

/// Hashes a PIN for storage in the employee directory.
pub fn hash_pin(pin: &str) -> EngineResult<String> {
    validate_pin(pin)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(pin.as_bytes(), &salt)
        .map_err(|e| EngineError::Serialization(format!("Failed to hash PIN: {e}")))?;
    Ok(hash.to_string())
}

fn verify_pin(pin: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(pin.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
