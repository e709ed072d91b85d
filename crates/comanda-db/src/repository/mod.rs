//! # Repository Module
//!
//! Ledger store repositories.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  comanda-engine service                                                 │
//! │       │                                                                 │
//! │       │  db.sales().complete_sale(write, opts)                          │
//! │       ▼                                                                 │
//! │  SaleRepository                                                         │
//! │  ├── guarded UPDATE ... WHERE status = 'open'                           │
//! │  ├── stock::record_movement(tx, ...)    (shared helper, same tx)        │
//! │  └── fiscal::enqueue(tx, ...)           (shared helper, same tx)        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`ProductRepository`](product::ProductRepository) - Catalog lookups
//! - [`EmployeeRepository`](employee::EmployeeRepository) - Directory and approvers
//! - [`SaleRepository`](sale::SaleRepository) - Sales, items, payments, production
//! - [`SessionRepository`](session::SessionRepository) - Cash sessions and movements
//! - [`StockRepository`](stock::StockRepository) - Append-only stock ledger
//! - [`FiscalOutboxRepository`](fiscal::FiscalOutboxRepository) - Post-completion emission queue

pub mod employee;
pub mod fiscal;
pub mod product;
pub mod sale;
pub mod session;
pub mod stock;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use comanda_core::{
        CashierSession, Destination, Employee, Product, Role, SessionKind, SessionStatus,
        DEFAULT_TENANT_ID,
    };
    use uuid::Uuid;

    use crate::{Database, DbConfig};

    pub async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    pub async fn employee(db: &Database, name: &str, role: Role) -> Employee {
        let employee = Employee {
            id: Uuid::new_v4().to_string(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            name: name.to_string(),
            role,
            pin_hash: "unused".to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        db.employees().insert(&employee).await.unwrap();
        employee
    }

    pub fn new_session(employee_id: &str, initial_cents: i64) -> CashierSession {
        CashierSession {
            id: Uuid::new_v4().to_string(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            employee_id: employee_id.to_string(),
            kind: SessionKind::Counter,
            status: SessionStatus::Open,
            initial_balance_cents: initial_cents,
            opened_at: Utc::now(),
            closed_at: None,
            final_balance_cents: None,
            system_balance_cents: None,
            difference_cents: None,
            closing_data: None,
            notes: None,
        }
    }

    /// Opens a 100.00 float session for a fresh cashier.
    pub async fn open_session(db: &Database) -> CashierSession {
        let cashier = employee(db, "Caio", Role::Cashier).await;
        let session = new_session(&cashier.id, 10_000);
        db.sessions().open(&session).await.unwrap();
        session
    }

    pub async fn product(
        db: &Database,
        sku: &str,
        price_cents: i64,
        stock: Option<i64>,
        destination: Option<Destination>,
    ) -> Product {
        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4().to_string(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            sku: sku.to_string(),
            name: sku.to_string(),
            price_cents,
            track_stock: stock.is_some(),
            current_stock: stock.unwrap_or(0),
            destination,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        db.products().insert(&product).await.unwrap();
        product
    }
}
