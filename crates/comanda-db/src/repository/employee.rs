//! # Employee Repository
//!
//! Read access to the employee directory for the Authorization Gate.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use comanda_core::Employee;

const SELECT_EMPLOYEE: &str =
    "SELECT id, tenant_id, name, role, pin_hash, is_active, created_at FROM employees";

#[derive(Debug, Clone)]
pub struct EmployeeRepository {
    pool: SqlitePool,
}

impl EmployeeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EmployeeRepository { pool }
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Employee>> {
        let employee = sqlx::query_as::<_, Employee>(&format!("{SELECT_EMPLOYEE} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(employee)
    }

    /// Active employees allowed to approve privileged actions.
    pub async fn list_approvers(&self, tenant_id: &str) -> DbResult<Vec<Employee>> {
        let employees = sqlx::query_as::<_, Employee>(&format!(
            "{SELECT_EMPLOYEE} WHERE tenant_id = ? AND is_active = 1 \
             AND role IN ('admin', 'manager') ORDER BY created_at"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(employees)
    }

    pub async fn insert(&self, employee: &Employee) -> DbResult<()> {
        debug!(id = %employee.id, role = ?employee.role, "Inserting employee");

        sqlx::query(
            "INSERT INTO employees (id, tenant_id, name, role, pin_hash, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&employee.id)
        .bind(&employee.tenant_id)
        .bind(&employee.name)
        .bind(employee.role)
        .bind(&employee.pin_hash)
        .bind(employee.is_active)
        .bind(employee.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count(&self, tenant_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM employees WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::repository::test_support::{employee, setup};
    use comanda_core::{Role, DEFAULT_TENANT_ID};

    #[tokio::test]
    async fn test_only_active_managers_are_approvers() {
        let db = setup().await;
        let manager = employee(&db, "Marta", Role::Manager).await;
        employee(&db, "Caio", Role::Cashier).await;
        let admin = employee(&db, "Ana", Role::Admin).await;

        sqlx::query("UPDATE employees SET is_active = 0 WHERE id = ?")
            .bind(&admin.id)
            .execute(db.pool())
            .await
            .unwrap();

        let approvers = db.employees().list_approvers(DEFAULT_TENANT_ID).await.unwrap();
        assert_eq!(approvers.len(), 1);
        assert_eq!(approvers[0].id, manager.id);
        assert_eq!(approvers[0].role, Role::Manager);
        assert_eq!(db.employees().count(DEFAULT_TENANT_ID).await.unwrap(), 3);
    }
}
