use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use super::manager::DatabaseError;
use super::session::EnforcementStatus;
use crate::admin::AdminSet;
use crate::policy::sql::{
    create_table_sql, grant_sql, helper_statements, install_statements, policy_name, toggle_sql, ADMIN_IDENTITIES_TABLE,
    ENFORCEMENT_STATUS_SQL, POLICY_EXISTS_SQL,
};
use crate::policy::PolicyStore;

/// Schema-side management of the policy store. Runs on a service-role
/// connection, which must own the protected tables.
pub struct PolicyInstaller {
    pool: PgPool,
    policies: Arc<PolicyStore>,
}

impl PolicyInstaller {
    pub fn new(pool: PgPool, policies: Arc<PolicyStore>) -> Self {
        Self { pool, policies }
    }

    /// Create helper functions and tables, attach every policy, then apply
    /// the enforcement flag. Idempotent.
    pub async fn install(&self, enabled: bool) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        for statement in helper_statements() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        for policy in self.policies.tables() {
            sqlx::query(&create_table_sql(policy)).execute(&mut *tx).await?;
            for statement in install_statements(policy) {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }
            if !enabled {
                sqlx::query(&toggle_sql(policy, false)).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        info!(
            "Installed row policies on {} tables (enforcement {})",
            self.policies.tables().len(),
            if enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Let the filtered application role reach the protected tables.
    pub async fn grant(&self, role: &str) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        for policy in self.policies.tables() {
            sqlx::query(&grant_sql(policy, role)).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("Granted table access to the application role");
        Ok(())
    }

    /// Flip enforcement on every protected table in one transaction.
    /// Policies stay in the catalog, so re-enabling restores them exactly.
    pub async fn set_enforcement(&self, enabled: bool) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        for policy in self.policies.tables() {
            sqlx::query(&toggle_sql(policy, enabled)).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("Row-level enforcement {}", if enabled { "enabled" } else { "DISABLED" });
        Ok(())
    }

    pub async fn status(&self) -> Result<Vec<EnforcementStatus>, DatabaseError> {
        let mut out = Vec::with_capacity(self.policies.tables().len());
        for policy in self.policies.tables() {
            let enabled: Option<bool> = sqlx::query_scalar(ENFORCEMENT_STATUS_SQL)
                .bind(&policy.table)
                .fetch_optional(&self.pool)
                .await?;
            let policy_installed: bool = sqlx::query_scalar(POLICY_EXISTS_SQL)
                .bind(&policy.table)
                .bind(policy_name(policy))
                .fetch_one(&self.pool)
                .await?;
            out.push(EnforcementStatus {
                table: policy.table.clone(),
                enabled: enabled.unwrap_or(false),
                policy_installed,
            });
        }
        Ok(out)
    }

    /// Replace the database copy of the admin set with `admins`.
    ///
    /// The database predicate reads only this table, so after a sync both
    /// enforcement points agree on who is an admin.
    pub async fn sync_admin_identities(&self, admins: &AdminSet) -> Result<usize, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {}", ADMIN_IDENTITIES_TABLE))
            .execute(&mut *tx)
            .await?;
        let insert = format!("INSERT INTO {} (identity) VALUES ($1)", ADMIN_IDENTITIES_TABLE);
        let mut count = 0;
        for identity in admins.identities() {
            sqlx::query(&insert).bind(identity).execute(&mut *tx).await?;
            count += 1;
        }
        tx.commit().await?;
        info!("Synced {} admin identities", count);
        Ok(count)
    }

    pub async fn register_user(&self, user_id: &str, identity: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO users (id, email) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email",
        )
        .bind(user_id)
        .bind(identity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
