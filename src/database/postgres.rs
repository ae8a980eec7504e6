use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::installer::PolicyInstaller;
use super::manager::{DatabaseError, DatabaseManager};
use super::query_builder::QueryBuilder;
use super::record::{NewRecord, Record};
use super::session::{EnforcementStatus, Session, Storage};
use crate::filter::FilterData;
use crate::policy::sql::{CURRENT_USER_SETTING, IS_ADMIN_SQL};
use crate::policy::{PolicyStore, TablePolicy};
use crate::types::Principal;

/// SQLSTATE raised when a row fails a policy's `WITH CHECK`.
const INSUFFICIENT_PRIVILEGE: &str = "42501";

const WRITE_SAVEPOINT: &str = "rowguard_write";

/// Postgres storage: native row-level security on the filtered pool, a
/// dedicated connection per service-role unit of work.
pub struct PgStorage {
    manager: Arc<DatabaseManager>,
    policies: Arc<PolicyStore>,
}

impl PgStorage {
    pub fn new(manager: Arc<DatabaseManager>, policies: Arc<PolicyStore>) -> Self {
        Self { manager, policies }
    }

    pub fn manager(&self) -> &DatabaseManager {
        &self.manager
    }

    async fn installer(&self) -> Result<PolicyInstaller, DatabaseError> {
        let pool = self.manager.service_pool().await?;
        Ok(PolicyInstaller::new(pool, self.policies.clone()))
    }
}

#[async_trait]
impl Storage for PgStorage {
    fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    async fn begin(&self) -> Result<Box<dyn Session>, DatabaseError> {
        let tx = self.manager.pool().begin().await?;
        Ok(Box::new(PgSession::new(tx, self.policies.clone(), None)))
    }

    async fn begin_service(&self) -> Result<Box<dyn Session>, DatabaseError> {
        let pool = self.manager.service_pool().await?;
        let tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                pool.close().await;
                return Err(e.into());
            }
        };
        Ok(Box::new(PgSession::new(tx, self.policies.clone(), Some(pool))))
    }

    async fn set_enforcement(&self, enabled: bool) -> Result<(), DatabaseError> {
        let installer = self.installer().await?;
        let result = installer.set_enforcement(enabled).await;
        installer.close().await;
        result
    }

    async fn enforcement_status(&self) -> Result<Vec<EnforcementStatus>, DatabaseError> {
        let installer = self.installer().await?;
        let result = installer.status().await;
        installer.close().await;
        result
    }

    async fn register_user(&self, user_id: &str, identity: &str) -> Result<(), DatabaseError> {
        let installer = self.installer().await?;
        let result = installer.register_user(user_id, identity).await;
        installer.close().await;
        result
    }
}

/// One transaction on either the filtered pool or a dedicated service pool.
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
    policies: Arc<PolicyStore>,
    /// Present for service-role sessions; closed when the session ends.
    service_pool: Option<PgPool>,
}

impl PgSession {
    fn new(tx: Transaction<'static, Postgres>, policies: Arc<PolicyStore>, service_pool: Option<PgPool>) -> Self {
        Self { tx, policies, service_pool }
    }

    fn policy(&self, table: &str) -> Result<TablePolicy, DatabaseError> {
        self.policies
            .get(table)
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownTable(table.to_string()))
    }

    async fn savepoint(&mut self) -> Result<(), DatabaseError> {
        sqlx::query(&format!("SAVEPOINT {}", WRITE_SAVEPOINT))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Release on success; on a policy rejection roll back to the savepoint
    /// so the transaction stays usable and report `None`.
    async fn settle<T>(&mut self, result: Result<T, DatabaseError>) -> Result<Option<T>, DatabaseError> {
        match result {
            Ok(value) => {
                sqlx::query(&format!("RELEASE SAVEPOINT {}", WRITE_SAVEPOINT))
                    .execute(&mut *self.tx)
                    .await?;
                Ok(Some(value))
            }
            Err(e) => {
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", WRITE_SAVEPOINT))
                    .execute(&mut *self.tx)
                    .await?;
                if is_policy_violation(&e) {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn close_service_pool(pool: Option<PgPool>) {
        if let Some(pool) = pool {
            pool.close().await;
            debug!("closed service-role connection");
        }
    }
}

fn is_policy_violation(err: &DatabaseError) -> bool {
    match err {
        DatabaseError::Sqlx(sqlx::Error::Database(db)) => db.code().as_deref() == Some(INSUFFICIENT_PRIVILEGE),
        _ => false,
    }
}

#[async_trait]
impl Session for PgSession {
    async fn set_user_context(&mut self, user_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(CURRENT_USER_SETTING)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn clear_user_context(&mut self) -> Result<(), DatabaseError> {
        sqlx::query("SELECT set_config($1, '', true)")
            .bind(CURRENT_USER_SETTING)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn current_principal(&mut self) -> Result<Principal, DatabaseError> {
        let value: Option<String> = sqlx::query_scalar("SELECT current_setting($1, true)")
            .bind(CURRENT_USER_SETTING)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(Principal::from_user_id(value.as_deref()))
    }

    async fn is_admin(&mut self) -> Result<bool, DatabaseError> {
        let admin: bool = sqlx::query_scalar(IS_ADMIN_SQL).fetch_one(&mut *self.tx).await?;
        Ok(admin)
    }

    async fn find_many(&mut self, table: &str, filter: FilterData) -> Result<Vec<Record>, DatabaseError> {
        let policy = self.policy(table)?;
        QueryBuilder::new(&policy).select_all(&mut self.tx, filter).await
    }

    async fn find_unique(&mut self, table: &str, id: Uuid) -> Result<Option<Record>, DatabaseError> {
        let policy = self.policy(table)?;
        QueryBuilder::new(&policy).select_by_id(&mut self.tx, id).await
    }

    async fn count(&mut self, table: &str, filter: FilterData) -> Result<i64, DatabaseError> {
        let policy = self.policy(table)?;
        QueryBuilder::new(&policy).count(&mut self.tx, filter).await
    }

    async fn create(&mut self, table: &str, record: NewRecord) -> Result<Option<Record>, DatabaseError> {
        let policy = self.policy(table)?;
        record.validate(&policy).map_err(DatabaseError::InvalidRecord)?;

        self.savepoint().await?;
        let result = QueryBuilder::new(&policy).insert(&mut self.tx, &record).await;
        let settled = self.settle(result).await?;
        if settled.is_none() {
            warn!(table = %policy.table, "insert rejected by row policy");
        }
        Ok(settled)
    }

    async fn update(&mut self, table: &str, id: Uuid, data: Value) -> Result<u64, DatabaseError> {
        let policy = self.policy(table)?;
        self.savepoint().await?;
        let result = QueryBuilder::new(&policy).update(&mut self.tx, id, data).await;
        Ok(self.settle(result).await?.unwrap_or(0))
    }

    async fn delete(&mut self, table: &str, id: Uuid) -> Result<u64, DatabaseError> {
        let policy = self.policy(table)?;
        QueryBuilder::new(&policy).delete(&mut self.tx, id).await
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgSession { tx, service_pool, .. } = *self;
        let result = tx.commit().await;
        Self::close_service_pool(service_pool).await;
        result.map_err(DatabaseError::from)
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgSession { tx, service_pool, .. } = *self;
        let result = tx.rollback().await;
        Self::close_service_pool(service_pool).await;
        result.map_err(DatabaseError::from)
    }
}
