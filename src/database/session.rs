use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::manager::DatabaseError;
use super::record::{NewRecord, Record};
use crate::filter::FilterData;
use crate::policy::PolicyStore;
use crate::types::Principal;

/// One unit of work on one connection, always inside a transaction.
///
/// Every read and write goes through the table's row predicate unless the
/// session was opened with [`Storage::begin_service`]. Rows the predicate
/// excludes are indistinguishable from rows that do not exist.
#[async_trait]
pub trait Session: Send {
    /// Bind a principal for the rest of this transaction. The id is bound as
    /// a parameter, never interpolated.
    async fn set_user_context(&mut self, user_id: &str) -> Result<(), DatabaseError>;

    /// Reset to the anonymous principal. Idempotent.
    async fn clear_user_context(&mut self) -> Result<(), DatabaseError>;

    /// Principal as the storage engine currently sees it.
    async fn current_principal(&mut self) -> Result<Principal, DatabaseError>;

    /// The admin predicate for the bound principal, evaluated by the engine
    /// exactly as its row policies evaluate it. Anonymous is never an admin.
    async fn is_admin(&mut self) -> Result<bool, DatabaseError>;

    async fn find_many(&mut self, table: &str, filter: FilterData) -> Result<Vec<Record>, DatabaseError>;

    async fn find_unique(&mut self, table: &str, id: Uuid) -> Result<Option<Record>, DatabaseError>;

    /// Ignores `limit`, `offset` and `order`.
    async fn count(&mut self, table: &str, filter: FilterData) -> Result<i64, DatabaseError>;

    /// `Ok(None)` when the row predicate rejects the new row.
    async fn create(&mut self, table: &str, record: NewRecord) -> Result<Option<Record>, DatabaseError>;

    /// Replace `data`; returns affected rows (0 on authorization miss).
    async fn update(&mut self, table: &str, id: Uuid, data: Value) -> Result<u64, DatabaseError>;

    async fn delete(&mut self, table: &str, id: Uuid) -> Result<u64, DatabaseError>;

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementStatus {
    pub table: String,
    pub enabled: bool,
    pub policy_installed: bool,
}

/// A storage engine with row-level enforcement and a service-role bypass.
#[async_trait]
pub trait Storage: Send + Sync {
    fn policies(&self) -> &PolicyStore;

    /// Pooled, filtered unit of work starting as the anonymous principal.
    async fn begin(&self) -> Result<Box<dyn Session>, DatabaseError>;

    /// Dedicated, never-pooled connection that no row predicate applies to.
    async fn begin_service(&self) -> Result<Box<dyn Session>, DatabaseError>;

    /// Emergency rollback toggle. Never touches rows or policy definitions.
    async fn set_enforcement(&self, enabled: bool) -> Result<(), DatabaseError>;

    async fn enforcement_status(&self) -> Result<Vec<EnforcementStatus>, DatabaseError>;

    /// Bring every protected table to `enabled`. Returns whether anything
    /// had to change.
    async fn reconcile_enforcement(&self, enabled: bool) -> Result<bool, DatabaseError> {
        let status = self.enforcement_status().await?;
        if status.iter().all(|s| s.enabled == enabled) {
            return Ok(false);
        }
        self.set_enforcement(enabled).await?;
        Ok(true)
    }

    /// Feed the identity directory the admin predicate resolves principals through.
    async fn register_user(&self, user_id: &str, identity: &str) -> Result<(), DatabaseError>;
}
