use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tracing::{debug, warn};
use uuid::Uuid;

use super::pool::{ConnectionRole, PooledConnection};
use super::store::{MemoryTable, StoreInner};
use crate::database::record::{object_or_empty, record_columns};
use crate::database::{DatabaseError, NewRecord, Record, Session};
use crate::filter::{Filter, FilterData};
use crate::policy::sql::CURRENT_USER_SETTING;
use crate::policy::TablePolicy;
use crate::types::Principal;

#[derive(Debug)]
enum Undo {
    Inserted { table: String, id: Uuid },
    Updated { table: String, previous: Record },
    Deleted { table: String, index: usize, record: Record },
}

enum RowWrite<T> {
    Done(T),
    Missing,
    /// Another open transaction holds the row.
    Blocked,
}

async fn wait_for_release(released: Notified<'_>, timeout: Duration) -> Result<(), DatabaseError> {
    tokio::time::timeout(timeout, released)
        .await
        .map_err(|_| DatabaseError::QueryError("timed out waiting for a row held by another transaction".to_string()))
}

/// One transaction on one memory connection.
///
/// Transaction-local settings live here and vanish when the session ends;
/// session-level settings live on the connection until the pool resets it.
/// Dropping an unfinished session rolls it back. Rows it writes stay locked
/// against other writers until it ends.
pub struct MemorySession {
    store: Arc<StoreInner>,
    conn: PooledConnection,
    id: u64,
    local_settings: HashMap<String, String>,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemorySession {
    pub(crate) fn new(store: Arc<StoreInner>, conn: PooledConnection) -> Self {
        Self {
            id: store.next_session_id(),
            store,
            conn,
            local_settings: HashMap::new(),
            undo: Vec::new(),
            finished: false,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    pub fn is_service(&self) -> bool {
        self.conn.role() == ConnectionRole::Service
    }

    /// `set_config(name, value, is_local)`: transaction-local when `is_local`,
    /// otherwise stored on the connection for the rest of the borrow.
    pub fn set_config(&mut self, name: &str, value: &str, is_local: bool) {
        if is_local {
            self.local_settings.insert(name.to_string(), value.to_string());
        } else {
            self.conn.set(name, value);
        }
    }

    /// `current_setting(name, true)`
    pub fn current_setting(&self, name: &str) -> Option<&str> {
        self.local_settings
            .get(name)
            .map(String::as_str)
            .or_else(|| self.conn.setting(name))
    }

    fn principal(&self) -> Principal {
        Principal::from_user_id(self.current_setting(CURRENT_USER_SETTING))
    }

    fn principal_is_admin(&self, principal: &Principal) -> bool {
        principal.user_id().map_or(false, |id| self.store.is_admin(id))
    }

    fn policy(&self, table: &str) -> Result<TablePolicy, DatabaseError> {
        self.store
            .policies
            .get(table)
            .cloned()
            .ok_or_else(|| DatabaseError::UnknownTable(table.to_string()))
    }

    fn filter(&self, policy: &TablePolicy, filter_data: FilterData) -> Result<Filter, DatabaseError> {
        let mut filter = Filter::new(&policy.table, record_columns(policy))?;
        filter.assign(filter_data)?;
        Ok(filter)
    }

    /// The row predicate as this session sees it. Resolved once per
    /// statement so a statement observes a single principal.
    fn guard(&self, policy: &TablePolicy) -> RowGuard {
        let principal = self.principal();
        let admin = self.principal_is_admin(&principal);
        RowGuard {
            policy: policy.clone(),
            principal,
            admin,
            bypass: self.is_service(),
        }
    }

    fn visible_rows(&self, policy: &TablePolicy) -> Vec<Record> {
        let guard = self.guard(policy);
        let tables = self.store.tables();
        tables
            .get(&policy.table)
            .map(|t| t.rows.iter().filter(|r| guard.admits(t, r)).cloned().collect())
            .unwrap_or_default()
    }

    fn undo_all(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        let mut tables = self.store.tables_mut();
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Inserted { table, id } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.rows.retain(|r| r.id != id);
                    }
                }
                Undo::Updated { table, previous } => {
                    if let Some(row) = tables
                        .get_mut(&table)
                        .and_then(|t| t.rows.iter_mut().find(|r| r.id == previous.id))
                    {
                        *row = previous;
                    }
                }
                Undo::Deleted { table, index, record } => {
                    if let Some(t) = tables.get_mut(&table) {
                        let index = index.min(t.rows.len());
                        t.rows.insert(index, record);
                    }
                }
            }
        }
    }

    fn release_rows(&self) {
        let mut tables = self.store.tables_mut();
        for t in tables.values_mut() {
            t.locks.retain(|_, holder| *holder != self.id);
        }
        drop(tables);
        self.store.released.notify_waiters();
    }

    fn end(&mut self, commit: bool) {
        let held = !self.undo.is_empty();
        if !commit {
            self.undo_all();
        }
        self.undo.clear();
        if held {
            self.release_rows();
        }
        self.local_settings.clear();
        self.finished = true;
    }
}

struct RowGuard {
    policy: TablePolicy,
    principal: Principal,
    admin: bool,
    bypass: bool,
}

impl RowGuard {
    fn admits(&self, table: &MemoryTable, record: &Record) -> bool {
        self.admits_row(table.enforced, record)
    }

    fn admits_row(&self, enforced: bool, record: &Record) -> bool {
        self.bypass || !enforced || self.policy.visible(record.owner_id.as_deref(), &self.principal, self.admin)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn set_user_context(&mut self, user_id: &str) -> Result<(), DatabaseError> {
        self.set_config(CURRENT_USER_SETTING, user_id, true);
        Ok(())
    }

    async fn clear_user_context(&mut self) -> Result<(), DatabaseError> {
        self.set_config(CURRENT_USER_SETTING, "", true);
        Ok(())
    }

    async fn current_principal(&mut self) -> Result<Principal, DatabaseError> {
        Ok(self.principal())
    }

    async fn is_admin(&mut self) -> Result<bool, DatabaseError> {
        Ok(self.principal_is_admin(&self.principal()))
    }

    async fn find_many(&mut self, table: &str, filter: FilterData) -> Result<Vec<Record>, DatabaseError> {
        let policy = self.policy(table)?;
        let filter = self.filter(&policy, filter)?;
        let rows = self
            .visible_rows(&policy)
            .into_iter()
            .map(|r| (r.to_row(&policy), r))
            .collect();
        Ok(filter.apply(rows))
    }

    async fn find_unique(&mut self, table: &str, id: Uuid) -> Result<Option<Record>, DatabaseError> {
        let policy = self.policy(table)?;
        Ok(self.visible_rows(&policy).into_iter().find(|r| r.id == id))
    }

    async fn count(&mut self, table: &str, filter: FilterData) -> Result<i64, DatabaseError> {
        let policy = self.policy(table)?;
        let filter = self.filter(
            &policy,
            FilterData {
                where_clause: filter.where_clause,
                ..Default::default()
            },
        )?;
        let count = self
            .visible_rows(&policy)
            .iter()
            .filter(|r| filter.matches(&r.to_row(&policy)))
            .count();
        Ok(count as i64)
    }

    async fn create(&mut self, table: &str, record: NewRecord) -> Result<Option<Record>, DatabaseError> {
        let policy = self.policy(table)?;
        record.validate(&policy).map_err(DatabaseError::InvalidRecord)?;
        let guard = self.guard(&policy);
        let row = Record::new(record.owner_id.clone(), record.data_or_empty());

        let mut tables = self.store.tables_mut();
        let t = tables.entry(policy.table.clone()).or_default();
        if !guard.admits(t, &row) {
            warn!(table = %policy.table, "insert rejected by row policy");
            return Ok(None);
        }
        t.rows.push(row.clone());
        t.locks.insert(row.id, self.id);
        drop(tables);

        self.undo.push(Undo::Inserted {
            table: policy.table,
            id: row.id,
        });
        Ok(Some(row))
    }

    async fn update(&mut self, table: &str, id: Uuid, data: Value) -> Result<u64, DatabaseError> {
        let policy = self.policy(table)?;
        let guard = self.guard(&policy);
        let mut data = object_or_empty(data);
        let store = self.store.clone();

        loop {
            let released = store.released.notified();
            let outcome = {
                let mut tables = store.tables_mut();
                let Some(t) = tables.get_mut(&policy.table) else { return Ok(0) };
                // Check and write under one lock: no window between predicate and mutation
                let enforced = t.enforced;
                match t.rows.iter().position(|r| r.id == id && guard.admits_row(enforced, r)) {
                    None => RowWrite::Missing,
                    Some(_) if t.locked_by_other(id, self.id) => RowWrite::Blocked,
                    Some(index) => {
                        let row = &mut t.rows[index];
                        let previous = row.clone();
                        row.data = std::mem::take(&mut data);
                        row.updated_at = Utc::now().trunc_subsecs(6);
                        t.locks.insert(id, self.id);
                        RowWrite::Done(previous)
                    }
                }
            };

            match outcome {
                RowWrite::Missing => return Ok(0),
                RowWrite::Blocked => wait_for_release(released, store.lock_timeout).await?,
                RowWrite::Done(previous) => {
                    self.undo.push(Undo::Updated {
                        table: policy.table,
                        previous,
                    });
                    return Ok(1);
                }
            }
        }
    }

    async fn delete(&mut self, table: &str, id: Uuid) -> Result<u64, DatabaseError> {
        let policy = self.policy(table)?;
        let guard = self.guard(&policy);
        let store = self.store.clone();

        loop {
            let released = store.released.notified();
            let outcome = {
                let mut tables = store.tables_mut();
                let Some(t) = tables.get_mut(&policy.table) else { return Ok(0) };
                let enforced = t.enforced;
                match t.rows.iter().position(|r| r.id == id && guard.admits_row(enforced, r)) {
                    None => RowWrite::Missing,
                    Some(_) if t.locked_by_other(id, self.id) => RowWrite::Blocked,
                    Some(index) => {
                        t.locks.insert(id, self.id);
                        RowWrite::Done((index, t.rows.remove(index)))
                    }
                }
            };

            match outcome {
                RowWrite::Missing => return Ok(0),
                RowWrite::Blocked => wait_for_release(released, store.lock_timeout).await?,
                RowWrite::Done((index, record)) => {
                    self.undo.push(Undo::Deleted {
                        table: policy.table,
                        index,
                        record,
                    });
                    return Ok(1);
                }
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let mut session = self;
        session.end(true);
        debug!(connection = session.conn.id(), "committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let mut session = self;
        session.end(false);
        debug!(connection = session.conn.id(), "rolled back");
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.finished {
            self.end(false);
        }
    }
}
