use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use super::pool::ConnectionPool;
use super::session::MemorySession;
use crate::admin::AdminSet;
use crate::config::AppConfig;
use crate::database::{DatabaseError, EnforcementStatus, Record, Session, Storage};
use crate::policy::PolicyStore;

#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub max_connections: u32,
    /// Bounds both waiting for a connection and waiting for a row another
    /// transaction is writing.
    pub acquire_timeout: Duration,
    /// Initial enforcement flag for every table.
    pub enforcement: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            enforcement: true,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryTable {
    pub(crate) enforced: bool,
    pub(crate) rows: Vec<Record>,
    /// Row id -> session holding uncommitted writes to it.
    pub(crate) locks: HashMap<Uuid, u64>,
}

impl MemoryTable {
    pub(crate) fn locked_by_other(&self, id: Uuid, session: u64) -> bool {
        self.locks.get(&id).map_or(false, |holder| *holder != session)
    }
}

#[derive(Debug)]
pub(crate) struct StoreInner {
    pub(crate) policies: Arc<PolicyStore>,
    pub(crate) admins: Arc<AdminSet>,
    pub(crate) tables: RwLock<HashMap<String, MemoryTable>>,
    /// Principal id -> identity, the directory `is_admin` resolves through.
    pub(crate) users: RwLock<HashMap<String, String>>,
    pub(crate) pool: Arc<ConnectionPool>,
    /// Signalled whenever a session ends and gives up its row locks.
    pub(crate) released: Notify,
    pub(crate) lock_timeout: Duration,
    next_session: AtomicU64,
}

impl StoreInner {
    pub(crate) fn tables(&self) -> RwLockReadGuard<'_, HashMap<String, MemoryTable>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tables_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, MemoryTable>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_admin(&self, user_id: &str) -> bool {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.get(user_id).map_or(false, |identity| self.admins.contains(identity))
    }
}

/// In-process storage engine with native row security.
///
/// Mirrors the Postgres deployment: one pool of filtered connections whose
/// settings are reset on release, per-table enforcement that can be toggled
/// without touching rows, and dedicated service connections that skip every
/// predicate. Uncommitted writes are visible to other sessions, but a row
/// written by an open transaction blocks other writers until it ends;
/// rollback undoes them.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new(policies: PolicyStore, admins: AdminSet) -> Self {
        Self::with_options(policies, admins, MemoryOptions::default())
    }

    pub fn with_options(policies: PolicyStore, admins: AdminSet, options: MemoryOptions) -> Self {
        let tables = policies
            .tables()
            .iter()
            .map(|p| {
                (
                    p.table.clone(),
                    MemoryTable {
                        enforced: options.enforcement,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let pool = ConnectionPool::new(options.max_connections, options.acquire_timeout);
        info!(
            "Memory store ready: {} tables, {} admin identities, max {} connections",
            policies.tables().len(),
            admins.len(),
            options.max_connections
        );
        Self {
            inner: Arc::new(StoreInner {
                policies: Arc::new(policies),
                admins: Arc::new(admins),
                tables: RwLock::new(tables),
                users: RwLock::new(HashMap::new()),
                pool,
                released: Notify::new(),
                lock_timeout: options.acquire_timeout,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Sized and flagged from application configuration.
    pub fn from_config(config: &AppConfig, policies: PolicyStore) -> Self {
        let options = MemoryOptions {
            max_connections: config.database.max_connections,
            acquire_timeout: Duration::from_secs(config.database.connection_timeout),
            enforcement: config.rls.enabled,
        };
        Self::with_options(policies, config.rls.admins.clone(), options)
    }

    pub fn admins(&self) -> &AdminSet {
        &self.inner.admins
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Like [`Storage::begin`] but keeps the concrete type, which exposes
    /// raw settings and the connection id.
    pub async fn begin_memory(&self) -> Result<MemorySession, DatabaseError> {
        let conn = self.inner.pool.acquire().await?;
        Ok(MemorySession::new(self.inner.clone(), conn))
    }

    pub fn begin_memory_service(&self) -> MemorySession {
        MemorySession::new(self.inner.clone(), self.inner.pool.open_service())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    fn policies(&self) -> &PolicyStore {
        &self.inner.policies
    }

    async fn begin(&self) -> Result<Box<dyn Session>, DatabaseError> {
        Ok(Box::new(self.begin_memory().await?))
    }

    async fn begin_service(&self) -> Result<Box<dyn Session>, DatabaseError> {
        Ok(Box::new(self.begin_memory_service()))
    }

    async fn set_enforcement(&self, enabled: bool) -> Result<(), DatabaseError> {
        let mut tables = self.inner.tables_mut();
        for table in tables.values_mut() {
            table.enforced = enabled;
        }
        info!("Row-level enforcement {}", if enabled { "enabled" } else { "DISABLED" });
        Ok(())
    }

    async fn enforcement_status(&self) -> Result<Vec<EnforcementStatus>, DatabaseError> {
        let tables = self.inner.tables();
        Ok(self
            .inner
            .policies
            .tables()
            .iter()
            .map(|p| EnforcementStatus {
                table: p.table.clone(),
                enabled: tables.get(&p.table).map_or(false, |t| t.enforced),
                policy_installed: true,
            })
            .collect())
    }

    async fn register_user(&self, user_id: &str, identity: &str) -> Result<(), DatabaseError> {
        self.inner
            .users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), identity.to_string());
        Ok(())
    }
}
