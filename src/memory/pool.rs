use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::database::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Subject to row policies.
    Filtered,
    /// Bypasses row policies. Never pooled.
    Service,
}

/// A simulated server connection: an id and its session-level settings.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    role: ConnectionRole,
    settings: HashMap<String, String>,
}

impl MemoryConnection {
    fn new(id: u64, role: ConnectionRole) -> Self {
        Self {
            id,
            role,
            settings: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.settings.insert(name.to_string(), value.to_string());
    }

    fn reset(&mut self) {
        self.settings.clear();
    }
}

/// Bounded pool of filtered connections.
///
/// Connections are reset before they become idle again, so a borrower only
/// ever sees settings it made itself.
#[derive(Debug)]
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<MemoryConnection>>,
    next_id: AtomicU64,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_connections: u32, acquire_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_connections.max(1) as usize)),
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            acquire_timeout,
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, DatabaseError> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| DatabaseError::Sqlx(sqlx::Error::PoolTimedOut))?
            .map_err(|_| DatabaseError::Sqlx(sqlx::Error::PoolClosed))?;

        let reused = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = MemoryConnection::new(self.next_id(), ConnectionRole::Filtered);
                debug!(connection = conn.id, "opened pooled connection");
                conn
            }
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Some(self.clone()),
            _permit: Some(permit),
        })
    }

    /// A fresh connection outside the pool, closed when dropped.
    pub fn open_service(&self) -> PooledConnection {
        let conn = MemoryConnection::new(self.next_id(), ConnectionRole::Service);
        debug!(connection = conn.id, "opened service-role connection");
        PooledConnection {
            conn: Some(conn),
            pool: None,
            _permit: None,
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn release(&self, mut conn: MemoryConnection) {
        conn.reset();
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(conn);
    }
}

/// A checked-out connection. Pooled ones go back reset; service ones close.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<MemoryConnection>,
    pool: Option<Arc<ConnectionPool>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, MemoryConnection::id)
    }

    pub fn role(&self) -> ConnectionRole {
        self.conn.as_ref().map_or(ConnectionRole::Filtered, MemoryConnection::role)
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.conn.as_ref().and_then(|c| c.setting(name))
    }

    pub fn set(&mut self, name: &str, value: &str) {
        if let Some(conn) = self.conn.as_mut() {
            conn.set(name, value);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        match &self.pool {
            Some(pool) => pool.release(conn),
            None => debug!(connection = conn.id, "closed service-role connection"),
        }
    }
}
