//! In-process storage engine with native row security.

pub mod pool;
pub mod session;
pub mod store;

pub use pool::{ConnectionPool, ConnectionRole, PooledConnection};
pub use session::MemorySession;
pub use store::{MemoryOptions, MemoryStore};
