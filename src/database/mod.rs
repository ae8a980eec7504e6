pub mod manager;
pub mod record;
pub mod session;
pub mod context;
pub mod query_builder;
pub mod postgres;
pub mod installer;

pub use manager::{DatabaseManager, DatabaseError};
pub use record::{NewRecord, Record};
pub use session::{EnforcementStatus, Session, Storage};
pub use context::{as_service_role, with_user_context};
pub use postgres::{PgSession, PgStorage};
pub use installer::PolicyInstaller;
