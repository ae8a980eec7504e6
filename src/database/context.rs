//! Scoped execution: bind a principal (or the service role) to exactly one
//! unit of work.
//!
//! The principal is set transaction-locally, the transaction always ends in
//! commit or rollback, and the connection is reset when it goes back to the
//! pool. Nothing an operation does can leave a principal behind for the next
//! borrower.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::manager::DatabaseError;
use super::session::{Session, Storage};
use crate::types::Principal;

/// Run `operation` with `user_id` bound as the principal.
///
/// `None` runs as the anonymous principal, which sees no protected rows.
/// The transaction commits when `operation` returns `Ok` and rolls back
/// otherwise; the operation's error is returned unchanged.
pub async fn with_user_context<T, F>(
    storage: &dyn Storage,
    user_id: Option<&str>,
    operation: F,
) -> Result<T, DatabaseError>
where
    T: Send,
    F: for<'s> FnOnce(&'s mut dyn Session) -> BoxFuture<'s, Result<T, DatabaseError>> + Send,
{
    let principal = Principal::from_user_id(user_id);
    let mut session = storage.begin().await?;

    match &principal {
        Principal::Authenticated(id) => session.set_user_context(id).await?,
        Principal::Anonymous => session.clear_user_context().await?,
    }
    debug!(principal = %principal, "bound principal to unit of work");

    let result = operation(session.as_mut()).await;
    finish(session, result).await
}

/// Run `operation` on a dedicated service-role connection that bypasses
/// every row predicate.
///
/// Performs no authorization of its own: callers reachable from a request
/// must have checked the caller is an application admin first.
pub async fn as_service_role<T, F>(storage: &dyn Storage, operation: F) -> Result<T, DatabaseError>
where
    T: Send,
    F: for<'s> FnOnce(&'s mut dyn Session) -> BoxFuture<'s, Result<T, DatabaseError>> + Send,
{
    let mut session = storage.begin_service().await?;
    debug!("opened service-role unit of work");

    let result = operation(session.as_mut()).await;
    finish(session, result).await
}

async fn finish<T>(session: Box<dyn Session>, result: Result<T, DatabaseError>) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = session.rollback().await {
                warn!("Rollback after failed operation also failed: {}", rollback_err);
            }
            Err(e)
        }
    }
}
