use axum::extract::{Extension, State};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::AppState;
use crate::database::{as_service_role, with_user_context, DatabaseError, EnforcementStatus};
use crate::error::ApiError;
use crate::filter::FilterData;
use crate::middleware::{ApiResponse, ApiResult, AuthContext};

#[derive(Debug, Serialize)]
pub struct Stats {
    /// Total rows per protected table, unfiltered.
    pub rows: BTreeMap<String, i64>,
    pub enforcement: Vec<EnforcementStatus>,
}

/// GET /api/admin/stats
///
/// The admin check runs here, before the service role is touched. It asks
/// the storage engine, so the gate and the row policies share one predicate.
pub async fn stats(State(state): State<AppState>, Extension(auth): Extension<AuthContext>) -> ApiResult<Stats> {
    let is_admin = with_user_context(state.storage.as_ref(), auth.user_id(), |session| {
        Box::pin(async move { session.is_admin().await })
    })
    .await?;
    if !is_admin {
        warn!("non-admin caller denied admin stats");
        return Err(ApiError::forbidden("Admin access required"));
    }

    let tables: Vec<String> = state.storage.policies().tables().iter().map(|p| p.table.clone()).collect();
    let rows = as_service_role(state.storage.as_ref(), move |session| {
        Box::pin(async move {
            let mut rows = BTreeMap::new();
            for table in tables {
                let count = session.count(&table, FilterData::default()).await?;
                rows.insert(table, count);
            }
            Ok::<_, DatabaseError>(rows)
        })
    })
    .await?;
    let enforcement = state.storage.enforcement_status().await?;

    info!("admin stats served");
    Ok(ApiResponse::success(Stats { rows, enforcement }))
}
