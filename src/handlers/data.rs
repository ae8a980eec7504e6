use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::database::{as_service_role, with_user_context, NewRecord, Record};
use crate::error::ApiError;
use crate::filter::FilterData;
use crate::middleware::{ApiResponse, ApiResult, AuthContext};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    /// Defaults to the caller.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    pub data: Value,
}

fn not_found() -> ApiError {
    ApiError::not_found("Record not found")
}

/// GET /api/data/:table - records visible to the caller
pub async fn list(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<ListQuery>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Vec<Record>> {
    let filter = FilterData {
        limit: query.limit,
        offset: query.offset,
        ..Default::default()
    };
    let records = with_user_context(state.storage.as_ref(), auth.user_id(), move |session| {
        Box::pin(async move { session.find_many(&table, filter).await })
    })
    .await?;
    Ok(ApiResponse::success(records))
}

/// POST /api/find/:table - filtered search, same visibility as list
pub async fn find(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(filter): Json<FilterData>,
) -> ApiResult<Vec<Record>> {
    let records = with_user_context(state.storage.as_ref(), auth.user_id(), move |session| {
        Box::pin(async move { session.find_many(&table, filter).await })
    })
    .await?;
    Ok(ApiResponse::success(records))
}

/// POST /api/data/:table
///
/// Anonymous submissions to tables that accept ownerless rows are written
/// through the service role: the row predicate admits no anonymous writer,
/// and the only thing such a request can create is an ownerless row.
pub async fn create(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateBody>,
) -> ApiResult<Record> {
    let policy = state.storage.policies().get(&table).cloned().ok_or_else(not_found)?;
    let owner_id = body.owner_id.or_else(|| auth.user_id().map(str::to_string));

    let created = match owner_id {
        None if auth.principal.is_anonymous() && policy.allows_null_owner() => {
            debug!(table = %table, "anonymous submission");
            let record = NewRecord::anonymous(body.data);
            as_service_role(state.storage.as_ref(), move |session| {
                Box::pin(async move { session.create(&table, record).await })
            })
            .await?
        }
        owner_id => {
            let record = NewRecord {
                owner_id,
                data: body.data,
            };
            with_user_context(state.storage.as_ref(), auth.user_id(), move |session| {
                Box::pin(async move { session.create(&table, record).await })
            })
            .await?
        }
    };

    match created {
        Some(record) => Ok(ApiResponse::created(record)),
        None => Err(ApiError::forbidden("Record rejected by row policy")),
    }
}

/// GET /api/data/:table/:id - 404 whether missing or not the caller's
pub async fn get(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, Uuid)>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Record> {
    let record = with_user_context(state.storage.as_ref(), auth.user_id(), move |session| {
        Box::pin(async move { session.find_unique(&table, id).await })
    })
    .await?;
    record.map(ApiResponse::success).ok_or_else(not_found)
}

/// PATCH /api/data/:table/:id - replace `data`
pub async fn update(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, Uuid)>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<UpdateBody>,
) -> ApiResult<Record> {
    let record = with_user_context(state.storage.as_ref(), auth.user_id(), move |session| {
        Box::pin(async move {
            if session.update(&table, id, body.data).await? == 0 {
                return Ok(None);
            }
            session.find_unique(&table, id).await
        })
    })
    .await?;
    record.map(ApiResponse::success).ok_or_else(not_found)
}

/// DELETE /api/data/:table/:id
pub async fn delete(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, Uuid)>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Value> {
    let deleted = with_user_context(state.storage.as_ref(), auth.user_id(), move |session| {
        Box::pin(async move { session.delete(&table, id).await })
    })
    .await?;
    if deleted == 0 {
        return Err(not_found());
    }
    Ok(ApiResponse::success(json!({ "id": id, "deleted": true })))
}
