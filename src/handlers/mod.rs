//! HTTP surface. Every data route runs inside `with_user_context` for the
//! caller's principal. Two paths reach the service role: admin stats, after
//! the storage engine confirms the caller is an admin, and anonymous
//! submissions of ownerless rows to tables that accept them.

pub mod admin;
pub mod data;
pub mod health;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::database::Storage;
use crate::middleware::principal_middleware;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub jwt_secret: String,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, jwt_secret: impl Into<String>) -> Self {
        Self {
            storage,
            jwt_secret: jwt_secret.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/data/:table", get(data::list).post(data::create))
        .route(
            "/api/data/:table/:id",
            get(data::get).patch(data::update).delete(data::delete),
        )
        .route("/api/find/:table", post(data::find))
        .route("/api/admin/stats", get(admin::stats))
        .route_layer(from_fn_with_state(state.clone(), principal_middleware))
        .route("/health", get(health::health))
        .with_state(state)
}
