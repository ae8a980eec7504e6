use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use crate::auth::validate_jwt;
use crate::error::ApiError;
use crate::handlers::AppState;
use crate::types::Principal;

/// Who is calling, as resolved from the request.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub principal: Principal,
}

impl AuthContext {
    pub fn user_id(&self) -> Option<&str> {
        self.principal.user_id()
    }
}

/// Resolves the caller and injects an [`AuthContext`].
///
/// No Authorization header means the anonymous principal. A header that is
/// present but malformed, or a token that fails validation, is rejected.
pub async fn principal_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = match extract_jwt_from_headers(&headers).map_err(ApiError::unauthorized)? {
        None => AuthContext::default(),
        Some(token) => {
            let claims = validate_jwt(&token, &state.jwt_secret).map_err(|e| ApiError::unauthorized(e.to_string()))?;
            AuthContext {
                principal: Principal::from_user_id(Some(&claims.sub)),
            }
        }
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Extract JWT token from Authorization header
fn extract_jwt_from_headers(headers: &HeaderMap) -> Result<Option<String>, String> {
    let Some(auth_header) = headers.get("authorization") else {
        return Ok(None);
    };

    let auth_str = auth_header
        .to_str()
        .map_err(|_| "Invalid Authorization header format".to_string())?;

    if let Some(token) = auth_str.strip_prefix("Bearer ") {
        if token.trim().is_empty() {
            return Err("Empty JWT token".to_string());
        }
        Ok(Some(token.trim().to_string()))
    } else {
        Err("Authorization header must use Bearer token format".to_string())
    }
}
