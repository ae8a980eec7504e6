pub mod auth;
pub mod response;

pub use auth::{principal_middleware, AuthContext};
pub use response::{ApiResponse, ApiResult};
