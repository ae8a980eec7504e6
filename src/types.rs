/// Shared types used across the codebase

use serde::{Deserialize, Serialize};
use std::fmt;

/// The identity bound to a unit of work.
///
/// `Anonymous` matches no owner. An `Authenticated` id is opaque data: it is
/// only ever compared against owner columns or bound as a query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum Principal {
    Anonymous,
    Authenticated(String),
}

impl Principal {
    /// Build a principal from an optional user id. Empty ids are anonymous.
    pub fn from_user_id(user_id: Option<&str>) -> Self {
        match user_id {
            Some(id) if !id.is_empty() => Principal::Authenticated(id.to_string()),
            _ => Principal::Anonymous,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Principal::Anonymous => None,
            Principal::Authenticated(id) => Some(id),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }
}

impl Default for Principal {
    fn default() -> Self {
        Principal::Anonymous
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Anonymous => write!(f, "anonymous"),
            Principal::Authenticated(id) => write!(f, "user:{}", id),
        }
    }
}
