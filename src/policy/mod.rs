//! Per-table authorization predicates.
//!
//! [`PolicyStore`] is the registry of protected tables. Both storage engines
//! consult it: the memory engine evaluates [`TablePolicy::visible`] directly,
//! and Postgres receives the same predicate rendered by [`sql`].

pub mod sql;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::is_identifier;
use crate::types::Principal;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Table registered twice: {0}")]
    DuplicateTable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Every row has an owner; owner or admin may touch it.
    Owned,
    /// Rows may have a null owner; those are visible to admins only.
    AnonymousAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePolicy {
    pub table: String,
    pub owner_column: String,
    pub kind: PolicyKind,
}

impl TablePolicy {
    pub fn owned(table: impl Into<String>, owner_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            owner_column: owner_column.into(),
            kind: PolicyKind::Owned,
        }
    }

    pub fn anonymous_allowed(table: impl Into<String>, owner_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            owner_column: owner_column.into(),
            kind: PolicyKind::AnonymousAllowed,
        }
    }

    pub fn allows_null_owner(&self) -> bool {
        matches!(self.kind, PolicyKind::AnonymousAllowed)
    }

    /// The row predicate, identical for select, insert, update and delete.
    ///
    /// `principal_is_admin` must come from [`crate::admin::AdminSet`]; the
    /// anonymous principal is never an admin.
    pub fn visible(&self, owner: Option<&str>, principal: &Principal, principal_is_admin: bool) -> bool {
        let admin = principal_is_admin && !principal.is_anonymous();
        let owns = match (owner, principal.user_id()) {
            (Some(owner), Some(user_id)) => !owner.is_empty() && owner == user_id,
            _ => false,
        };
        match self.kind {
            PolicyKind::Owned => owns || admin,
            PolicyKind::AnonymousAllowed => (owner.is_some() && owns) || admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStore {
    tables: Vec<TablePolicy>,
}

impl PolicyStore {
    pub fn new(tables: Vec<TablePolicy>) -> Result<Self, PolicyError> {
        let mut seen: Vec<&str> = Vec::new();
        for policy in &tables {
            if !is_identifier(&policy.table) {
                return Err(PolicyError::InvalidIdentifier(policy.table.clone()));
            }
            if !is_identifier(&policy.owner_column) || is_reserved_column(&policy.owner_column) {
                return Err(PolicyError::InvalidIdentifier(policy.owner_column.clone()));
            }
            if seen.contains(&policy.table.as_str()) {
                return Err(PolicyError::DuplicateTable(policy.table.clone()));
            }
            seen.push(&policy.table);
        }
        Ok(Self { tables })
    }

    /// Protected tables of the reminders application.
    pub fn reminders_app() -> Self {
        Self {
            tables: vec![
                TablePolicy::owned("reminders", "user_id"),
                TablePolicy::owned("linked_accounts", "user_id"),
                TablePolicy::owned("sessions", "user_id"),
                TablePolicy::owned("friend_invitations", "inviter_id"),
                TablePolicy::anonymous_allowed("feedback", "user_id"),
                TablePolicy::anonymous_allowed("flow_responses", "user_id"),
            ],
        }
    }

    pub fn get(&self, table: &str) -> Option<&TablePolicy> {
        self.tables.iter().find(|p| p.table == table)
    }

    pub fn tables(&self) -> &[TablePolicy] {
        &self.tables
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::reminders_app()
    }
}

/// Columns every protected table carries besides the owner column.
pub const RECORD_COLUMNS: [&str; 4] = ["id", "data", "created_at", "updated_at"];

fn is_reserved_column(name: &str) -> bool {
    RECORD_COLUMNS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> Principal {
        Principal::Authenticated(id.to_string())
    }

    #[test]
    fn owned_rows_visible_to_owner_and_admin_only() {
        let policy = TablePolicy::owned("reminders", "user_id");
        assert!(policy.visible(Some("a"), &user("a"), false));
        assert!(!policy.visible(Some("b"), &user("a"), false));
        assert!(policy.visible(Some("b"), &user("a"), true));
        assert!(!policy.visible(Some("a"), &Principal::Anonymous, false));
    }

    #[test]
    fn anonymous_principal_is_never_admin() {
        let policy = TablePolicy::owned("reminders", "user_id");
        assert!(!policy.visible(Some("a"), &Principal::Anonymous, true));
    }

    #[test]
    fn null_owner_rows_visible_to_admins_only() {
        let policy = TablePolicy::anonymous_allowed("feedback", "user_id");
        assert!(policy.visible(None, &user("admin"), true));
        assert!(!policy.visible(None, &user("a"), false));
        assert!(!policy.visible(None, &Principal::Anonymous, false));
        assert!(policy.visible(Some("a"), &user("a"), false));
        assert!(policy.visible(Some("a"), &user("admin"), true));
    }

    #[test]
    fn empty_owner_never_matches() {
        let policy = TablePolicy::owned("reminders", "user_id");
        assert!(!policy.visible(Some(""), &user(""), false));
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let err = PolicyStore::new(vec![TablePolicy::owned("reminders; drop", "user_id")]).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidIdentifier(_)));
        let err = PolicyStore::new(vec![TablePolicy::owned("reminders", "id")]).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidIdentifier(_)));
    }

    #[test]
    fn rejects_duplicates() {
        let err = PolicyStore::new(vec![
            TablePolicy::owned("reminders", "user_id"),
            TablePolicy::owned("reminders", "owner_id"),
        ])
        .unwrap_err();
        assert_eq!(err, PolicyError::DuplicateTable("reminders".to_string()));
    }

    #[test]
    fn default_registry_is_valid() {
        let store = PolicyStore::reminders_app();
        assert!(PolicyStore::new(store.tables().to_vec()).is_ok());
        assert!(store.get("feedback").unwrap().allows_null_owner());
        assert!(!store.get("reminders").unwrap().allows_null_owner());
        assert!(store.get("users").is_none());
    }
}
