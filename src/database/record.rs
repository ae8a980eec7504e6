use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::filter::{canonical_timestamp, ColumnSet, ColumnType};
use crate::policy::TablePolicy;

/// A row of any protected table.
///
/// `owner_id` is read from the table's owner column, whatever it is named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Record {
    pub id: Uuid,
    pub owner_id: Option<String>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(owner_id: Option<String>, data: Value) -> Self {
        // Postgres keeps microseconds; match it so filters agree across engines
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id: Uuid::new_v4(),
            owner_id,
            data,
            created_at: now,
            updated_at: now,
        }
    }

    /// Filterable view of the record, keyed by real column names.
    pub fn to_row(&self, policy: &TablePolicy) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("id".to_string(), Value::String(self.id.to_string()));
        row.insert(
            policy.owner_column.clone(),
            self.owner_id.clone().map(Value::String).unwrap_or(Value::Null),
        );
        row.insert("created_at".to_string(), Value::String(canonical_timestamp(&self.created_at)));
        row.insert("updated_at".to_string(), Value::String(canonical_timestamp(&self.updated_at)));
        row
    }
}

/// Input for `create`. The owner is explicit; handlers default it to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub owner_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl NewRecord {
    pub fn owned_by(owner_id: impl Into<String>, data: Value) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            data,
        }
    }

    pub fn anonymous(data: Value) -> Self {
        Self { owner_id: None, data }
    }

    /// Structural checks shared by every engine, run before any predicate.
    pub fn validate(&self, policy: &TablePolicy) -> Result<(), String> {
        match self.owner_id.as_deref() {
            None if !policy.allows_null_owner() => {
                Err(format!("{} requires an owner in '{}'", policy.table, policy.owner_column))
            }
            Some("") => Err(format!("{} owner may not be empty", policy.table)),
            _ => Ok(()),
        }
    }

    pub fn data_or_empty(&self) -> Value {
        object_or_empty(self.data.clone())
    }
}

/// Record payloads are JSON objects only; anything else is stored as `{}`.
/// Applied on insert and on update.
pub fn object_or_empty(data: Value) -> Value {
    match data {
        Value::Object(_) => data,
        _ => Value::Object(Map::new()),
    }
}

/// Columns filters may reference on a protected table.
pub fn record_columns(policy: &TablePolicy) -> ColumnSet {
    ColumnSet::new()
        .with("id", ColumnType::Uuid)
        .with(policy.owner_column.clone(), ColumnType::Text)
        .with("created_at", ColumnType::Timestamp)
        .with("updated_at", ColumnType::Timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_uses_owner_column_name() {
        let policy = TablePolicy::owned("friend_invitations", "inviter_id");
        let record = Record::new(Some("u1".to_string()), json!({}));
        let row = record.to_row(&policy);
        assert_eq!(row.get("inviter_id"), Some(&json!("u1")));
        assert!(row.get("owner_id").is_none());
    }

    #[test]
    fn owned_tables_require_owner() {
        let owned = TablePolicy::owned("reminders", "user_id");
        let anon = TablePolicy::anonymous_allowed("feedback", "user_id");
        assert!(NewRecord::anonymous(json!({})).validate(&owned).is_err());
        assert!(NewRecord::anonymous(json!({})).validate(&anon).is_ok());
        assert!(NewRecord::owned_by("", json!({})).validate(&anon).is_err());
        assert!(NewRecord::owned_by("u1", json!({})).validate(&owned).is_ok());
    }

    #[test]
    fn non_object_data_is_normalized() {
        let record = NewRecord::owned_by("u1", json!(42));
        assert_eq!(record.data_or_empty(), json!({}));
        assert_eq!(object_or_empty(json!("text")), json!({}));
        assert_eq!(object_or_empty(json!({ "a": 1 })), json!({ "a": 1 }));
    }
}
