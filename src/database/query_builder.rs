use serde_json::Value;
use sqlx::{postgres::PgArguments, PgConnection, Row};
use uuid::Uuid;

use crate::database::manager::DatabaseError;
use crate::database::record::{object_or_empty, record_columns, NewRecord, Record};
use crate::filter::{Filter, FilterData};
use crate::policy::sql::quote_identifier;
use crate::policy::TablePolicy;

/// SQL for one protected table. Carries no authorization logic: the
/// connection's row-level policies filter whatever this issues.
pub struct QueryBuilder<'p> {
    policy: &'p TablePolicy,
}

impl<'p> QueryBuilder<'p> {
    pub fn new(policy: &'p TablePolicy) -> Self {
        Self { policy }
    }

    pub fn select_clause(&self) -> String {
        format!(
            "\"id\", {}::text AS \"owner_id\", \"data\", \"created_at\", \"updated_at\"",
            quote_identifier(&self.policy.owner_column)
        )
    }

    pub fn filter(&self, filter_data: FilterData) -> Result<Filter, DatabaseError> {
        let mut filter = Filter::new(&self.policy.table, record_columns(self.policy))?;
        filter.assign(filter_data)?;
        Ok(filter)
    }

    fn table(&self) -> String {
        quote_identifier(&self.policy.table)
    }

    pub async fn select_all(&self, conn: &mut PgConnection, filter_data: FilterData) -> Result<Vec<Record>, DatabaseError> {
        let sql_result = self.filter(filter_data)?.to_sql(&self.select_clause())?;
        let mut q = sqlx::query_as::<_, Record>(&sql_result.query);
        for p in sql_result.params.iter() {
            q = bind_param_query_as(q, p);
        }
        let rows = q.fetch_all(&mut *conn).await?;
        Ok(rows)
    }

    pub async fn select_by_id(&self, conn: &mut PgConnection, id: Uuid) -> Result<Option<Record>, DatabaseError> {
        let sql = format!("SELECT {} FROM {} WHERE \"id\" = $1", self.select_clause(), self.table());
        let row = sqlx::query_as::<_, Record>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    pub async fn count(&self, conn: &mut PgConnection, filter_data: FilterData) -> Result<i64, DatabaseError> {
        let sql_result = self.filter(filter_data)?.to_count_sql()?;
        let mut q = sqlx::query(&sql_result.query);
        for p in sql_result.params.iter() {
            q = bind_param_query(q, p);
        }
        let row = q.fetch_one(&mut *conn).await?;
        let count: i64 = row.try_get("count")?;
        Ok(count)
    }

    pub async fn insert(&self, conn: &mut PgConnection, record: &NewRecord) -> Result<Record, DatabaseError> {
        let sql = format!(
            "INSERT INTO {} ({}, \"data\") VALUES ($1, $2) RETURNING {}",
            self.table(),
            quote_identifier(&self.policy.owner_column),
            self.select_clause()
        );
        let row = sqlx::query_as::<_, Record>(&sql)
            .bind(record.owner_id.clone())
            .bind(record.data_or_empty())
            .fetch_one(&mut *conn)
            .await?;
        Ok(row)
    }

    pub async fn update(&self, conn: &mut PgConnection, id: Uuid, data: Value) -> Result<u64, DatabaseError> {
        let sql = format!(
            "UPDATE {} SET \"data\" = $1, \"updated_at\" = now() WHERE \"id\" = $2",
            self.table()
        );
        let result = sqlx::query(&sql).bind(object_or_empty(data)).bind(id).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, conn: &mut PgConnection, id: Uuid) -> Result<u64, DatabaseError> {
        let sql = format!("DELETE FROM {} WHERE \"id\" = $1", self.table());
        let result = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }
}

// Filter operands are canonicalized to strings (or null) before they get here;
// the SQL casts each placeholder to the column type.
fn param_as_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn bind_param_query<'q>(
    q: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
    v: &Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
    q.bind(param_as_text(v))
}

fn bind_param_query_as<'q, O>(
    q: sqlx::query::QueryAs<'q, sqlx::Postgres, O, PgArguments>,
    v: &Value,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, O, PgArguments>
where
    O: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>,
{
    q.bind(param_as_text(v))
}
