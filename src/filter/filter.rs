use serde_json::{Map, Value};

use super::error::FilterError;
use super::filter_order::FilterOrder;
use super::filter_where::FilterWhere;
use super::is_identifier;
use super::types::{ColumnSet, FilterData, FilterOrderInfo, SqlResult, WhereNode};

/// A validated query shape for one table.
///
/// The same instance renders parameterized SQL for Postgres and filters rows
/// in process for the memory engine, so both backends see one query language.
pub struct Filter {
    table_name: String,
    columns: ColumnSet,
    where_node: Option<WhereNode>,
    order_data: Vec<FilterOrderInfo>,
    limit: Option<i32>,
    offset: Option<i32>,
}

impl Filter {
    pub fn new(table_name: impl Into<String>, columns: ColumnSet) -> Result<Self, FilterError> {
        let table_name = table_name.into();
        if !is_identifier(&table_name) {
            return Err(FilterError::InvalidTableName(format!("Invalid table name format: {}", table_name)));
        }
        Ok(Self {
            table_name,
            columns,
            where_node: None,
            order_data: vec![],
            limit: None,
            offset: None,
        })
    }

    pub fn assign(&mut self, data: FilterData) -> Result<&mut Self, FilterError> {
        if let Some(where_clause) = data.where_clause { self.where_clause(where_clause)?; }
        if let Some(order) = data.order { self.order(order)?; }
        self.limit(data.limit, data.offset)?;
        Ok(self)
    }

    pub fn where_clause(&mut self, conditions: Value) -> Result<&mut Self, FilterError> {
        self.where_node = FilterWhere::parse(&conditions, &self.columns)?;
        Ok(self)
    }

    pub fn order(&mut self, order_spec: Value) -> Result<&mut Self, FilterError> {
        self.order_data = FilterOrder::validate_and_parse(&order_spec, &self.columns)?;
        Ok(self)
    }

    pub fn limit(&mut self, limit: Option<i32>, offset: Option<i32>) -> Result<&mut Self, FilterError> {
        if let Some(l) = limit { if l < 0 { return Err(FilterError::InvalidLimit("Limit must be non-negative".to_string())); } }
        if let Some(off) = offset { if off < 0 { return Err(FilterError::InvalidOffset("Offset must be non-negative".to_string())); } }
        self.limit = limit;
        self.offset = offset;
        Ok(self)
    }

    pub fn where_node(&self) -> Option<&WhereNode> {
        self.where_node.as_ref()
    }

    pub fn to_sql(&self, select_clause: &str) -> Result<SqlResult, FilterError> {
        let (where_clause, params) = FilterWhere::generate(self.where_node.as_ref(), &self.columns, 0)?;
        let order_clause = FilterOrder::generate(&self.order_data);
        let limit_clause = self.build_limit_clause();

        let query = [
            format!("SELECT {}", select_clause),
            format!("FROM \"{}\"", self.table_name),
            format!("WHERE {}", where_clause),
            order_clause,
            limit_clause,
        ].into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ");

        Ok(SqlResult { query, params })
    }

    pub fn to_where_sql(&self, starting_param_index: usize) -> Result<SqlResult, FilterError> {
        let (query, params) = FilterWhere::generate(self.where_node.as_ref(), &self.columns, starting_param_index)?;
        Ok(SqlResult { query, params })
    }

    pub fn to_count_sql(&self) -> Result<SqlResult, FilterError> {
        let where_result = self.to_where_sql(0)?;
        let query = format!("SELECT COUNT(*) AS count FROM \"{}\" WHERE {}", self.table_name, where_result.query);
        Ok(SqlResult { query, params: where_result.params })
    }

    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        self.where_node.as_ref().map_or(true, |node| node.matches(row))
    }

    /// In-process equivalent of `to_sql`: filter, sort, offset, limit.
    pub fn apply<T>(&self, rows: Vec<(Map<String, Value>, T)>) -> Vec<T> {
        let mut kept: Vec<(Map<String, Value>, T)> = rows.into_iter().filter(|(row, _)| self.matches(row)).collect();
        if !self.order_data.is_empty() {
            kept.sort_by(|(a, _), (b, _)| FilterOrder::compare_rows(&self.order_data, a, b));
        }
        let offset = self.offset.unwrap_or(0).max(0) as usize;
        let limit = self.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        kept.into_iter().skip(offset).take(limit).map(|(_, item)| item).collect()
    }

    fn build_limit_clause(&self) -> String {
        match (self.limit, self.offset) {
            (Some(l), Some(o)) => format!("LIMIT {} OFFSET {}", l, o),
            (Some(l), None) => format!("LIMIT {}", l),
            (None, Some(o)) => format!("OFFSET {}", o),
            (None, None) => String::new(),
        }
    }
}
