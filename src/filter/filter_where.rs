use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::error::FilterError;
use super::types::{canonical_timestamp, ColumnSet, ColumnType, FilterOp, FilterWhereInfo, WhereNode};

pub struct FilterWhere<'a> {
    columns: &'a ColumnSet,
    param_values: Vec<Value>,
    param_index: usize,
}

impl<'a> FilterWhere<'a> {
    pub fn new(columns: &'a ColumnSet, starting_param_index: usize) -> Self {
        Self {
            columns,
            param_values: vec![],
            param_index: starting_param_index,
        }
    }

    /// Parse a client WHERE object. `null` and `{}` mean "no condition".
    pub fn parse(where_data: &Value, columns: &ColumnSet) -> Result<Option<WhereNode>, FilterError> {
        match where_data {
            Value::Null => Ok(None),
            Value::Object(_) => {
                let mut nodes = Self::parse_object(where_data, columns)?;
                Ok(match nodes.len() {
                    0 => None,
                    1 => nodes.pop(),
                    _ => Some(WhereNode::And(nodes)),
                })
            }
            Value::String(_) => Err(FilterError::InvalidWhereClause(
                "Raw SQL predicates are not supported".to_string(),
            )),
            _ => Err(FilterError::InvalidWhereClause("WHERE must be an object".to_string())),
        }
    }

    /// Render a parsed tree to a parameterized SQL predicate.
    pub fn generate(
        node: Option<&WhereNode>,
        columns: &ColumnSet,
        starting_param_index: usize,
    ) -> Result<(String, Vec<Value>), FilterError> {
        let mut filter_where = FilterWhere::new(columns, starting_param_index);
        let sql = match node {
            Some(node) => filter_where.build(node)?,
            None => "1=1".to_string(),
        };
        Ok((sql, filter_where.param_values))
    }

    fn parse_object(where_data: &Value, columns: &ColumnSet) -> Result<Vec<WhereNode>, FilterError> {
        let obj = where_data
            .as_object()
            .ok_or_else(|| FilterError::InvalidWhereClause("Expected object".to_string()))?;

        let mut nodes = Vec::new();
        for (key, value) in obj {
            if key.starts_with('$') {
                nodes.push(Self::parse_logical_operator(key, value, columns)?);
            } else {
                nodes.extend(Self::parse_field_condition(key, value, columns)?);
            }
        }
        Ok(nodes)
    }

    fn parse_logical_operator(op: &str, value: &Value, columns: &ColumnSet) -> Result<WhereNode, FilterError> {
        match op {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| FilterError::InvalidOperatorData(format!("{} requires array", op)))?;
                let mut children = Vec::new();
                for v in arr {
                    let mut parts = Self::parse_object(v, columns)?;
                    children.push(if parts.len() == 1 {
                        parts.remove(0)
                    } else {
                        WhereNode::And(parts)
                    });
                }
                Ok(if op == "$and" { WhereNode::And(children) } else { WhereNode::Or(children) })
            }
            "$not" => {
                let parts = Self::parse_object(value, columns)?;
                Ok(WhereNode::Not(Box::new(WhereNode::And(parts))))
            }
            _ => Err(FilterError::UnsupportedOperator(op.to_string())),
        }
    }

    fn parse_field_condition(field: &str, value: &Value, columns: &ColumnSet) -> Result<Vec<WhereNode>, FilterError> {
        let column_type = columns
            .get(field)
            .ok_or_else(|| FilterError::InvalidColumn(field.to_string()))?;

        let mut out = Vec::new();
        if let Value::Object(obj) = value {
            for (op_key, op_val) in obj {
                let operator = FilterOp::parse(op_key)
                    .ok_or_else(|| FilterError::UnsupportedOperator(op_key.clone()))?;
                let data = Self::normalize_operand(field, column_type, operator, op_val)?;
                out.push(WhereNode::Condition(FilterWhereInfo { column: field.to_string(), operator, data }));
            }
        } else {
            // Implicit equality: { field: value }
            let data = Self::normalize_operand(field, column_type, FilterOp::Eq, value)?;
            out.push(WhereNode::Condition(FilterWhereInfo { column: field.to_string(), operator: FilterOp::Eq, data }));
        }
        Ok(out)
    }

    fn normalize_operand(field: &str, column_type: ColumnType, operator: FilterOp, value: &Value) -> Result<Value, FilterError> {
        match operator {
            FilterOp::In | FilterOp::NIn => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| FilterError::InvalidOperatorData(format!("{:?} on '{}' requires array", operator, field)))?;
                let values = arr
                    .iter()
                    .map(|v| Self::normalize_scalar(field, column_type, v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(values))
            }
            FilterOp::Between => match value.as_array() {
                Some(arr) if arr.len() == 2 => Ok(Value::Array(vec![
                    Self::normalize_scalar(field, column_type, &arr[0])?,
                    Self::normalize_scalar(field, column_type, &arr[1])?,
                ])),
                _ => Err(FilterError::InvalidOperatorData("$between requires exactly 2 values".to_string())),
            },
            FilterOp::Like | FilterOp::ILike => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err(FilterError::InvalidOperatorData(format!("{:?} on '{}' requires a string", operator, field))),
            },
            _ => Self::normalize_scalar(field, column_type, value),
        }
    }

    /// Canonicalize ids and timestamps so SQL and in-process comparison agree.
    fn normalize_scalar(field: &str, column_type: ColumnType, value: &Value) -> Result<Value, FilterError> {
        let invalid = || FilterError::InvalidOperatorData(format!("invalid value for '{}': {}", field, value));
        match (column_type, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ColumnType::Uuid, Value::String(s)) => Uuid::parse_str(s)
                .map(|u| Value::String(u.to_string()))
                .map_err(|_| invalid()),
            (ColumnType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Value::String(canonical_timestamp(&dt.with_timezone(&Utc))))
                .map_err(|_| invalid()),
            (ColumnType::Text, Value::String(_)) => Ok(value.clone()),
            (ColumnType::Text, Value::Number(n)) => Ok(Value::String(n.to_string())),
            _ => Err(invalid()),
        }
    }

    fn build(&mut self, node: &WhereNode) -> Result<String, FilterError> {
        match node {
            WhereNode::And(children) | WhereNode::Or(children) if children.is_empty() => {
                Ok(if matches!(node, WhereNode::And(_)) { "1=1" } else { "1=0" }.to_string())
            }
            WhereNode::And(children) => self.build_joined(children, " AND "),
            WhereNode::Or(children) => self.build_joined(children, " OR "),
            WhereNode::Not(child) => Ok(format!("NOT ({})", self.build(child)?)),
            WhereNode::Condition(condition) => self.build_sql_condition(condition),
        }
    }

    fn build_joined(&mut self, children: &[WhereNode], joiner: &str) -> Result<String, FilterError> {
        let mut parts = Vec::with_capacity(children.len());
        for child in children {
            parts.push(format!("({})", self.build(child)?));
        }
        Ok(parts.join(joiner))
    }

    fn build_sql_condition(&mut self, condition: &FilterWhereInfo) -> Result<String, FilterError> {
        let column_type = self
            .columns
            .get(&condition.column)
            .ok_or_else(|| FilterError::InvalidColumn(condition.column.clone()))?;
        let cast = column_type.sql_cast();
        let quoted_column = format!("\"{}\"", condition.column);
        let data = &condition.data;

        Ok(match condition.operator {
            FilterOp::Eq if data.is_null() => format!("{} IS NULL", quoted_column),
            FilterOp::Ne if data.is_null() => format!("{} IS NOT NULL", quoted_column),
            FilterOp::Eq => format!("{} = {}", quoted_column, self.param(data.clone(), cast)),
            FilterOp::Ne => format!("{} <> {}", quoted_column, self.param(data.clone(), cast)),
            FilterOp::Gt => format!("{} > {}", quoted_column, self.param(data.clone(), cast)),
            FilterOp::Gte => format!("{} >= {}", quoted_column, self.param(data.clone(), cast)),
            FilterOp::Lt => format!("{} < {}", quoted_column, self.param(data.clone(), cast)),
            FilterOp::Lte => format!("{} <= {}", quoted_column, self.param(data.clone(), cast)),
            FilterOp::Like => format!("{}::text LIKE {}", quoted_column, self.param(data.clone(), "text")),
            FilterOp::ILike => format!("{}::text ILIKE {}", quoted_column, self.param(data.clone(), "text")),
            FilterOp::In | FilterOp::NIn => {
                let values = data.as_array().cloned().unwrap_or_default();
                let negate = matches!(condition.operator, FilterOp::NIn);
                if values.is_empty() {
                    return Ok(if negate { "1=1" } else { "1=0" }.to_string());
                }
                let params: Vec<String> = values.into_iter().map(|v| self.param(v, cast)).collect();
                let keyword = if negate { "NOT IN" } else { "IN" };
                format!("{} {} ({})", quoted_column, keyword, params.join(", "))
            }
            FilterOp::Between => {
                let values = data.as_array().cloned().unwrap_or_default();
                if values.len() != 2 {
                    return Err(FilterError::InvalidOperatorData("$between requires exactly 2 values".to_string()));
                }
                let low = self.param(values[0].clone(), cast);
                let high = self.param(values[1].clone(), cast);
                format!("{} BETWEEN {} AND {}", quoted_column, low, high)
            }
        })
    }

    fn param(&mut self, value: Value, cast: &str) -> String {
        self.param_values.push(value);
        self.param_index += 1;
        format!("${}::{}", self.param_index, cast)
    }
}
