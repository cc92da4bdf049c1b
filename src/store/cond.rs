//! Condition grammar → SQL compilation.
//!
//! Conditions are JSON maps: leaf values mean equality, operator objects
//! carry `$lt $lte $gt $gte $in $nin $ne $like`, and the special key
//! `$having` holds a post-aggregation expression over aggregate aliases.
//! Record fields live in a JSON column, so every field reference compiles
//! to `json_extract(data, '$.field')` with bound parameters.

use anyhow::{bail, Result};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

pub type Cond = serde_json::Map<String, Value>;

/// Build a condition map from a `json!({...})` literal.
pub fn cond(v: Value) -> Cond {
    match v {
        Value::Object(m) => m,
        _ => Cond::new(),
    }
}

pub(crate) struct CompiledCond {
    pub where_sql: String,
    pub params: Vec<SqlValue>,
    pub having: Option<String>,
}

impl CompiledCond {
    pub fn empty() -> Self {
        Self {
            where_sql: String::new(),
            params: Vec::new(),
            having: None,
        }
    }

    /// WHERE clause including the keyword, or empty string.
    pub fn where_clause(&self) -> String {
        if self.where_sql.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.where_sql)
        }
    }
}

pub(crate) fn field_expr(field: &str) -> String {
    format!("json_extract(data, '$.{field}')")
}

fn check_field(field: &str) -> Result<()> {
    if field.is_empty()
        || !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        bail!("invalid field name: {field:?}");
    }
    Ok(())
}

pub(crate) fn bind_value(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub(crate) fn compile(cond: Option<&Cond>) -> Result<CompiledCond> {
    let Some(cond) = cond else {
        return Ok(CompiledCond::empty());
    };

    let mut parts: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    let mut having: Option<String> = None;

    for (key, value) in cond {
        if key == "$having" {
            match value {
                Value::String(expr) => having = Some(expr.clone()),
                _ => bail!("$having must be a string expression"),
            }
            continue;
        }
        check_field(key)?;
        let col = field_expr(key);

        match value {
            Value::Object(ops) => {
                for (op, operand) in ops {
                    match op.as_str() {
                        "$lt" | "$lte" | "$gt" | "$gte" | "$ne" | "$like" => {
                            let sql_op = match op.as_str() {
                                "$lt" => "<",
                                "$lte" => "<=",
                                "$gt" => ">",
                                "$gte" => ">=",
                                "$ne" => "!=",
                                "$like" => "LIKE",
                                _ => unreachable!(),
                            };
                            parts.push(format!("{col} {sql_op} ?"));
                            params.push(bind_value(operand));
                        }
                        "$in" | "$nin" => {
                            let Value::Array(items) = operand else {
                                bail!("{op} requires an array operand");
                            };
                            if items.is_empty() {
                                // empty $in matches nothing, empty $nin everything
                                parts.push(
                                    if op == "$in" { "0 = 1" } else { "1 = 1" }.to_string(),
                                );
                                continue;
                            }
                            let marks = vec!["?"; items.len()].join(", ");
                            let neg = if op == "$nin" { "NOT " } else { "" };
                            parts.push(format!("{col} {neg}IN ({marks})"));
                            params.extend(items.iter().map(bind_value));
                        }
                        other => bail!("unsupported operator: {other}"),
                    }
                }
            }
            leaf => {
                parts.push(format!("{col} = ?"));
                params.push(bind_value(leaf));
            }
        }
    }

    Ok(CompiledCond {
        where_sql: parts.join(" AND "),
        params,
        having,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_leaf() {
        let c = cond(json!({"status": "running"}));
        let compiled = compile(Some(&c)).unwrap();
        assert_eq!(
            compiled.where_sql,
            "json_extract(data, '$.status') = ?"
        );
        assert_eq!(compiled.params.len(), 1);
    }

    #[test]
    fn test_range_operators() {
        let c = cond(json!({"at": {"$gte": 10, "$lte": 20}}));
        let compiled = compile(Some(&c)).unwrap();
        assert!(compiled.where_sql.contains(">= ?"));
        assert!(compiled.where_sql.contains("<= ?"));
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_in_and_nin() {
        let c = cond(json!({"level": {"$in": ["error", "fatal"]}}));
        let compiled = compile(Some(&c)).unwrap();
        assert!(compiled.where_sql.contains("IN (?, ?)"));

        let c = cond(json!({"method": {"$nin": ["GET"]}}));
        let compiled = compile(Some(&c)).unwrap();
        assert!(compiled.where_sql.contains("NOT IN (?)"));
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let c = cond(json!({"level": {"$in": []}}));
        let compiled = compile(Some(&c)).unwrap();
        assert_eq!(compiled.where_sql, "0 = 1");
    }

    #[test]
    fn test_having_extracted() {
        let c = cond(json!({"at": 5, "$having": "cnt > 0"}));
        let compiled = compile(Some(&c)).unwrap();
        assert_eq!(compiled.having.as_deref(), Some("cnt > 0"));
        assert!(!compiled.where_sql.contains("having"));
    }

    #[test]
    fn test_field_name_rejected() {
        let c = cond(json!({"a'; DROP TABLE x--": 1}));
        assert!(compile(Some(&c)).is_err());
    }

    #[test]
    fn test_bool_binds_as_integer() {
        match bind_value(&json!(true)) {
            SqlValue::Integer(1) => {}
            other => panic!("expected Integer(1), got {other:?}"),
        }
    }

    #[test]
    fn test_none_is_empty() {
        let compiled = compile(None).unwrap();
        assert!(compiled.where_clause().is_empty());
    }
}
