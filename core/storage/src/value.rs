//! Backend-neutral query parameters and result rows.

use chrono::{DateTime, Utc};
use serde_json::Value;

use fleetsync_common::{Error, Result};

/// A bound query parameter.
///
/// Each store maps these onto its native types. Prefer building them through
/// [`crate::Dialect`] (`encode_timestamp`, `encode_bool`, `encode_json`) so the
/// physical representation matches the schema mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL. Binds as untyped text on PostgreSQL, so only use it for
    /// text columns.
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Json(Value),
    Timestamp(DateTime<Utc>),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl SqlValue {
    /// Parameter for a JSON value taken from a row document.
    ///
    /// Scalars bind as their SQL counterparts; objects and arrays bind as
    /// JSON.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Json(other.clone()),
        }
    }
}

/// A result row keyed by column name.
///
/// Values arrive in the backend's physical representation; decode booleans,
/// JSON and timestamps through the dialect.
pub type Row = serde_json::Map<String, Value>;

/// Get a column, failing if the query did not select it.
pub fn column<'a>(row: &'a Row, name: &str) -> Result<&'a Value> {
    row.get(name)
        .ok_or_else(|| Error::NotFound(format!("column '{}' missing from row", name)))
}

/// Get a non-null text column.
pub fn get_str(row: &Row, name: &str) -> Result<String> {
    match column(row, name)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(Error::Serialization(format!(
            "column '{}' is not text: {}",
            name, other
        ))),
    }
}

/// Get a nullable text column.
pub fn get_opt_str(row: &Row, name: &str) -> Result<Option<String>> {
    match column(row, name)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(Error::Serialization(format!(
            "column '{}' is not text: {}",
            name, other
        ))),
    }
}

/// Get a non-null integer column.
pub fn get_i64(row: &Row, name: &str) -> Result<i64> {
    column(row, name)?.as_i64().ok_or_else(|| {
        Error::Serialization(format!("column '{}' is not an integer", name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_option_conversion() {
        assert_eq!(SqlValue::from(None::<String>), SqlValue::Null);
        assert_eq!(
            SqlValue::from(Some("vessel-7")),
            SqlValue::Text("vessel-7".to_string())
        );
    }

    #[test]
    fn test_from_json_maps_scalars_and_documents() {
        assert_eq!(SqlValue::from_json(&json!(null)), SqlValue::Null);
        assert_eq!(SqlValue::from_json(&json!(true)), SqlValue::Bool(true));
        assert_eq!(SqlValue::from_json(&json!(12)), SqlValue::Int(12));
        assert_eq!(SqlValue::from_json(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(SqlValue::from_json(&json!("x")), SqlValue::Text("x".into()));
        assert_eq!(
            SqlValue::from_json(&json!({"knots": 12})),
            SqlValue::Json(json!({"knots": 12}))
        );
    }

    #[test]
    fn test_row_accessors() {
        let mut row = Row::new();
        row.insert("id".into(), json!("abc"));
        row.insert("count".into(), json!(42));
        row.insert("note".into(), Value::Null);

        assert_eq!(get_str(&row, "id").unwrap(), "abc");
        assert_eq!(get_i64(&row, "count").unwrap(), 42);
        assert_eq!(get_opt_str(&row, "note").unwrap(), None);
        assert!(get_str(&row, "count").is_err());
        assert!(matches!(column(&row, "missing"), Err(Error::NotFound(_))));
    }
}
