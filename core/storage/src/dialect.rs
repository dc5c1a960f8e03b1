//! SQL dialect shim.
//!
//! Every backend-specific query fragment lives here: JSON access and
//! construction, case-insensitive matching, array membership, partial JSON
//! updates, timestamp encoding, DDL type mapping and maintenance statements.
//! Callers never branch on the backend themselves; they ask the dialect for a
//! fragment or consult a capability predicate.
//!
//! # Array membership on SQLite
//! SQLite has no array type; array columns are stored as JSON text. Membership
//! is tested structurally with `json_each`, comparing whole elements. A `LIKE`
//! pattern scan is never used because it would match substrings of other
//! elements (`"pump"` inside `"pump-2"`).

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use fleetsync_common::{DeploymentMode, Error, Result};

use crate::value::SqlValue;

/// Characters that may never appear in a JSON path key. They would break out
/// of the SQL string literal or the path syntax of either backend.
const FORBIDDEN_KEY_CHARS: &[char] = &['\'', '"', '\\', '{', '}', ',', '$'];

/// The SQL dialect of the bound backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Centralized relational server.
    Postgres,
    /// Local embedded store.
    Sqlite,
}

/// Logical column types of the shared schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Id,
    Text,
    Integer,
    Boolean,
    Json,
    Timestamp,
}

/// One step of a JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A backend-neutral JSON path, written as `a.b[0].c`.
///
/// A leading `$` or `$.` is accepted and ignored, so SQLite-style paths parse
/// too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<PathSegment>,
}

impl JsonPath {
    /// Parse a dotted path.
    ///
    /// # Errors
    /// - Empty path or empty segment (`a..b`, trailing `.`)
    /// - Malformed index (`a[x]`, `a[`)
    /// - Keys containing quotes, backslashes, braces, commas or `$`
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim();
        let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
        let body = body.strip_prefix('.').unwrap_or(body);

        if body.is_empty() {
            return Err(Error::InvalidInput("JSON path cannot be empty".to_string()));
        }

        let mut segments = Vec::new();
        let mut key = String::new();
        let mut after_index = false;
        let mut chars = body.chars();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if !key.is_empty() {
                        segments.push(PathSegment::Key(std::mem::take(&mut key)));
                    } else if !after_index {
                        return Err(Error::InvalidInput(format!(
                            "JSON path '{}' has an empty segment",
                            path
                        )));
                    }
                    after_index = false;
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(PathSegment::Key(std::mem::take(&mut key)));
                    }
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) if d.is_ascii_digit() => digits.push(d),
                            _ => {
                                return Err(Error::InvalidInput(format!(
                                    "JSON path '{}' has a malformed index",
                                    path
                                )))
                            }
                        }
                    }
                    let index = digits.parse::<usize>().map_err(|_| {
                        Error::InvalidInput(format!("JSON path '{}' has an empty index", path))
                    })?;
                    segments.push(PathSegment::Index(index));
                    after_index = true;
                }
                c if FORBIDDEN_KEY_CHARS.contains(&c) || c.is_control() => {
                    return Err(Error::InvalidInput(format!(
                        "JSON path '{}' contains forbidden character {:?}",
                        path, c
                    )));
                }
                c => {
                    if after_index {
                        return Err(Error::InvalidInput(format!(
                            "JSON path '{}' expects '.' or '[' after an index",
                            path
                        )));
                    }
                    key.push(c);
                }
            }
        }

        if !key.is_empty() {
            segments.push(PathSegment::Key(key));
        } else if !after_index {
            return Err(Error::InvalidInput(format!(
                "JSON path '{}' ends with an empty segment",
                path
            )));
        }

        Ok(Self { segments })
    }

    /// Path segments in order.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// PostgreSQL text-array path, e.g. `{a,b,0,c}`.
    pub fn to_postgres(&self) -> String {
        let parts: Vec<String> = self
            .segments
            .iter()
            .map(|segment| match segment {
                PathSegment::Key(k) if is_simple_key(k) => k.clone(),
                PathSegment::Key(k) => format!("\"{}\"", k),
                PathSegment::Index(i) => i.to_string(),
            })
            .collect();
        format!("{{{}}}", parts.join(","))
    }

    /// SQLite JSON path, e.g. `$.a.b[0].c`.
    pub fn to_sqlite(&self) -> String {
        let mut out = String::from("$");
        for segment in &self.segments {
            match segment {
                PathSegment::Key(k) if is_simple_key(k) => {
                    out.push('.');
                    out.push_str(k);
                }
                PathSegment::Key(k) => {
                    out.push_str(".\"");
                    out.push_str(k);
                    out.push('"');
                }
                PathSegment::Index(i) => {
                    out.push('[');
                    out.push_str(&i.to_string());
                    out.push(']');
                }
            }
        }
        out
    }
}

fn is_simple_key(key: &str) -> bool {
    key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote a string as a SQL literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Check that a table, view or column name is safe to interpolate into SQL.
///
/// Accepts `name` or `schema.name`, each part matching `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(Error::InvalidInput(format!(
            "'{}' is not a valid SQL identifier",
            name
        )));
    }
    Ok(())
}

impl Dialect {
    /// The dialect a deployment mode binds to.
    pub fn for_mode(mode: DeploymentMode) -> Self {
        match mode {
            DeploymentMode::Connected => Dialect::Postgres,
            DeploymentMode::Disconnected => Dialect::Sqlite,
        }
    }

    /// Short backend name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }

    // ---- Parameters ------------------------------------------------------

    /// Positional placeholder for the `n`th parameter (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => format!("?{}", n),
        }
    }

    /// Comma-separated placeholders `start..start + count`.
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    // ---- DDL -------------------------------------------------------------

    /// Physical column type for a logical type.
    pub fn column_type(&self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (_, ColumnType::Id) | (_, ColumnType::Text) => "TEXT",
            (Dialect::Postgres, ColumnType::Integer) => "BIGINT",
            (Dialect::Postgres, ColumnType::Boolean) => "BOOLEAN",
            (Dialect::Postgres, ColumnType::Json) => "JSONB",
            (Dialect::Postgres, ColumnType::Timestamp) => "TIMESTAMPTZ",
            (Dialect::Sqlite, ColumnType::Integer) => "INTEGER",
            (Dialect::Sqlite, ColumnType::Boolean) => "INTEGER",
            (Dialect::Sqlite, ColumnType::Json) => "TEXT",
            // Unix epoch milliseconds, UTC.
            (Dialect::Sqlite, ColumnType::Timestamp) => "INTEGER",
        }
    }

    /// Boolean literal usable in DDL defaults and predicates.
    pub fn bool_literal(&self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Postgres, true) => "TRUE",
            (Dialect::Postgres, false) => "FALSE",
            (Dialect::Sqlite, true) => "1",
            (Dialect::Sqlite, false) => "0",
        }
    }

    // ---- JSON ------------------------------------------------------------

    /// Extract the value at `path` as text.
    pub fn json_extract_text(&self, column: &str, path: &JsonPath) -> String {
        match self {
            Dialect::Postgres => format!("({} #>> '{}')", column, path.to_postgres()),
            Dialect::Sqlite => format!("json_extract({}, '{}')", column, path.to_sqlite()),
        }
    }

    /// Build a JSON object from `(key, expression)` pairs.
    pub fn json_build_object(&self, pairs: &[(&str, &str)]) -> String {
        let args = pairs
            .iter()
            .map(|(key, expr)| format!("{}, {}", quote_literal(key), expr))
            .collect::<Vec<_>>()
            .join(", ");
        match self {
            Dialect::Postgres => format!("json_build_object({})", args),
            Dialect::Sqlite => format!("json_object({})", args),
        }
    }

    /// Build a JSON array from expressions.
    pub fn json_build_array(&self, exprs: &[&str]) -> String {
        let args = exprs.join(", ");
        match self {
            Dialect::Postgres => format!("json_build_array({})", args),
            Dialect::Sqlite => format!("json_array({})", args),
        }
    }

    /// Aggregate rows into a JSON array. Empty input yields `[]`, never NULL.
    pub fn json_array_agg(&self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("COALESCE(json_agg({}), '[]'::json)", expr),
            Dialect::Sqlite => format!("json_group_array({})", expr),
        }
    }

    /// Aggregate rows into a JSON object. Empty input yields `{}`, never NULL.
    pub fn json_object_agg(&self, key: &str, value: &str) -> String {
        match self {
            Dialect::Postgres => {
                format!("COALESCE(json_object_agg({}, {}), '{{}}'::json)", key, value)
            }
            Dialect::Sqlite => format!("json_group_object({}, {})", key, value),
        }
    }

    /// Set the value at `path` inside a JSON column, creating missing keys.
    ///
    /// `placeholder` must be bound with [`Dialect::encode_json`].
    pub fn json_set(&self, column: &str, path: &JsonPath, placeholder: &str) -> String {
        match self {
            Dialect::Postgres => format!(
                "jsonb_set(COALESCE({}, '{{}}'::jsonb), '{}', {}::jsonb, true)",
                column,
                path.to_postgres(),
                placeholder
            ),
            Dialect::Sqlite => format!(
                "json_set(COALESCE({}, '{{}}'), '{}', json({}))",
                column,
                path.to_sqlite(),
                placeholder
            ),
        }
    }

    // ---- Matching --------------------------------------------------------

    /// Case-insensitive pattern match (`%` and `_` wildcards).
    pub fn ilike(&self, column: &str, placeholder: &str) -> String {
        match self {
            Dialect::Postgres => format!("{} ILIKE {}", column, placeholder),
            Dialect::Sqlite => format!("LOWER({}) LIKE LOWER({})", column, placeholder),
        }
    }

    /// Test whether an array column contains the bound element.
    ///
    /// On SQLite the column holds a JSON array and membership is checked per
    /// element (see module docs).
    pub fn array_contains(&self, column: &str, placeholder: &str) -> String {
        match self {
            Dialect::Postgres => format!("{} = ANY({})", placeholder, column),
            Dialect::Sqlite => format!(
                "EXISTS (SELECT 1 FROM json_each({}) WHERE json_each.value = {})",
                column, placeholder
            ),
        }
    }

    // ---- Values ----------------------------------------------------------

    /// Encode a timestamp in the backend's native representation.
    pub fn encode_timestamp(&self, at: DateTime<Utc>) -> SqlValue {
        match self {
            Dialect::Postgres => SqlValue::Timestamp(at),
            Dialect::Sqlite => SqlValue::Int(at.timestamp_millis()),
        }
    }

    /// Decode a timestamp column value.
    ///
    /// SQLite rows carry epoch milliseconds; PostgreSQL rows carry RFC 3339
    /// text produced by the store's row decoder.
    pub fn decode_timestamp(&self, value: &Value) -> Option<DateTime<Utc>> {
        match (self, value) {
            (Dialect::Sqlite, Value::Number(n)) => {
                n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            }
            (Dialect::Postgres, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Render a timestamp the way it appears in decoded rows. Used for logs
    /// and payloads so both backends report identical text.
    pub fn display_timestamp(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// SQL expression for the current time in native representation.
    pub fn now_expr(&self) -> &'static str {
        match self {
            Dialect::Postgres => "now()",
            Dialect::Sqlite => "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)",
        }
    }

    /// Encode a boolean in the backend's native representation.
    pub fn encode_bool(&self, value: bool) -> SqlValue {
        match self {
            Dialect::Postgres => SqlValue::Bool(value),
            Dialect::Sqlite => SqlValue::Int(i64::from(value)),
        }
    }

    /// Decode a boolean column value.
    pub fn decode_bool(&self, value: &Value) -> bool {
        match (self, value) {
            (Dialect::Postgres, Value::Bool(b)) => *b,
            (Dialect::Sqlite, Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
            // Aggregates such as `COUNT(*) > 0` come back as integers on both.
            (_, Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
            (_, Value::Bool(b)) => *b,
            _ => false,
        }
    }

    /// Encode a JSON document for a JSON column.
    pub fn encode_json(&self, value: &Value) -> SqlValue {
        SqlValue::Json(value.clone())
    }

    /// Decode a JSON column value.
    ///
    /// SQLite stores JSON as text and needs parsing; PostgreSQL already
    /// returns structured JSON.
    pub fn decode_json(&self, value: &Value) -> Value {
        match (self, value) {
            (Dialect::Sqlite, Value::String(text)) => {
                serde_json::from_str(text).unwrap_or_else(|_| value.clone())
            }
            _ => value.clone(),
        }
    }

    // ---- Catalog and maintenance -----------------------------------------

    /// Query returning one row with a boolean-ish `present` column for the
    /// table or view named by parameter 1.
    pub fn table_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_class c \
                 WHERE c.relname = $1 AND c.relkind IN ('r', 'v', 'm', 'p') \
                 AND pg_catalog.pg_table_is_visible(c.oid)) AS present"
            }
            Dialect::Sqlite => {
                "SELECT COUNT(*) > 0 AS present FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name = ?1"
            }
        }
    }

    /// Statements that reclaim space after large deletions from `tables`.
    ///
    /// SQLite can only vacuum the whole file, so a single statement covers
    /// every table.
    pub fn reclaim_storage_sql(&self, tables: &[&str]) -> Vec<String> {
        if tables.is_empty() {
            return Vec::new();
        }
        match self {
            Dialect::Postgres => tables
                .iter()
                .map(|table| format!("VACUUM ANALYZE {}", table))
                .collect(),
            Dialect::Sqlite => vec!["VACUUM".to_string()],
        }
    }

    /// Refresh statement for a materialized view, if the backend has them.
    ///
    /// The concurrent form needs a unique index on the view and does not
    /// block readers.
    pub fn refresh_view_sql(&self, view: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {}", view)),
            Dialect::Sqlite => None,
        }
    }

    // ---- Capabilities ----------------------------------------------------

    pub fn supports_materialized_views(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub fn supports_concurrent_refresh(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub fn supports_cte(&self) -> bool {
        true
    }

    pub fn supports_array_type(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    pub fn supports_skip_locked(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
