//! Query result types for querytalk.
//!
//! Defines the tabular result returned by the executor and the shaped result
//! stored in the conversation state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the result of executing a SQL query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names, in select order.
    pub columns: Vec<String>,

    /// Rows of data.
    pub rows: Vec<Row>,

    /// Number of rows before shaping.
    #[serde(default)]
    pub total_rows: usize,

    /// Whether shaping dropped rows.
    #[serde(default)]
    pub was_truncated: bool,
}

impl QueryResult {
    /// Creates a new empty query result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query result with the given columns and rows.
    pub fn with_data(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let total_rows = rows.len();
        Self {
            columns,
            rows,
            total_rows,
            was_truncated: false,
        }
    }

    /// Returns true if the result set is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Caps the result at `max_rows`, keeping the leading rows in order.
    ///
    /// Columns are left untouched.
    pub fn shape(mut self, max_rows: usize) -> Self {
        let total = self.rows.len().max(self.total_rows);
        if self.rows.len() > max_rows {
            self.rows.truncate(max_rows);
            self.was_truncated = true;
        }
        self.total_rows = total;
        self
    }

    /// Returns a truncation warning message if the result was truncated.
    pub fn truncation_warning(&self) -> Option<String> {
        self.was_truncated.then(|| {
            format!(
                "Result truncated: showing {} of {} rows",
                self.rows.len(),
                self.total_rows
            )
        })
    }

    /// Renders the result as plain text for a prompt.
    ///
    /// One header line of column names, then one line per row, cells
    /// separated by ` | `.
    pub fn to_prompt_text(&self) -> String {
        if self.columns.is_empty() {
            return "(no rows)".to_string();
        }

        let mut out = self.columns.join(" | ");
        for row in &self.rows {
            out.push('\n');
            let cells: Vec<String> = row.iter().map(Value::to_display_string).collect();
            out.push_str(&cells.join(" | "));
        }
        if self.rows.is_empty() {
            out.push_str("\n(no rows)");
        }
        out
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// Represents a single value from a database query.
///
/// Serialized untagged so results read naturally in JSON output.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text value; also carries numerics, dates and other typed values.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Converts the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}
