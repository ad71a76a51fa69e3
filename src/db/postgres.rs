//! PostgreSQL executor implementation.
//!
//! Opens one connection per statement with sqlx and always closes it before
//! returning.

use crate::config::ConnectionConfig;
use crate::db::{QueryResult, Row, SqlExecutor, Value};
use crate::error::{QueryTalkError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::Decimal;
use sqlx::{Column, ConnectOptions, Connection, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default statement timeout in seconds.
const QUERY_TIMEOUT_SECS: u64 = 30;

/// Connection timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// PostgreSQL executor.
#[derive(Debug, Clone)]
pub struct PostgresExecutor {
    query_timeout: Duration,
}

impl PostgresExecutor {
    /// Creates an executor with the default statement timeout.
    pub fn new() -> Self {
        Self {
            query_timeout: Duration::from_secs(QUERY_TIMEOUT_SECS),
        }
    }

    async fn connect(config: &ConnectionConfig) -> Result<PgConnection> {
        let options = connect_options(config);

        tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), options.connect())
            .await
            .map_err(|_| {
                QueryTalkError::database(
                    "connection",
                    format!(
                        "Connection to {} timed out. The server may be overloaded or unreachable.",
                        config.display_string()
                    ),
                )
            })?
            .map_err(|e| map_connection_error(e, config))
    }
}

impl Default for PostgresExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn run(&self, connection: &ConnectionConfig, sql: &str) -> Result<Option<QueryResult>> {
        let mut conn = Self::connect(connection).await?;
        let start = Instant::now();

        let outcome =
            tokio::time::timeout(self.query_timeout, sqlx::query(sql).fetch_all(&mut conn)).await;

        if let Err(e) = conn.close().await {
            warn!("Failed to close database connection: {}", e);
        }

        let rows = outcome
            .map_err(|_| {
                QueryTalkError::database(
                    "timeout",
                    format!(
                        "Query timed out after {} seconds",
                        self.query_timeout.as_secs()
                    ),
                )
            })?
            .map_err(map_query_error)?;

        debug!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query executed on {}",
            connection.display_string()
        );

        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let columns = first
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect();
        let rows: Vec<Row> = rows.iter().map(convert_row).collect();

        Ok(Some(QueryResult::with_data(columns, rows)))
    }
}

/// Builds connect options, letting libpq-style defaults fill the gaps.
fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new().port(config.port);

    if let Some(host) = &config.host {
        options = options.host(host);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    if let Some(user) = &config.user {
        options = options.username(user);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }

    options
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
///
/// Values that cannot be decoded become NULL.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    fn text<T: ToString>(v: Option<T>) -> Value {
        v.map(|v| Value::String(v.to_string())).unwrap_or(Value::Null)
    }

    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        // Kept as text so sums and prices stay exact
        "NUMERIC" => text(row.try_get::<Option<Decimal>, _>(index).ok().flatten()),

        "DATE" => text(row.try_get::<Option<NaiveDate>, _>(index).ok().flatten()),

        "TIME" => text(row.try_get::<Option<NaiveTime>, _>(index).ok().flatten()),

        "TIMESTAMP" => text(row.try_get::<Option<NaiveDateTime>, _>(index).ok().flatten()),

        "TIMESTAMPTZ" => text(
            row.try_get::<Option<DateTime<Utc>>, _>(index)
                .ok()
                .flatten()
                .map(|v| v.to_rfc3339()),
        ),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> QueryTalkError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let code = error
        .as_database_error()
        .and_then(|e| e.code().map(|c| c.into_owned()))
        .unwrap_or_else(|| "connection".to_string());

    let error_str = error.to_string().to_lowercase();

    let message = if error_str.contains("connection refused")
        || error_str.contains("could not connect")
    {
        format!("Cannot connect to {host}:{port}. Check that the server is running.")
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        format!("Authentication failed for user '{user}'. Check your credentials.")
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        format!("Database '{database}' does not exist.")
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        )
    } else {
        error.to_string()
    };

    QueryTalkError::database(code, message)
}

/// Maps a statement error, keeping the SQLSTATE code and any detail or hint.
fn map_query_error(error: sqlx::Error) -> QueryTalkError {
    let Some(db_error) = error.as_database_error() else {
        return QueryTalkError::database("driver", error.to_string());
    };

    let code = db_error
        .code()
        .map(|c| c.into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    let mut message = db_error.message().to_string();

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            message.push_str("\n  DETAIL: ");
            message.push_str(detail);
        }

        if let Some(hint) = pg_error.hint() {
            message.push_str("\n  HINT: ");
            message.push_str(hint);
        }
    }

    QueryTalkError::database(code, message)
}
