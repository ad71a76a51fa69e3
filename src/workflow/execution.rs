//! Execution and shaping stage.

use std::time::Instant;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::db::{QueryResult, SqlExecutor};
use crate::error::{QueryTalkError, Result};
use crate::safety::ensure_read_only;

/// Runs the synthesized statement and caps its result.
///
/// Checks happen before any connection is opened: an empty statement is
/// `MissingQuery`, and with `read_only` set anything but a pure query is
/// `UnsafeQuery`. A statement without a result set, or one that returned
/// no rows, shapes to an empty result with no columns.
pub async fn execute_and_shape(
    executor: &dyn SqlExecutor,
    connection: &ConnectionConfig,
    sql: &str,
    max_rows: usize,
    read_only: bool,
) -> Result<QueryResult> {
    if sql.trim().is_empty() {
        return Err(QueryTalkError::MissingQuery);
    }

    if read_only {
        ensure_read_only(sql)?;
    }

    let start = Instant::now();
    let result = executor
        .run(connection, sql)
        .await?
        .filter(|result| !result.is_empty())
        .unwrap_or_default()
        .shape(max_rows);

    debug!(
        rows = result.rows.len(),
        total_rows = result.total_rows,
        truncated = result.was_truncated,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Query executed"
    );
    Ok(result)
}
