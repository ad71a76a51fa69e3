//! Database access for querytalk.
//!
//! Provides a trait-based interface for running generated SQL, so the
//! workflow can be driven against PostgreSQL or a test double.

mod mock;
mod postgres;
mod types;

pub use mock::{FailingSqlExecutor, MockSqlExecutor};
pub use postgres::PostgresExecutor;
pub use types::{QueryResult, Row, Value};

use crate::config::ConnectionConfig;
use crate::error::Result;
use async_trait::async_trait;

/// Trait defining the interface for SQL executors.
///
/// A connection is acquired for the call and released before it returns,
/// on success and on error alike. Executors never retry.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Runs a statement and returns its rows.
    ///
    /// `Ok(None)` means the statement produced no result set.
    async fn run(&self, connection: &ConnectionConfig, sql: &str) -> Result<Option<QueryResult>>;
}
