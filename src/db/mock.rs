//! Mock SQL executors for testing.

use super::{QueryResult, SqlExecutor};
use crate::config::ConnectionConfig;
use crate::error::{QueryTalkError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// An executor that returns scripted outcomes and records every statement.
///
/// Outcomes are consumed in order; the last one repeats.
#[derive(Debug)]
pub struct MockSqlExecutor {
    outcomes: Mutex<VecDeque<Result<Option<QueryResult>>>>,
    executed: Mutex<Vec<String>>,
}

impl MockSqlExecutor {
    /// Creates an executor that always returns `result`.
    pub fn new(result: QueryResult) -> Self {
        Self::with_outcomes([Ok(Some(result))])
    }

    /// Creates an executor whose statements produce no result set.
    pub fn empty() -> Self {
        Self::with_outcomes([Ok(None)])
    }

    /// Creates an executor returning the given outcomes in order.
    pub fn with_outcomes<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = Result<Option<QueryResult>>>,
    {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Returns the statements run so far.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns the number of statements run so far.
    pub fn call_count(&self) -> usize {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MockSqlExecutor {
    fn default() -> Self {
        Self::empty()
    }
}

#[async_trait]
impl SqlExecutor for MockSqlExecutor {
    async fn run(&self, _connection: &ConnectionConfig, sql: &str) -> Result<Option<QueryResult>> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sql.to_string());

        let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        if outcomes.len() > 1 {
            if let Some(outcome) = outcomes.pop_front() {
                return outcome;
            }
        }
        outcomes.front().cloned().unwrap_or(Ok(None))
    }
}

/// An executor that fails every statement, as an unreachable server would.
#[derive(Debug)]
pub struct FailingSqlExecutor {
    error: QueryTalkError,
}

impl FailingSqlExecutor {
    /// Creates an executor failing with the given error.
    pub fn new(error: QueryTalkError) -> Self {
        Self { error }
    }

    /// Creates an executor failing with a connection error.
    pub fn unreachable() -> Self {
        Self::new(QueryTalkError::database(
            "connection",
            "Cannot connect to localhost:5432. Check that the server is running.",
        ))
    }
}

#[async_trait]
impl SqlExecutor for FailingSqlExecutor {
    async fn run(&self, _connection: &ConnectionConfig, _sql: &str) -> Result<Option<QueryResult>> {
        Err(self.error.clone())
    }
}
