//! Feedback log persistence.
//!
//! Append-only; list columns and the result set are stored as JSON text.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

use crate::error::{QueryTalkError, Result};
use crate::workflow::store::FeedbackRecord;

/// Raw database row for a feedback record.
#[derive(Debug, Clone, FromRow)]
struct FeedbackRow {
    thread_id: String,
    user_question: String,
    original_question: String,
    clarifications: String,
    table_names: String,
    sql_query: String,
    query_result: String,
    final_answer: String,
    satisfied: bool,
    recorded_at: String,
}

impl TryFrom<FeedbackRow> for FeedbackRecord {
    type Error = QueryTalkError;

    fn try_from(row: FeedbackRow) -> Result<Self> {
        let recorded_at = DateTime::parse_from_rfc3339(&row.recorded_at)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| QueryTalkError::persistence(format!("Invalid feedback timestamp: {e}")))?;

        Ok(Self {
            thread_id: row.thread_id,
            user_question: row.user_question,
            original_question: row.original_question,
            clarifications: decode(&row.clarifications)?,
            table_names: decode(&row.table_names)?,
            sql_query: row.sql_query,
            query_result: decode(&row.query_result)?,
            final_answer: row.final_answer,
            satisfied: row.satisfied,
            recorded_at,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json)
        .map_err(|e| QueryTalkError::persistence(format!("Corrupted feedback record: {e}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| QueryTalkError::persistence(format!("Failed to encode feedback record: {e}")))
}

/// Appends a feedback record and returns its id.
pub async fn record_feedback(pool: &SqlitePool, record: &FeedbackRecord) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO feedback_log
        (thread_id, user_question, original_question, clarifications, table_names,
         sql_query, query_result, final_answer, satisfied, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.thread_id)
    .bind(&record.user_question)
    .bind(&record.original_question)
    .bind(encode(&record.clarifications)?)
    .bind(encode(&record.table_names)?)
    .bind(&record.sql_query)
    .bind(encode(&record.query_result)?)
    .bind(&record.final_answer)
    .bind(record.satisfied)
    .bind(record.recorded_at.to_rfc3339())
    .execute(pool)
    .await
    .map_err(|e| QueryTalkError::persistence(format!("Failed to record feedback: {e}")))?;

    Ok(result.last_insert_rowid())
}

/// Lists the feedback recorded for a thread, oldest first.
pub async fn list_feedback(pool: &SqlitePool, thread_id: &str) -> Result<Vec<FeedbackRecord>> {
    let rows: Vec<FeedbackRow> = sqlx::query_as(
        r#"
        SELECT thread_id, user_question, original_question, clarifications, table_names,
               sql_query, query_result, final_answer, satisfied, recorded_at
        FROM feedback_log
        WHERE thread_id = ?
        ORDER BY id
        "#,
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await
    .map_err(|e| QueryTalkError::persistence(format!("Failed to list feedback: {e}")))?;

    rows.into_iter().map(FeedbackRecord::try_from).collect()
}
