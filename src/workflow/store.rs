//! Conversation snapshot storage.
//!
//! The orchestrator saves the state after every turn. A store keeps the
//! latest snapshot per thread, an append-only history of every saved
//! snapshot and the feedback log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::db::QueryResult;
use crate::error::{QueryTalkError, Result};
use crate::workflow::state::ConversationState;

/// One line of the feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub thread_id: String,
    /// Question after refinement.
    pub user_question: String,
    pub original_question: String,
    pub clarifications: Vec<String>,
    /// Tables declared in the schema contexts the question was answered with.
    pub table_names: Vec<String>,
    pub sql_query: String,
    pub query_result: QueryResult,
    pub final_answer: String,
    pub satisfied: bool,
    pub recorded_at: DateTime<Utc>,
}

impl FeedbackRecord {
    /// Builds a record from a finished conversation.
    pub fn from_state(
        state: &ConversationState,
        table_names: Vec<String>,
        satisfied: bool,
    ) -> Self {
        Self {
            thread_id: state.thread_id.clone(),
            user_question: state.user_question.clone(),
            original_question: state.original_question.clone(),
            clarifications: state.collected_clarifications.clone(),
            table_names,
            sql_query: state.sql_query.clone(),
            query_result: state.query_result.clone(),
            final_answer: state.final_answer.clone(),
            satisfied,
            recorded_at: Utc::now(),
        }
    }
}

/// Trait for conversation snapshot stores.
///
/// Implementations must be thread-safe; the orchestrator serializes turns
/// per thread but different threads save concurrently.
///
/// Several processes may share one store, so `save` is a compare-and-swap on
/// the revision counter: a snapshot is accepted only when its revision is one
/// past the stored one (1 for a thread with no snapshot). Anything else is
/// [`QueryTalkError::SnapshotConflict`] and leaves the store untouched.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns the latest snapshot of a thread.
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>>;

    /// Replaces the latest snapshot and appends it to the history.
    ///
    /// Fails with `SnapshotConflict` when `state.revision` is not the next
    /// revision of the thread.
    async fn save(&self, state: &ConversationState) -> Result<()>;

    /// Removes the latest snapshot. History is kept.
    ///
    /// Returns false when the thread had no snapshot.
    async fn remove(&self, thread_id: &str) -> Result<bool>;

    /// Returns every saved snapshot of a thread, oldest first.
    async fn history(&self, thread_id: &str) -> Result<Vec<ConversationState>>;

    /// Appends a feedback record and returns its id.
    async fn append_feedback(&self, record: &FeedbackRecord) -> Result<i64>;

    /// Returns the feedback recorded for a thread, oldest first.
    async fn feedback(&self, thread_id: &str) -> Result<Vec<FeedbackRecord>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    latest: HashMap<String, ConversationState>,
    history: HashMap<String, Vec<ConversationState>>,
    feedback: Vec<FeedbackRecord>,
}

/// A store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.inner().latest.get(thread_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        let mut inner = self.inner();
        let stored = inner
            .latest
            .get(&state.thread_id)
            .map_or(0, |latest| latest.revision);
        if state.revision != stored + 1 {
            return Err(QueryTalkError::SnapshotConflict(state.thread_id.clone()));
        }

        inner
            .latest
            .insert(state.thread_id.clone(), state.clone());
        inner
            .history
            .entry(state.thread_id.clone())
            .or_default()
            .push(state.clone());
        Ok(())
    }

    async fn remove(&self, thread_id: &str) -> Result<bool> {
        Ok(self.inner().latest.remove(thread_id).is_some())
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<ConversationState>> {
        Ok(self
            .inner()
            .history
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_feedback(&self, record: &FeedbackRecord) -> Result<i64> {
        let mut inner = self.inner();
        inner.feedback.push(record.clone());
        Ok(inner.feedback.len() as i64)
    }

    async fn feedback(&self, thread_id: &str) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .inner()
            .feedback
            .iter()
            .filter(|record| record.thread_id == thread_id)
            .cloned()
            .collect())
    }
}
