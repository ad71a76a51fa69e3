//! Conversation snapshot persistence.
//!
//! The full state is stored as JSON; the cursor and the awaiting flag are
//! duplicated into columns so paused threads can be inspected with plain SQL.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

use super::StateDb;
use crate::error::{QueryTalkError, Result};
use crate::workflow::state::ConversationState;
use crate::workflow::store::{FeedbackRecord, SnapshotStore};

/// Raw database row for a snapshot.
#[derive(Debug, Clone, FromRow)]
struct SnapshotRow {
    state_json: String,
}

impl TryFrom<SnapshotRow> for ConversationState {
    type Error = QueryTalkError;

    fn try_from(row: SnapshotRow) -> Result<Self> {
        serde_json::from_str(&row.state_json).map_err(|e| {
            QueryTalkError::persistence(format!("Corrupted conversation snapshot: {e}"))
        })
    }
}

fn encode(state: &ConversationState) -> Result<String> {
    serde_json::to_string(state)
        .map_err(|e| QueryTalkError::persistence(format!("Failed to encode snapshot: {e}")))
}

/// Saves the latest snapshot of a thread and appends it to the history.
///
/// The row is only replaced when it still holds `state.revision - 1`; a
/// thread without a row accepts revision 1. Otherwise another process saved
/// the thread first and nothing is written.
pub async fn save_snapshot(pool: &SqlitePool, state: &ConversationState) -> Result<()> {
    let json = encode(state)?;
    let cursor = state.cursor.map(|node| node.as_str());
    let conflict = || QueryTalkError::SnapshotConflict(state.thread_id.clone());
    let previous = state.revision.checked_sub(1).ok_or_else(conflict)?;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| QueryTalkError::persistence(format!("Failed to begin transaction: {e}")))?;

    let updated = sqlx::query(
        r#"
        UPDATE conversation_snapshots
        SET cursor = ?, awaiting_user_reply = ?, state_json = ?, revision = ?,
            updated_at = datetime('now')
        WHERE thread_id = ? AND revision = ?
        "#,
    )
    .bind(cursor)
    .bind(state.awaiting_user_reply)
    .bind(&json)
    .bind(i64::from(state.revision))
    .bind(&state.thread_id)
    .bind(i64::from(previous))
    .execute(&mut *tx)
    .await
    .map_err(|e| QueryTalkError::persistence(format!("Failed to save snapshot: {e}")))?
    .rows_affected();

    if updated == 0 {
        if previous != 0 {
            return Err(conflict());
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO conversation_snapshots
                (thread_id, cursor, awaiting_user_reply, state_json, revision, updated_at)
            VALUES (?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(thread_id) DO NOTHING
            "#,
        )
        .bind(&state.thread_id)
        .bind(cursor)
        .bind(state.awaiting_user_reply)
        .bind(&json)
        .bind(i64::from(state.revision))
        .execute(&mut *tx)
        .await
        .map_err(|e| QueryTalkError::persistence(format!("Failed to save snapshot: {e}")))?
        .rows_affected();

        if inserted == 0 {
            return Err(conflict());
        }
    }

    sqlx::query("INSERT INTO snapshot_history (thread_id, cursor, state_json) VALUES (?, ?, ?)")
        .bind(&state.thread_id)
        .bind(cursor)
        .bind(&json)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            QueryTalkError::persistence(format!("Failed to append snapshot history: {e}"))
        })?;

    tx.commit()
        .await
        .map_err(|e| QueryTalkError::persistence(format!("Failed to commit snapshot: {e}")))?;

    Ok(())
}

/// Loads the latest snapshot of a thread.
pub async fn load_snapshot(
    pool: &SqlitePool,
    thread_id: &str,
) -> Result<Option<ConversationState>> {
    let row: Option<SnapshotRow> =
        sqlx::query_as("SELECT state_json FROM conversation_snapshots WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| QueryTalkError::persistence(format!("Failed to load snapshot: {e}")))?;

    row.map(ConversationState::try_from).transpose()
}

/// Deletes the latest snapshot of a thread. Returns false if none existed.
pub async fn delete_snapshot(pool: &SqlitePool, thread_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM conversation_snapshots WHERE thread_id = ?")
        .bind(thread_id)
        .execute(pool)
        .await
        .map_err(|e| QueryTalkError::persistence(format!("Failed to delete snapshot: {e}")))?;

    Ok(result.rows_affected() > 0)
}

/// Lists every saved snapshot of a thread, oldest first.
pub async fn list_snapshot_history(
    pool: &SqlitePool,
    thread_id: &str,
) -> Result<Vec<ConversationState>> {
    let rows: Vec<SnapshotRow> =
        sqlx::query_as("SELECT state_json FROM snapshot_history WHERE thread_id = ? ORDER BY id")
            .bind(thread_id)
            .fetch_all(pool)
            .await
            .map_err(|e| QueryTalkError::persistence(format!("Failed to list history: {e}")))?;

    rows.into_iter().map(ConversationState::try_from).collect()
}

#[async_trait]
impl SnapshotStore for StateDb {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        load_snapshot(self.pool(), thread_id).await
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        save_snapshot(self.pool(), state).await
    }

    async fn remove(&self, thread_id: &str) -> Result<bool> {
        delete_snapshot(self.pool(), thread_id).await
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<ConversationState>> {
        list_snapshot_history(self.pool(), thread_id).await
    }

    async fn append_feedback(&self, record: &FeedbackRecord) -> Result<i64> {
        super::record_feedback(self.pool(), record).await
    }

    async fn feedback(&self, thread_id: &str) -> Result<Vec<FeedbackRecord>> {
        super::list_feedback(self.pool(), thread_id).await
    }
}
