//! Schema versioning and migrations for the state database.
//!
//! Manages database schema evolution with forward-only migrations.

use crate::error::{QueryTalkError, Result};
use sqlx::sqlite::SqlitePool;
use tracing::info;

const CURRENT_VERSION: i32 = 2;

/// Runs all pending migrations on the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    ensure_schema_versions_table(pool).await?;

    let current = get_current_version(pool).await?;

    if current > CURRENT_VERSION {
        return Err(QueryTalkError::persistence(format!(
            "Database schema version ({}) is newer than supported version ({}). \
             Please upgrade querytalk to the latest version.",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        info!(
            "Migrating state database from version {} to {}",
            current, CURRENT_VERSION
        );
        run_pending_migrations(pool, current).await?;
    }

    Ok(())
}

/// Ensures the schema_versions table exists.
async fn ensure_schema_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        QueryTalkError::persistence(format!("Failed to create schema_versions table: {e}"))
    })?;

    Ok(())
}

/// Gets the current schema version.
async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM schema_versions")
        .fetch_optional(pool)
        .await
        .map_err(|e| QueryTalkError::persistence(format!("Failed to get schema version: {e}")))?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Runs migrations from the current version to the target version.
async fn run_pending_migrations(pool: &SqlitePool, from_version: i32) -> Result<()> {
    for version in (from_version + 1)..=CURRENT_VERSION {
        run_migration(pool, version).await?;
        record_version(pool, version).await?;
        info!("Applied migration v{}", version);
    }
    Ok(())
}

/// Records a completed migration version.
async fn record_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| QueryTalkError::persistence(format!("Failed to record migration: {e}")))?;
    Ok(())
}

/// Runs a specific migration version.
async fn run_migration(pool: &SqlitePool, version: i32) -> Result<()> {
    match version {
        1 => migration_v1(pool).await,
        2 => migration_v2(pool).await,
        _ => Err(QueryTalkError::persistence(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: snapshots, snapshot history and feedback log.
async fn migration_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_snapshots (
            thread_id TEXT PRIMARY KEY,
            cursor TEXT,
            awaiting_user_reply INTEGER NOT NULL DEFAULT 0,
            state_json TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        QueryTalkError::persistence(format!("Failed to create conversation_snapshots table: {e}"))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshot_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id TEXT NOT NULL,
            cursor TEXT,
            state_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        QueryTalkError::persistence(format!("Failed to create snapshot_history table: {e}"))
    })?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_snapshot_history_thread
        ON snapshot_history(thread_id, id)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| QueryTalkError::persistence(format!("Failed to create history index: {e}")))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feedback_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id TEXT NOT NULL,
            user_question TEXT NOT NULL,
            original_question TEXT NOT NULL,
            clarifications TEXT NOT NULL,
            table_names TEXT NOT NULL,
            sql_query TEXT NOT NULL,
            query_result TEXT NOT NULL,
            final_answer TEXT NOT NULL,
            satisfied INTEGER NOT NULL CHECK (satisfied IN (0, 1)),
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| QueryTalkError::persistence(format!("Failed to create feedback_log table: {e}")))?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_feedback_log_thread
        ON feedback_log(thread_id)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| QueryTalkError::persistence(format!("Failed to create feedback index: {e}")))?;

    Ok(())
}

/// Migration v2: revision counter for compare-and-swap saves.
///
/// Rows written before this version start at revision 0, which matches the
/// default of snapshots that carry no revision.
async fn migration_v2(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "ALTER TABLE conversation_snapshots ADD COLUMN revision INTEGER NOT NULL DEFAULT 0",
    )
    .execute(pool)
    .await
    .map_err(|e| QueryTalkError::persistence(format!("Failed to add revision column: {e}")))?;

    Ok(())
}
