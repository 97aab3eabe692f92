#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-store** – SQLite-backed relational state store for the hive
//! control plane.
//!
//! Durable home of users, agents, ownership and sharing, API keys, the
//! permission graph, schedules, executions, activities, and chat history.
//! The store operates as a single-writer logical node with many readers and
//! exposes typed, transactional operations per entity; every mutation that
//! crosses entities happens inside one transaction.
//!
//! Activities and executions are append-mostly: rows are never updated in
//! place except to transition execution status and seal timestamps.

use std::path::Path;

use chrono::{DateTime, Utc};
use hive_types::{HiveError, HiveResult};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

mod agents;
mod chat;
mod ledger;
mod rows;
mod schedules;
mod users;

pub use rows::{
    ActivityRecord, AgentRecord, ApiKeyRecord, ChatMessageRecord, ChatSessionRecord,
    ExecutionRecord, NewActivity, NewExecution, ScheduleRecord, UserRecord,
};

/// Shared handle to the relational store.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open or create the database at `path` and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> HiveResult<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .map_err(db_err)?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database. Used by tests.
    pub async fn in_memory() -> HiveResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and run migrations.
    pub async fn from_pool(pool: SqlitePool) -> HiveResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Underlying pool, for transaction composition inside this crate.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> HiveResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }
}

/// Map driver errors onto the workspace taxonomy.
pub(crate) fn db_err(err: sqlx::Error) -> HiveError {
    match &err {
        sqlx::Error::RowNotFound => HiveError::NotFound("row not found".to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            HiveError::Conflict(format!("unique constraint: {db}"))
        }
        _ => HiveError::DependencyUnavailable(format!("state store: {err}")),
    }
}

/// Render a timestamp in the stable stored form. Fixed microsecond width
/// keeps lexicographic order on the TEXT columns chronological.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub(crate) fn parse_ts(raw: &str) -> HiveResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HiveError::Internal(format!("bad stored timestamp {raw:?}: {e}")))
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        is_admin INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agents (
        name TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        template TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        is_system INTEGER NOT NULL DEFAULT 0,
        orphaned INTEGER NOT NULL DEFAULT 0,
        config TEXT NOT NULL,
        created_at TEXT NOT NULL
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_shares (
        agent TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (agent, user_id)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        digest TEXT NOT NULL UNIQUE,
        salt TEXT NOT NULL,
        scope TEXT NOT NULL,
        user_id TEXT,
        agent TEXT,
        created_at TEXT NOT NULL
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS permission_edges (
        source TEXT NOT NULL,
        target TEXT NOT NULL,
        PRIMARY KEY (source, target)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schedules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent TEXT NOT NULL,
        cron TEXT NOT NULL,
        timezone TEXT NOT NULL DEFAULT 'UTC',
        message TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        parallel INTEGER NOT NULL DEFAULT 0,
        last_run_at TEXT,
        next_run_at TEXT,
        created_at TEXT NOT NULL
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent TEXT NOT NULL,
        schedule_id INTEGER,
        queue_id TEXT,
        input TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        source_agent TEXT,
        status TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        duration_ms INTEGER,
        cost_usd REAL,
        tokens INTEGER,
        transcript TEXT,
        error TEXT,
        created_at TEXT NOT NULL
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent TEXT NOT NULL,
        activity_type TEXT NOT NULL,
        state TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER,
        parent_activity_id INTEGER,
        related_execution_id INTEGER,
        related_message_id INTEGER,
        triggered_by TEXT NOT NULL,
        details TEXT NOT NULL,
        created_at TEXT NOT NULL
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent TEXT NOT NULL,
        user_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (agent, user_id)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        cost_usd REAL,
        context_tokens INTEGER,
        tool_summary TEXT,
        execution_ms INTEGER,
        created_at TEXT NOT NULL
    ) STRICT
    "#,
    "CREATE INDEX IF NOT EXISTS idx_activities_agent_created
        ON activities(agent, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_activities_type ON activities(activity_type)",
    "CREATE INDEX IF NOT EXISTS idx_activities_parent ON activities(parent_activity_id)",
    "CREATE INDEX IF NOT EXISTS idx_activities_execution ON activities(related_execution_id)",
    "CREATE INDEX IF NOT EXISTS idx_executions_agent_created
        ON executions(agent, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(enabled, next_run_at)",
    "CREATE INDEX IF NOT EXISTS idx_edges_source ON permission_edges(source)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = StateStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");

        {
            let store = StateStore::open(&path).await.unwrap();
            store.create_user("owner@example.com", false).await.unwrap();
            store.close().await;
        }

        let store = StateStore::open(&path).await.unwrap();
        let user = store.user_by_email("owner@example.com").await.unwrap();
        assert!(user.is_some());
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
