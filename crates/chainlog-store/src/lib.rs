#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chainlog-store** – SQLite-backed persistent store for the audit chain.
//!
//! This crate owns the relational schema (events, ingest tasks, backlog,
//! seal markers) and every statement that touches it. All statements are
//! parameter-bound; dynamic filters go through [`sqlx::QueryBuilder`].
//! Committed-row immutability is enforced in the schema itself: triggers
//! abort any `UPDATE` of an event row and any `DELETE` of a row covered by
//! a seal marker.
//!
//! The store also carries a broadcast channel of committed events so
//! callers can tail the log live; subscribers that fall behind may miss
//! events if the buffer overflows.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, Sqlite, SqlitePool, Transaction};
use tokio::sync::broadcast;

use chainlog_core::{AuditError, AuditEvent, DatabaseConfig};

mod events;
mod ingest;
mod seals;

pub use events::ChainTip;
pub use ingest::{BacklogRow, IngestTask};

/// Broadcast buffer size for the live event stream.
const DEFAULT_BROADCAST_SIZE: usize = 256;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A persistent audit-event store over a SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    broadcast_tx: broadcast::Sender<AuditEvent>,
}

impl SqliteStore {
    /// Open (or create) the store described by `config`.
    ///
    /// A config without a database path selects a private in-memory
    /// database; in that case the pool is pinned to a single connection,
    /// since every new in-memory connection would otherwise see its own
    /// empty database.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, AuditError> {
        let (options, max_connections) = match &config.path {
            Some(path) => (
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(BUSY_TIMEOUT),
                config.pool_size,
            ),
            None => (
                SqliteConnectOptions::new()
                    .filename(":memory:")
                    .busy_timeout(BUSY_TIMEOUT),
                1,
            ),
        };
        let options = if config.debug {
            options
        } else {
            options.disable_statement_logging()
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(Duration::from_millis(config.idle_timeout_ms))
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Self::from_pool(pool).await
    }

    /// Open a file-backed store at `path` with default pool settings.
    pub async fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        Self::open(&DatabaseConfig {
            path: Some(path.as_ref().to_path_buf()),
            ..DatabaseConfig::default()
        })
        .await
    }

    /// Open a private in-memory store. Useful for tests and ephemeral
    /// deployments; contents are lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, AuditError> {
        Self::open(&DatabaseConfig::default()).await
    }

    /// Build a store from an existing pool and run migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, AuditError> {
        let store = Self {
            pool,
            broadcast_tx: broadcast::channel(DEFAULT_BROADCAST_SIZE).0,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Create tables, indexes, and immutability triggers.
    async fn migrate(&self) -> Result<(), AuditError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id TEXT PRIMARY KEY,
                external_id TEXT,
                action TEXT NOT NULL,
                crud TEXT NOT NULL,
                actor_id TEXT,
                actor_name TEXT,
                actor_href TEXT,
                actor_fields TEXT NOT NULL,
                target_id TEXT,
                target_name TEXT,
                target_href TEXT,
                target_type TEXT,
                target_fields TEXT NOT NULL,
                group_id TEXT,
                group_name TEXT,
                description TEXT,
                component TEXT,
                version TEXT,
                source_ip TEXT,
                is_anonymous INTEGER NOT NULL,
                is_failure INTEGER NOT NULL,
                fields TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                received_at TEXT NOT NULL,
                hash TEXT NOT NULL,
                previous_hash TEXT,
                signature TEXT NOT NULL,
                project_id TEXT NOT NULL,
                environment_id TEXT NOT NULL
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ingest_tasks (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                environment_id TEXT NOT NULL,
                new_event_id TEXT NOT NULL,
                received TEXT NOT NULL,
                original_event TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS backlog (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                environment_id TEXT NOT NULL,
                new_event_id TEXT NOT NULL,
                received TEXT NOT NULL,
                original_event TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt TEXT,
                last_error TEXT,
                dead INTEGER NOT NULL DEFAULT 0
            ) STRICT
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS seal_markers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                environment_id TEXT NOT NULL,
                up_to_time TEXT NOT NULL,
                event_count INTEGER NOT NULL,
                tip_hash TEXT,
                sealed_at TEXT NOT NULL
            ) STRICT
            "#,
            "CREATE INDEX IF NOT EXISTS idx_events_stream
                ON audit_events(project_id, environment_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_stream_order
                ON audit_events(project_id, environment_id, received_at, id)",
            "CREATE INDEX IF NOT EXISTS idx_events_created ON audit_events(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_actor ON audit_events(actor_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_target ON audit_events(target_id)",
            "CREATE INDEX IF NOT EXISTS idx_events_action ON audit_events(action)",
            // Dedupe key is unique per stream when supplied.
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_external
                ON audit_events(project_id, environment_id, external_id)
                WHERE external_id IS NOT NULL",
            // At most one successor per event, at most one genesis per
            // stream: the chain cannot fork even if a writer slips past
            // the engine's per-stream lock.
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_prev
                ON audit_events(project_id, environment_id, previous_hash)
                WHERE previous_hash IS NOT NULL",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_genesis
                ON audit_events(project_id, environment_id)
                WHERE previous_hash IS NULL",
            "CREATE INDEX IF NOT EXISTS idx_backlog_pending
                ON backlog(project_id, environment_id, id)
                WHERE processed = 0 AND dead = 0",
            "CREATE INDEX IF NOT EXISTS idx_seals_stream
                ON seal_markers(project_id, environment_id, up_to_time)",
            // Committed rows are immutable; sealing additionally freezes
            // them against deletion.
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_events_immutable
            BEFORE UPDATE ON audit_events
            BEGIN
                SELECT RAISE(ABORT, 'audit_events rows are immutable');
            END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_events_seal_guard
            BEFORE DELETE ON audit_events
            FOR EACH ROW
            WHEN EXISTS (
                SELECT 1 FROM seal_markers
                WHERE project_id = OLD.project_id
                  AND environment_id = OLD.environment_id
                  AND up_to_time >= OLD.received_at
            )
            BEGIN
                SELECT RAISE(ABORT, 'row is covered by a seal marker');
            END
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Begin a transaction on the pool.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, AuditError> {
        self.pool.begin().await.map_err(db_err)
    }

    /// Commit a transaction previously opened with [`SqliteStore::begin`].
    pub async fn commit(&self, tx: Transaction<'static, Sqlite>) -> Result<(), AuditError> {
        tx.commit().await.map_err(db_err)
    }

    /// Subscribe to the live stream of committed events.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Broadcast a committed event to live subscribers. Lagging or absent
    /// subscribers are not an error.
    pub fn publish(&self, event: &AuditEvent) {
        let _ = self.broadcast_tx.send(event.clone());
    }

    /// Direct pool access, for callers that need raw statements (tests,
    /// tooling).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map a database error onto the typed surface. Unique-index violations
/// surface as `chain_conflict`: they mean a writer lost the race for a
/// chain slot (or replayed a dedupe key) and the transaction was rolled
/// back.
pub(crate) fn db_err(e: sqlx::Error) -> AuditError {
    match &e {
        sqlx::Error::RowNotFound => AuditError::NotFound,
        sqlx::Error::Database(db)
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
        {
            AuditError::ChainConflict(db.message().to_string())
        }
        _ => AuditError::Storage(e.to_string()),
    }
}

pub(crate) fn json_err(e: serde_json::Error) -> AuditError {
    AuditError::Storage(format!("stored JSON column is corrupt: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = SqliteStore::open_path(&path).await.unwrap();
            store.close().await;
        }
        // Reopening runs migrations against the existing schema.
        let store = SqliteStore::open_path(&path).await.unwrap();
        store.close().await;
    }
}
