//! Ingest tasks and the persistent backlog.
//!
//! An ingest task is the durable record of an accepted submission; it is
//! deleted after a successful commit or converted into a backlog row when
//! the commit fails. The backlog is the retry queue the worker drains:
//! FIFO within a stream by row id, with attempt accounting and a
//! dead-letter flag so no row is ever silently dropped.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use chainlog_core::{format_timestamp, parse_timestamp, AuditError, EventInput, StreamKey};

use crate::{db_err, json_err, SqliteStore};

/// Durable record of an accepted submission awaiting commit.
#[derive(Debug, Clone)]
pub struct IngestTask {
    /// Task id.
    pub id: Uuid,
    /// Target stream.
    pub stream: StreamKey,
    /// Event id assigned at accept time; backlog replay commits under the
    /// same id.
    pub new_event_id: Uuid,
    /// Accept timestamp.
    pub received: DateTime<Utc>,
    /// The submission as accepted.
    pub input: EventInput,
}

impl IngestTask {
    /// Record acceptance of `input` into `stream`, assigning the event id
    /// if the client did not pre-assign one. The accept time also becomes
    /// `created_at` when the client supplied none, so a backlog replay
    /// keeps the original intent even though chain order reflects replay
    /// time.
    pub fn new(stream: StreamKey, mut input: EventInput, received: DateTime<Utc>) -> Self {
        let new_event_id = *input.id.get_or_insert_with(Uuid::new_v4);
        input.created_at.get_or_insert(received);
        Self {
            id: Uuid::new_v4(),
            new_event_id,
            stream,
            received,
            input,
        }
    }
}

/// One backlog row, ready for replay.
#[derive(Debug, Clone)]
pub struct BacklogRow {
    /// Row id; replay order within a stream.
    pub id: i64,
    /// Target stream.
    pub stream: StreamKey,
    /// Event id assigned at accept time.
    pub new_event_id: Uuid,
    /// Original accept timestamp.
    pub received: DateTime<Utc>,
    /// Serialized original submission.
    pub original_event: String,
    /// Failed replay attempts so far.
    pub attempts: u32,
    /// When the last attempt failed.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
}

impl BacklogRow {
    /// Deserialize the original submission.
    pub fn input(&self) -> Result<EventInput, AuditError> {
        serde_json::from_str(&self.original_event).map_err(|e| {
            AuditError::Validation(format!("backlog row {} is not replayable: {e}", self.id))
        })
    }
}

impl SqliteStore {
    /// Persist an accepted submission before attempting the commit.
    pub async fn insert_ingest_task(&self, task: &IngestTask) -> Result<(), AuditError> {
        sqlx::query(
            "INSERT INTO ingest_tasks
                 (id, project_id, environment_id, new_event_id, received, original_event)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(&task.stream.project_id)
        .bind(&task.stream.environment_id)
        .bind(task.new_event_id.to_string())
        .bind(format_timestamp(task.received))
        .bind(serde_json::to_string(&task.input).map_err(json_err)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Mark an ingest task processed after its event committed.
    pub async fn mark_ingest_processed(&self, task_id: Uuid) -> Result<(), AuditError> {
        sqlx::query("UPDATE ingest_tasks SET processed = 1 WHERE id = ?")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Drop an ingest task whose submission was rejected permanently.
    pub async fn delete_ingest_task(&self, task_id: Uuid) -> Result<(), AuditError> {
        sqlx::query("DELETE FROM ingest_tasks WHERE id = ?")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Move a failed ingest task into the backlog, atomically.
    ///
    /// Fails with `backlog_full` (leaving the ingest task in place) when
    /// the stream already has `cap_per_stream` rows waiting.
    pub async fn move_to_backlog(
        &self,
        task: &IngestTask,
        error: &str,
        cap_per_stream: u32,
    ) -> Result<i64, AuditError> {
        let mut tx = self.begin().await?;

        let waiting: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backlog
             WHERE project_id = ? AND environment_id = ? AND processed = 0 AND dead = 0",
        )
        .bind(&task.stream.project_id)
        .bind(&task.stream.environment_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if waiting >= i64::from(cap_per_stream) {
            return Err(AuditError::BacklogFull(task.stream.clone()));
        }

        let row = sqlx::query(
            "INSERT INTO backlog
                 (project_id, environment_id, new_event_id, received, original_event, last_error)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&task.stream.project_id)
        .bind(&task.stream.environment_id)
        .bind(task.new_event_id.to_string())
        .bind(format_timestamp(task.received))
        .bind(serde_json::to_string(&task.input).map_err(json_err)?)
        .bind(error)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM ingest_tasks WHERE id = ?")
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        row.try_get("id").map_err(db_err)
    }

    /// Oldest unprocessed, non-dead backlog rows, ordered by
    /// `(project, environment, id)` so the worker replays stream by stream
    /// in original accept order.
    pub async fn fetch_backlog_batch(&self, limit: u32) -> Result<Vec<BacklogRow>, AuditError> {
        let rows = sqlx::query(
            "SELECT id, project_id, environment_id, new_event_id, received,
                    original_event, attempts, last_attempt, last_error
             FROM backlog
             WHERE processed = 0 AND dead = 0
             ORDER BY project_id, environment_id, id
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|r| {
                let event_id: String = r.try_get("new_event_id").map_err(db_err)?;
                Ok(BacklogRow {
                    id: r.try_get("id").map_err(db_err)?,
                    stream: StreamKey {
                        project_id: r.try_get("project_id").map_err(db_err)?,
                        environment_id: r.try_get("environment_id").map_err(db_err)?,
                    },
                    new_event_id: Uuid::parse_str(&event_id).map_err(|e| {
                        AuditError::Storage(format!("corrupt backlog event id `{event_id}`: {e}"))
                    })?,
                    received: parse_timestamp(
                        &r.try_get::<String, _>("received").map_err(db_err)?,
                    )?,
                    original_event: r.try_get("original_event").map_err(db_err)?,
                    attempts: r.try_get::<i64, _>("attempts").map_err(db_err)? as u32,
                    last_attempt: r
                        .try_get::<Option<String>, _>("last_attempt")
                        .map_err(db_err)?
                        .map(|s| parse_timestamp(&s))
                        .transpose()?,
                    last_error: r.try_get("last_error").map_err(db_err)?,
                })
            })
            .collect()
    }

    /// Mark a backlog row processed after successful replay.
    pub async fn mark_backlog_processed(&self, id: i64) -> Result<(), AuditError> {
        sqlx::query("UPDATE backlog SET processed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a failed replay attempt; `dead` flags the row as dead-letter,
    /// excluding it from future ticks without deleting it.
    pub async fn bump_backlog_attempts(
        &self,
        id: i64,
        attempts: u32,
        error: &str,
        dead: bool,
    ) -> Result<(), AuditError> {
        sqlx::query(
            "UPDATE backlog SET attempts = ?, last_attempt = ?, last_error = ?, dead = ?
             WHERE id = ?",
        )
        .bind(i64::from(attempts))
        .bind(format_timestamp(Utc::now()))
        .bind(error)
        .bind(dead)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Unprocessed, non-dead rows waiting for one stream.
    pub async fn backlog_depth(&self, stream: &StreamKey) -> Result<u64, AuditError> {
        let waiting: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backlog
             WHERE project_id = ? AND environment_id = ? AND processed = 0 AND dead = 0",
        )
        .bind(&stream.project_id)
        .bind(&stream.environment_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(waiting as u64)
    }
}
