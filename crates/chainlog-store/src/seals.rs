//! Seal markers: declaring a prefix of a stream immutable.
//!
//! A seal never rewrites an event row; it records the count and tip hash
//! of the covered range so later audits can detect wholesale truncation.
//! The delete trigger installed by the migration consults this table.

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};

use chainlog_core::{format_timestamp, parse_timestamp, AuditError, SealMarker, StreamKey};

use crate::{db_err, SqliteStore};

impl SqliteStore {
    /// Count and tip hash of events with `received_at <= up_to`, read
    /// inside the caller's seal transaction.
    pub async fn count_and_tip_at(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        stream: &StreamKey,
        up_to: DateTime<Utc>,
    ) -> Result<(u64, Option<String>), AuditError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_events
             WHERE project_id = ? AND environment_id = ? AND received_at <= ?",
        )
        .bind(&stream.project_id)
        .bind(&stream.environment_id)
        .bind(format_timestamp(up_to))
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;

        let tip_hash: Option<String> = sqlx::query_scalar(
            "SELECT hash FROM audit_events
             WHERE project_id = ? AND environment_id = ? AND received_at <= ?
             ORDER BY received_at DESC, id DESC
             LIMIT 1",
        )
        .bind(&stream.project_id)
        .bind(&stream.environment_id)
        .bind(format_timestamp(up_to))
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok((count as u64, tip_hash))
    }

    /// Write a seal marker inside the caller's transaction.
    pub async fn insert_seal_marker(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        stream: &StreamKey,
        up_to: DateTime<Utc>,
        event_count: u64,
        tip_hash: Option<&str>,
    ) -> Result<SealMarker, AuditError> {
        let sealed_at = Utc::now();
        let row = sqlx::query(
            "INSERT INTO seal_markers
                 (project_id, environment_id, up_to_time, event_count, tip_hash, sealed_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&stream.project_id)
        .bind(&stream.environment_id)
        .bind(format_timestamp(up_to))
        .bind(event_count as i64)
        .bind(tip_hash)
        .bind(format_timestamp(sealed_at))
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(SealMarker {
            id: row.try_get("id").map_err(db_err)?,
            project_id: stream.project_id.clone(),
            environment_id: stream.environment_id.clone(),
            up_to_time: up_to,
            event_count,
            tip_hash: tip_hash.map(str::to_owned),
            sealed_at,
        })
    }

    /// All seal markers of a stream, oldest bound first.
    pub async fn list_seal_markers(
        &self,
        stream: &StreamKey,
    ) -> Result<Vec<SealMarker>, AuditError> {
        let rows = sqlx::query(
            "SELECT id, project_id, environment_id, up_to_time, event_count, tip_hash, sealed_at
             FROM seal_markers
             WHERE project_id = ? AND environment_id = ?
             ORDER BY up_to_time ASC, id ASC",
        )
        .bind(&stream.project_id)
        .bind(&stream.environment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|r| {
                Ok(SealMarker {
                    id: r.try_get("id").map_err(db_err)?,
                    project_id: r.try_get("project_id").map_err(db_err)?,
                    environment_id: r.try_get("environment_id").map_err(db_err)?,
                    up_to_time: parse_timestamp(
                        &r.try_get::<String, _>("up_to_time").map_err(db_err)?,
                    )?,
                    event_count: r.try_get::<i64, _>("event_count").map_err(db_err)? as u64,
                    tip_hash: r.try_get("tip_hash").map_err(db_err)?,
                    sealed_at: parse_timestamp(
                        &r.try_get::<String, _>("sealed_at").map_err(db_err)?,
                    )?,
                })
            })
            .collect()
    }

    /// The seal with the newest `up_to_time`, if any.
    pub async fn latest_seal(
        &self,
        stream: &StreamKey,
    ) -> Result<Option<SealMarker>, AuditError> {
        Ok(self.list_seal_markers(stream).await?.into_iter().last())
    }

    /// Upper bound of the sealed prefix of `stream`, if any seal exists.
    pub async fn sealed_through(
        &self,
        stream: &StreamKey,
    ) -> Result<Option<DateTime<Utc>>, AuditError> {
        Ok(self.latest_seal(stream).await?.map(|s| s.up_to_time))
    }
}
