//! Export to write-once-read-many external storage.
//!
//! The sink is append-only from the system's point of view: records are
//! only ever written under a key derived deterministically from the stream
//! and range, so re-exporting a range overwrites the same object with the
//! same content instead of growing a second copy. The primary store
//! remains the source of truth; WORM is the off-database tamper-evidence
//! copy.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use chainlog_core::{AuditError, AuditEvent, SealMarker, StreamKey};
use chainlog_store::SqliteStore;

/// An append-only export target (filesystem directory, object store, …).
#[async_trait]
pub trait WormSink: Send + Sync {
    /// Store `bytes` under `key` (an opaque slash-separated path).
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), AuditError>;
}

/// Local-filesystem sink rooted at a configured directory.
#[derive(Debug, Clone)]
pub struct LocalWormSink {
    root: PathBuf,
}

impl LocalWormSink {
    /// Initialise a sink rooted at `root` (created if absent).
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| AuditError::Storage(format!("cannot create WORM root: {e}")))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl WormSink for LocalWormSink {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), AuditError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AuditError::Storage(format!("WORM write failed: {e}")))?;
        }
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| AuditError::Storage(format!("WORM write failed: {e}")))?;
        file.write_all(bytes)
            .await
            .map_err(|e| AuditError::Storage(format!("WORM write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| AuditError::Storage(format!("WORM write failed: {e}")))?;
        Ok(())
    }
}

/// One exported line: the full event plus the seal marker it was exported
/// under, if one covers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WormRecord {
    /// The exported event.
    pub event: AuditEvent,
    /// Seal marker covering this event at export time; `None` when the
    /// event lies past every seal's `up_to_time`.
    pub seal: Option<SealMarker>,
}

/// Streams committed ranges into a [`WormSink`] as JSON lines.
pub struct WormExporter {
    store: Arc<SqliteStore>,
    sink: Arc<dyn WormSink>,
}

impl WormExporter {
    /// Wire an exporter over its store and sink.
    pub fn new(store: Arc<SqliteStore>, sink: Arc<dyn WormSink>) -> Self {
        Self { store, sink }
    }

    /// Export the inclusive range `[start, end]` of `stream` in chain
    /// order; returns the number of exported events.
    pub async fn export_range(
        &self,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, AuditError> {
        let events = self
            .store
            .events_in_range(stream, Some(start), Some(end))
            .await?;
        let seal = self.store.latest_seal(stream).await?;

        let mut buf = Vec::new();
        for event in events.iter().cloned() {
            // A seal vouches only for events at or before its bound; an
            // exported event past it carries no marker.
            let covering = seal
                .clone()
                .filter(|s| s.up_to_time >= event.received_at);
            let record = WormRecord {
                event,
                seal: covering,
            };
            serde_json::to_writer(&mut buf, &record)
                .map_err(|e| AuditError::Storage(format!("WORM encoding failed: {e}")))?;
            buf.push(b'\n');
        }

        let key = export_key(stream, start, end);
        self.sink.put(&key, &buf).await?;
        info!(
            stream = %stream,
            key,
            exported = events.len(),
            "range exported to WORM storage"
        );
        Ok(events.len() as u64)
    }
}

/// Deterministic object key for a (stream, range) pair.
fn export_key(stream: &StreamKey, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "{}/{}/{}-{}.jsonl",
        stream.project_id,
        stream.environment_id,
        file_stamp(start),
        file_stamp(end)
    )
}

/// Filesystem-safe compact timestamp (UTC, millisecond precision).
fn file_stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%3fZ").to_string()
}
