//! Query filters, cursors, and result pages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canonical::{format_timestamp, parse_timestamp};
use crate::error::AuditError;
use crate::event::{AuditEvent, StreamKey};

/// Keyset cursor over `(received_at, id)`.
///
/// Encoded as `<timestamp>/<uuid>` so deep pages never pay an `OFFSET`
/// scan; the tuple comparison resumes exactly after the last row of the
/// previous page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// `received_at` of the last row already returned.
    pub received_at: DateTime<Utc>,
    /// Id of the last row already returned.
    pub id: Uuid,
}

impl Cursor {
    /// Position just after `event`.
    pub fn after(event: &AuditEvent) -> Self {
        Self {
            received_at: event.received_at,
            id: event.id,
        }
    }

    /// Opaque wire encoding.
    pub fn encode(&self) -> String {
        format!("{}/{}", format_timestamp(self.received_at), self.id)
    }

    /// Decode a cursor previously produced by [`Cursor::encode`].
    pub fn decode(s: &str) -> Result<Self, AuditError> {
        let (ts, id) = s
            .split_once('/')
            .ok_or_else(|| AuditError::Validation(format!("malformed cursor `{s}`")))?;
        Ok(Self {
            received_at: parse_timestamp(ts)
                .map_err(|_| AuditError::Validation(format!("malformed cursor `{s}`")))?,
            id: Uuid::parse_str(id)
                .map_err(|_| AuditError::Validation(format!("malformed cursor `{s}`")))?,
        })
    }
}

/// Filter for `query_events`. The stream is always required; everything
/// else narrows the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    /// Stream to query (required scope predicate).
    pub stream: StreamKey,
    /// Exact match on `action`.
    pub action: Option<String>,
    /// Exact match on `actor_id`.
    pub actor_id: Option<String>,
    /// Exact match on `target_id`.
    pub target_id: Option<String>,
    /// Lower bound (inclusive) on `received_at`.
    pub start: Option<DateTime<Utc>>,
    /// Upper bound (inclusive) on `received_at`.
    pub end: Option<DateTime<Utc>>,
    /// Substring match over `description`.
    pub description_contains: Option<String>,
    /// Page size.
    pub limit: u32,
    /// Resume position from a previous page.
    pub cursor: Option<Cursor>,
}

impl EventFilter {
    /// Unfiltered view of one stream with the default page size.
    pub fn for_stream(stream: StreamKey) -> Self {
        Self {
            stream,
            action: None,
            actor_id: None,
            target_id: None,
            start: None,
            end: None,
            description_contains: None,
            limit: 100,
            cursor: None,
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    /// Events in chain order.
    pub events: Vec<AuditEvent>,
    /// Cursor for the next page; `None` when this page is the last.
    pub next_cursor: Option<String>,
    /// Total rows matching the filter, ignoring pagination.
    pub total: u64,
}
