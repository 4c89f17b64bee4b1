//! Verification reports and seal markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a stored event failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The re-derived digest differs from the stored `hash`.
    DigestMismatch,
    /// The stored signature does not verify over the canonical form.
    SignatureInvalid,
    /// `previous_hash` does not match the re-derived hash of the prior
    /// event in chain order.
    ChainBreak,
    /// The event claims to be genesis (`previous_hash` absent) in a
    /// position where a predecessor exists.
    MissingPrevious,
}

/// One failed event inside a [`ValidationReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// Id of the failing event.
    pub id: Uuid,
    /// First check that failed for this event.
    pub reason: FailureReason,
}

/// Outcome of a range verification. Per-event failures are data, not
/// errors: the call itself succeeds and the caller inspects the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Events examined.
    pub total: u64,
    /// Events that passed every check.
    pub verified: u64,
    /// Events that failed, in chain order.
    pub failed: Vec<ValidationFailure>,
}

impl ValidationReport {
    /// Whether every examined event verified.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A persisted seal: everything in the stream at or before `up_to_time` is
/// declared immutable. Markers only accumulate; they never rewrite rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealMarker {
    /// Marker row id.
    pub id: i64,
    /// Sealed project.
    pub project_id: String,
    /// Sealed environment.
    pub environment_id: String,
    /// Upper bound (inclusive) of the sealed range.
    pub up_to_time: DateTime<Utc>,
    /// Events covered at seal time.
    pub event_count: u64,
    /// Hash of the newest covered event, if any.
    pub tip_hash: Option<String>,
    /// When the seal was written.
    pub sealed_at: DateTime<Utc>,
}
