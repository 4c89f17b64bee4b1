//! Typed error surface of the library.
//!
//! Every public operation returns `Result<_, AuditError>`. The variants map
//! one-to-one onto the stable, language-neutral condition names exposed by
//! [`AuditError::code`]; front-ends key their status mapping off the code,
//! not the display text.

use crate::event::StreamKey;

/// Errors returned by the chainlog library surface.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The configuration record is internally inconsistent or incomplete.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The submission is malformed and never entered the pipeline.
    #[error("validation error: {0}")]
    Validation(String),
    /// No project/environment context is bound and none was supplied.
    #[error("no project/environment context bound")]
    ContextMissing,
    /// A bulk submission exceeds the configured event cap.
    #[error("bulk submission of {count} events exceeds the limit of {limit}")]
    BulkTooLarge {
        /// Number of events in the rejected submission.
        count: usize,
        /// Configured `max_bulk_events`.
        limit: usize,
    },
    /// The supplied external id already exists in the target stream.
    #[error("external id `{0}` already exists in this stream")]
    DuplicateExternalId(String),
    /// The requested event does not exist in the given scope.
    #[error("event not found")]
    NotFound,
    /// The operation exceeded its deadline; the event, if accepted, was
    /// moved to the backlog for retry.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),
    /// A concurrent writer violated the single-history guarantee of the
    /// stream; the transaction was rolled back.
    #[error("chain conflict: {0}")]
    ChainConflict(String),
    /// The per-stream backlog cap was reached; the event was not enqueued.
    #[error("backlog for stream {0} is full")]
    BacklogFull(StreamKey),
    /// The underlying store failed; the event, if accepted, was moved to
    /// the backlog for retry.
    #[error("storage error: {0}")]
    Storage(String),
    /// A cryptographic or verification-side integrity failure.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),
}

impl AuditError {
    /// Stable, language-neutral condition name for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::Validation(_) => "validation_error",
            Self::ContextMissing => "context_missing",
            Self::BulkTooLarge { .. } => "bulk_too_large",
            Self::DuplicateExternalId(_) => "duplicate_external_id",
            Self::NotFound => "not_found",
            Self::Timeout(_) => "timeout",
            Self::ChainConflict(_) => "chain_conflict",
            Self::BacklogFull(_) => "backlog_full",
            Self::Storage(_) => "storage_error",
            Self::IntegrityFailure(_) => "integrity_failure",
        }
    }

    /// Whether a failed commit with this error is worth retrying from the
    /// backlog. Caller mistakes and crypto faults are permanent; everything
    /// infrastructure-shaped is transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ChainConflict(_) | Self::Storage(_)
        )
    }
}
