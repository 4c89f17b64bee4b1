#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chainlog-core** – Shared data model for the chainlog audit store.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It defines the audit event model, the deterministic canonical byte form
//! used as the signing input, the typed error surface, and the configuration
//! record. It intentionally makes no assumptions about I/O, cryptography
//! engines, or storage.

pub mod canonical;
pub mod config;
pub mod error;
pub mod event;
pub mod query;
pub mod report;

pub use canonical::{canonical_event_bytes, format_timestamp, parse_timestamp};
pub use config::{
    AuditConfig, BacklogConfig, CryptoConfig, DatabaseConfig, HashAlgorithm, SignatureAlgorithm,
    WormConfig,
};
pub use error::AuditError;
pub use event::{AuditEvent, Crud, EventInput, StreamKey};
pub use query::{Cursor, EventFilter, EventPage};
pub use report::{FailureReason, SealMarker, ValidationFailure, ValidationReport};

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        canonical_event_bytes, AuditConfig, AuditError, AuditEvent, Crud, Cursor, EventFilter,
        EventInput, EventPage, FailureReason, HashAlgorithm, SealMarker, SignatureAlgorithm,
        StreamKey, ValidationFailure, ValidationReport,
    };
}
