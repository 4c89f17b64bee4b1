#![forbid(unsafe_code)]

//! **chainlog** – Append-only, tamper-evident audit-event store.
//!
//! For every `(project, environment)` stream the store maintains a hash
//! chain of signed events, so any later insertion, reordering, or mutation
//! is detectable. [`AuditClient`] is the public surface: it owns the
//! store, the chain engine, the ingest pipeline, and the background
//! workers, and binds the default stream context for its operations.
//!
//! ```no_run
//! use chainlog::{AuditClient, AuditConfig, Crud, CryptoConfig, EventInput};
//!
//! # async fn demo() -> Result<(), chainlog::AuditError> {
//! let (private_key_pem, public_key_pem) =
//!     chainlog::generate_keypair(Default::default())?;
//! let config = AuditConfig {
//!     crypto: CryptoConfig { private_key_pem, public_key_pem, ..Default::default() },
//!     project_id: Some("acme".into()),
//!     environment_id: Some("prod".into()),
//!     ..AuditConfig::default()
//! };
//! let client = AuditClient::connect(config).await?;
//!
//! let mut input = EventInput::new("user.login", Crud::Create);
//! input.actor_id = Some("u1".into());
//! let event = client.create_event(input).await?;
//! assert!(!event.hash.is_empty());
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::{AuditClient, QueryOptions};

pub use chainlog_core::{
    AuditConfig, AuditError, AuditEvent, BacklogConfig, Crud, CryptoConfig, Cursor,
    DatabaseConfig, EventFilter, EventInput, EventPage, FailureReason, HashAlgorithm, SealMarker,
    SignatureAlgorithm, StreamKey, ValidationFailure, ValidationReport, WormConfig,
};
pub use chainlog_crypto::{generate_keypair, CryptoService};
pub use chainlog_engine::{LocalWormSink, WormRecord, WormSink};
pub use chainlog_store::{BacklogRow, ChainTip, IngestTask, SqliteStore};
