#![forbid(unsafe_code)]

//! **chainlog-engine** – The write path and the audit machinery around it.
//!
//! Four cooperating pieces live here:
//!
//! * [`ChainEngine`] – serialized per-stream appends: read the tip under
//!   the stream lock, link, digest, sign, insert, commit.
//! * [`IngestPipeline`] – the accept/commit two-phase write path with a
//!   deadline; failed commits land in the persistent backlog.
//! * [`BacklogWorker`] – background drain of the backlog with bounded
//!   retries, exponential backoff, and dead-lettering.
//! * [`Verifier`] / [`Sealer`] / [`WormExporter`] – offline integrity
//!   checks, seal markers, and export to write-once storage.

mod chain;
mod pipeline;
mod verify;
mod worker;
mod worm;

pub use chain::ChainEngine;
pub use pipeline::{IngestPipeline, PipelineOptions};
pub use verify::{Sealer, Verifier};
pub use worker::BacklogWorker;
pub use worm::{LocalWormSink, WormExporter, WormRecord, WormSink};
