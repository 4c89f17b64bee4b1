//! Two-phase accept/commit ingest path.
//!
//! Accept writes a durable ingest task and returns the assigned event id;
//! commit drives the chain engine under a deadline. A transient commit
//! failure moves the task to the backlog (the caller sees the error, and
//! the event surfaces later once the worker drains it); a permanent
//! rejection deletes the task and never retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use chainlog_core::{AuditError, AuditEvent, EventInput, StreamKey};
use chainlog_store::{IngestTask, SqliteStore};

use crate::chain::ChainEngine;

/// Tuning knobs for the ingest pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Deadline for a single commit, in milliseconds.
    pub create_event_timeout_ms: u64,
    /// Cap on events per bulk submission.
    pub max_bulk_events: usize,
    /// Per-stream backlog cap enforced when a failed commit is enqueued.
    pub backlog_cap_per_stream: u32,
}

/// Accepts submissions, commits them through the chain engine, and parks
/// failures in the backlog.
pub struct IngestPipeline {
    store: Arc<SqliteStore>,
    engine: Arc<ChainEngine>,
    options: PipelineOptions,
}

impl IngestPipeline {
    /// Wire the pipeline over its engine and store.
    pub fn new(store: Arc<SqliteStore>, engine: Arc<ChainEngine>, options: PipelineOptions) -> Self {
        Self {
            store,
            engine,
            options,
        }
    }

    /// Submit one event: validate, accept durably, commit under deadline.
    pub async fn submit(
        &self,
        stream: &StreamKey,
        input: EventInput,
    ) -> Result<AuditEvent, AuditError> {
        input.validate()?;

        let task = IngestTask::new(stream.clone(), input, Utc::now());
        self.store.insert_ingest_task(&task).await?;

        let deadline = Duration::from_millis(self.options.create_event_timeout_ms);
        let commit = self.engine.append(stream, task.input.clone());
        match tokio::time::timeout(deadline, commit).await {
            Ok(Ok(event)) => {
                self.store.mark_ingest_processed(task.id).await?;
                Ok(event)
            }
            Ok(Err(err)) if err.is_transient() => {
                self.park(&task, &err).await?;
                Err(err)
            }
            Ok(Err(err)) => {
                // Caller error or crypto fault: retrying cannot help.
                self.store.delete_ingest_task(task.id).await?;
                Err(err)
            }
            Err(_) => {
                let err = AuditError::Timeout(self.options.create_event_timeout_ms);
                self.park(&task, &err).await?;
                Err(err)
            }
        }
    }

    /// Submit a batch: all-or-nothing through a single chain transaction.
    pub async fn submit_bulk(
        &self,
        stream: &StreamKey,
        inputs: Vec<EventInput>,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        if inputs.len() > self.options.max_bulk_events {
            return Err(AuditError::BulkTooLarge {
                count: inputs.len(),
                limit: self.options.max_bulk_events,
            });
        }
        for input in &inputs {
            input.validate()?;
        }

        let received = Utc::now();
        let mut tasks = Vec::with_capacity(inputs.len());
        for input in inputs {
            let task = IngestTask::new(stream.clone(), input, received);
            self.store.insert_ingest_task(&task).await?;
            tasks.push(task);
        }

        let deadline = Duration::from_millis(self.options.create_event_timeout_ms);
        let batch: Vec<EventInput> = tasks.iter().map(|t| t.input.clone()).collect();
        let commit = self.engine.append_batch(stream, batch);
        match tokio::time::timeout(deadline, commit).await {
            Ok(Ok(events)) => {
                for task in &tasks {
                    self.store.mark_ingest_processed(task.id).await?;
                }
                Ok(events)
            }
            Ok(Err(err)) if err.is_transient() => {
                for task in &tasks {
                    self.park(task, &err).await?;
                }
                Err(err)
            }
            Ok(Err(err)) => {
                for task in &tasks {
                    self.store.delete_ingest_task(task.id).await?;
                }
                Err(err)
            }
            Err(_) => {
                let err = AuditError::Timeout(self.options.create_event_timeout_ms);
                for task in &tasks {
                    self.park(task, &err).await?;
                }
                Err(err)
            }
        }
    }

    async fn park(&self, task: &IngestTask, err: &AuditError) -> Result<(), AuditError> {
        let backlog_id = self
            .store
            .move_to_backlog(task, &err.to_string(), self.options.backlog_cap_per_stream)
            .await?;
        warn!(
            stream = %task.stream,
            event_id = %task.new_event_id,
            backlog_id,
            error = %err,
            "commit failed; event parked in backlog for retry"
        );
        Ok(())
    }
}
