//! The audit-log client: lifecycle, context binding, and operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use chainlog_core::{
    canonical_event_bytes, AuditConfig, AuditError, AuditEvent, Cursor, EventFilter, EventInput,
    EventPage, StreamKey, ValidationReport,
};
use chainlog_crypto::CryptoService;
use chainlog_engine::{
    BacklogWorker, ChainEngine, IngestPipeline, LocalWormSink, PipelineOptions, Sealer, Verifier,
    WormExporter,
};
use chainlog_store::SqliteStore;

/// Caller-facing query options; the stream comes from the client context
/// (or the `_in` variant's explicit stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
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
    /// Opaque cursor from a previous page.
    pub cursor: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
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

/// Handle to one audit-log store: owns the connection pool, the crypto
/// service, and the background workers. Cheap operations borrow `&self`;
/// the handle is `Send + Sync` and meant to be shared.
pub struct AuditClient {
    config: AuditConfig,
    store: Arc<SqliteStore>,
    crypto: Arc<CryptoService>,
    pipeline: IngestPipeline,
    verifier: Verifier,
    sealer: Sealer,
    exporter: Option<WormExporter>,
    worker: Arc<BacklogWorker>,
    context: RwLock<Option<StreamKey>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AuditClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditClient").finish_non_exhaustive()
    }
}

impl AuditClient {
    /// Validate `config`, open the store, and start the background
    /// workers.
    pub async fn connect(config: AuditConfig) -> Result<Self, AuditError> {
        config.validate()?;
        let crypto = Arc::new(CryptoService::from_config(&config.crypto)?);
        let store = Arc::new(SqliteStore::open(&config.database).await?);
        let engine = Arc::new(ChainEngine::new(store.clone(), crypto.clone()));

        let pipeline = IngestPipeline::new(
            store.clone(),
            engine.clone(),
            PipelineOptions {
                create_event_timeout_ms: config.create_event_timeout_ms,
                max_bulk_events: config.max_bulk_events,
                backlog_cap_per_stream: config.backlog.cap_per_stream,
            },
        );
        let verifier = Verifier::new(store.clone(), crypto.clone());
        let sealer = Sealer::new(store.clone());
        let exporter = if config.worm.enabled {
            let path = config.worm.storage_path.clone().ok_or_else(|| {
                AuditError::InvalidConfiguration("worm.storage_path is required".into())
            })?;
            Some(WormExporter::new(
                store.clone(),
                Arc::new(LocalWormSink::new(path)?),
            ))
        } else {
            None
        };

        let worker = Arc::new(BacklogWorker::new(
            store.clone(),
            engine.clone(),
            config.backlog.clone(),
        ));
        let mut tasks = vec![worker.spawn()];

        let shutdown = watch::channel(false).0;
        if let Some(interval_s) = config.scheduled_validation_interval_s {
            tasks.push(spawn_validation_sweep(
                store.clone(),
                crypto.clone(),
                interval_s,
                config.partition_days,
                shutdown.subscribe(),
            ));
        }

        let context = match (&config.project_id, &config.environment_id) {
            (Some(project), Some(environment)) => {
                Some(StreamKey::new(project.clone(), environment.clone()))
            }
            _ => None,
        };

        Ok(Self {
            config,
            store,
            crypto,
            pipeline,
            verifier,
            sealer,
            exporter,
            worker,
            context: RwLock::new(context),
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Bind the default stream for subsequent context-less calls.
    pub async fn set_context(
        &self,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
    ) {
        *self.context.write().await = Some(StreamKey::new(project_id, environment_id));
    }

    /// The bound context, or `context_missing`.
    async fn context(&self) -> Result<StreamKey, AuditError> {
        self.context
            .read()
            .await
            .clone()
            .ok_or(AuditError::ContextMissing)
    }

    /// The underlying store (advanced callers, tooling, tests).
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    //─────────────────────────────
    //  Write path
    //─────────────────────────────

    /// Submit one event into the bound stream.
    pub async fn create_event(&self, input: EventInput) -> Result<AuditEvent, AuditError> {
        let stream = self.context().await?;
        self.create_event_in(&stream, input).await
    }

    /// Submit one event into an explicit stream.
    pub async fn create_event_in(
        &self,
        stream: &StreamKey,
        input: EventInput,
    ) -> Result<AuditEvent, AuditError> {
        self.pipeline.submit(stream, input).await
    }

    /// Submit a batch into the bound stream; atomic per batch.
    pub async fn create_events(
        &self,
        inputs: Vec<EventInput>,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let stream = self.context().await?;
        self.create_events_in(&stream, inputs).await
    }

    /// Submit a batch into an explicit stream; atomic per batch.
    pub async fn create_events_in(
        &self,
        stream: &StreamKey,
        inputs: Vec<EventInput>,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        self.pipeline.submit_bulk(stream, inputs).await
    }

    //─────────────────────────────
    //  Read path
    //─────────────────────────────

    /// Fetch one event from the bound stream.
    pub async fn get_event(&self, id: Uuid) -> Result<AuditEvent, AuditError> {
        let stream = self.context().await?;
        self.get_event_in(&stream, id).await
    }

    /// Fetch one event from an explicit stream.
    pub async fn get_event_in(
        &self,
        stream: &StreamKey,
        id: Uuid,
    ) -> Result<AuditEvent, AuditError> {
        self.store
            .get_event(id, stream)
            .await?
            .ok_or(AuditError::NotFound)
    }

    /// Query the bound stream.
    pub async fn query_events(&self, options: QueryOptions) -> Result<EventPage, AuditError> {
        let stream = self.context().await?;
        self.query_events_in(&stream, options).await
    }

    /// Query an explicit stream.
    pub async fn query_events_in(
        &self,
        stream: &StreamKey,
        options: QueryOptions,
    ) -> Result<EventPage, AuditError> {
        let cursor = options.cursor.as_deref().map(Cursor::decode).transpose()?;
        let filter = EventFilter {
            stream: stream.clone(),
            action: options.action,
            actor_id: options.actor_id,
            target_id: options.target_id,
            start: options.start,
            end: options.end,
            description_contains: options.description_contains,
            limit: options.limit,
            cursor,
        };
        let page = self.store.query_events(&filter).await?;

        if self.config.validate_on_query {
            for event in &page.events {
                let canonical = canonical_event_bytes(event)?;
                if self.crypto.digest_hex(&canonical) != event.hash {
                    return Err(AuditError::IntegrityFailure(format!(
                        "stored digest mismatch on event {}",
                        event.id
                    )));
                }
            }
        }
        Ok(page)
    }

    /// Subscribe to the live stream of committed events (all streams).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AuditEvent> {
        self.store.subscribe()
    }

    //─────────────────────────────
    //  Integrity
    //─────────────────────────────

    /// Verify the bound stream over an inclusive time range.
    pub async fn validate_events(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<ValidationReport, AuditError> {
        let stream = self.context().await?;
        self.validate_events_in(&stream, start, end).await
    }

    /// Verify an explicit stream over an inclusive time range.
    pub async fn validate_events_in(
        &self,
        stream: &StreamKey,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<ValidationReport, AuditError> {
        self.verifier.validate_range(stream, start, end).await
    }

    /// Seal the bound stream up to `up_to` (default: now minus the
    /// configured `seal_after_days`). Returns how many events the seal
    /// covers.
    pub async fn seal_events(&self, up_to: Option<DateTime<Utc>>) -> Result<u64, AuditError> {
        let stream = self.context().await?;
        self.seal_events_in(&stream, up_to).await
    }

    /// Seal an explicit stream.
    pub async fn seal_events_in(
        &self,
        stream: &StreamKey,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<u64, AuditError> {
        let up_to = up_to.unwrap_or_else(|| {
            Utc::now() - chrono::Duration::days(i64::from(self.config.seal_after_days))
        });
        let marker = self.sealer.seal(stream, up_to).await?;
        Ok(marker.event_count)
    }

    /// Export a range of the bound stream to WORM storage; returns the
    /// exported-event count. Requires `worm.enabled`.
    pub async fn export_to_worm(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, AuditError> {
        let stream = self.context().await?;
        self.export_to_worm_in(&stream, start, end).await
    }

    /// Export a range of an explicit stream to WORM storage.
    pub async fn export_to_worm_in(
        &self,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, AuditError> {
        let exporter = self.exporter.as_ref().ok_or_else(|| {
            AuditError::InvalidConfiguration("WORM export is not enabled".into())
        })?;
        exporter.export_range(stream, start, end).await
    }

    /// Run one backlog drain tick immediately, in addition to the
    /// scheduled ticks. Returns how many parked events were committed.
    /// Useful for embedders that want their own retry cadence.
    pub async fn drain_backlog_once(&self) -> Result<u64, AuditError> {
        self.worker.drain_once().await
    }

    //─────────────────────────────
    //  Lifecycle
    //─────────────────────────────

    /// Stop the background workers, wait for them to finish, and close the
    /// pool. Events parked in the backlog stay durable for the next start.
    pub async fn close(&self) -> Result<(), AuditError> {
        self.worker.stop();
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().await.drain(..) {
            if let Err(error) = task.await {
                warn!(%error, "background task ended abnormally");
            }
        }
        self.store.close().await;
        Ok(())
    }
}

/// Periodic integrity sweep over the trailing `partition_days` window of
/// every known stream; failures are logged, never raised.
fn spawn_validation_sweep(
    store: Arc<SqliteStore>,
    crypto: Arc<CryptoService>,
    interval_s: u64,
    partition_days: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let verifier = Verifier::new(store.clone(), crypto);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let streams = match store.list_streams().await {
                        Ok(streams) => streams,
                        Err(error) => {
                            warn!(%error, "validation sweep could not list streams");
                            continue;
                        }
                    };
                    let start = Utc::now() - chrono::Duration::days(i64::from(partition_days));
                    for stream in streams {
                        match verifier.validate_range(&stream, Some(start), None).await {
                            Ok(report) if report.is_clean() => {}
                            Ok(report) => warn!(
                                stream = %stream,
                                failed = report.failed.len(),
                                total = report.total,
                                "scheduled validation found integrity failures"
                            ),
                            Err(error) => {
                                warn!(stream = %stream, %error, "scheduled validation failed")
                            }
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
