//! Per-stream serialized linking of new events onto the chain tip.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;
use uuid::Uuid;

use chainlog_core::{canonical_event_bytes, AuditError, AuditEvent, EventInput, StreamKey};
use chainlog_crypto::CryptoService;
use chainlog_store::{ChainTip, SqliteStore};

/// Registry of per-stream append locks.
///
/// The contract is exactly one chain-append per stream at a time; streams
/// never contend with each other. Entries are created on first touch and
/// kept for the life of the engine (the set of live streams is small and
/// tenant-bounded).
#[derive(Default)]
struct StreamLocks {
    inner: Mutex<HashMap<StreamKey, Arc<Mutex<()>>>>,
}

impl StreamLocks {
    async fn acquire(&self, stream: &StreamKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(stream.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Builds and persists chain-linked, signed audit events.
pub struct ChainEngine {
    store: Arc<SqliteStore>,
    crypto: Arc<CryptoService>,
    locks: StreamLocks,
}

impl ChainEngine {
    /// Wire the engine over its store and crypto service.
    pub fn new(store: Arc<SqliteStore>, crypto: Arc<CryptoService>) -> Self {
        Self {
            store,
            crypto,
            locks: StreamLocks::default(),
        }
    }

    /// The store this engine writes to.
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// The crypto service events are signed with.
    pub fn crypto(&self) -> &Arc<CryptoService> {
        &self.crypto
    }

    /// Append one event to `stream` and return it committed.
    ///
    /// Concurrent submitters to the same stream serialize on the stream
    /// lock; submitters to different streams proceed in parallel. The tip
    /// is always re-read inside the transaction, never cached.
    pub async fn append(
        &self,
        stream: &StreamKey,
        input: EventInput,
    ) -> Result<AuditEvent, AuditError> {
        let _guard = self.locks.acquire(stream).await;

        let mut tx = self.store.begin().await?;
        let tip = self.store.chain_tip(&mut tx, stream).await?;
        if let Some(external_id) = &input.external_id {
            if self.store.has_external_id(&mut tx, stream, external_id).await? {
                return Err(AuditError::DuplicateExternalId(external_id.clone()));
            }
        }

        let event = self.build_event(stream, input, tip.as_ref())?;
        self.store.insert_event(&mut tx, &event).await?;
        self.store.commit(tx).await?;

        self.store.publish(&event);
        Ok(event)
    }

    /// Append a batch to `stream` inside a single transaction.
    ///
    /// The stream lock is taken once for the whole batch; any failure rolls
    /// the entire batch back and the caller must resubmit. Size limits are
    /// the caller's concern (the pipeline rejects oversized batches before
    /// any database work).
    pub async fn append_batch(
        &self,
        stream: &StreamKey,
        inputs: Vec<EventInput>,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let _guard = self.locks.acquire(stream).await;

        let mut tx = self.store.begin().await?;
        let mut tip = self.store.chain_tip(&mut tx, stream).await?;
        let mut seen_external = std::collections::HashSet::new();
        let mut events = Vec::with_capacity(inputs.len());

        for input in inputs {
            if let Some(external_id) = &input.external_id {
                if !seen_external.insert(external_id.clone())
                    || self.store.has_external_id(&mut tx, stream, external_id).await?
                {
                    return Err(AuditError::DuplicateExternalId(external_id.clone()));
                }
            }
            let event = self.build_event(stream, input, tip.as_ref())?;
            tip = Some(ChainTip {
                hash: event.hash.clone(),
                received_at: event.received_at,
            });
            events.push(event);
        }

        self.store.insert_events(&mut tx, &events).await?;
        self.store.commit(tx).await?;
        for event in &events {
            self.store.publish(event);
        }
        Ok(events)
    }

    /// Assign identity, timestamps and chain links, then digest and sign.
    fn build_event(
        &self,
        stream: &StreamKey,
        input: EventInput,
        tip: Option<&ChainTip>,
    ) -> Result<AuditEvent, AuditError> {
        let received_at = next_received_at(tip);
        if let Some(created_at) = input.created_at {
            if created_at > received_at {
                warn!(
                    stream = %stream,
                    skew_ms = (created_at - received_at).num_milliseconds(),
                    "client clock ahead of server; created_at is advisory only"
                );
            }
        }

        let mut event = AuditEvent {
            id: input.id.unwrap_or_else(Uuid::new_v4),
            external_id: input.external_id,
            action: input.action,
            crud: input.crud,
            actor_id: input.actor_id,
            actor_name: input.actor_name,
            actor_href: input.actor_href,
            actor_fields: input.actor_fields,
            target_id: input.target_id,
            target_name: input.target_name,
            target_href: input.target_href,
            target_type: input.target_type,
            target_fields: input.target_fields,
            group_id: input.group_id,
            group_name: input.group_name,
            description: input.description,
            component: input.component,
            version: input.version,
            source_ip: input.source_ip,
            is_anonymous: input.is_anonymous,
            is_failure: input.is_failure,
            fields: input.fields,
            metadata: input.metadata,
            // Truncated like received_at, so the committed event is
            // byte-identical to its stored round-trip.
            created_at: truncate_to_millis(input.created_at.unwrap_or(received_at)),
            received_at,
            hash: String::new(),
            previous_hash: tip.map(|t| t.hash.clone()),
            signature: String::new(),
            project_id: stream.project_id.clone(),
            environment_id: stream.environment_id.clone(),
        };

        let canonical = canonical_event_bytes(&event)?;
        event.hash = self.crypto.digest_hex(&canonical);
        event.signature = self.crypto.sign(&canonical)?;
        Ok(event)
    }
}

/// Server receive time for the next event of a stream.
///
/// Timestamps are truncated to the canonical millisecond precision and
/// forced strictly past the current tip, so `received_at` alone is a total
/// order within a stream: commit order, chain order, and timestamp order
/// can never disagree.
fn next_received_at(tip: Option<&ChainTip>) -> DateTime<Utc> {
    let now = truncate_to_millis(Utc::now());
    match tip {
        Some(tip) if now <= tip.received_at => tip.received_at + Duration::milliseconds(1),
        _ => now,
    }
}

fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ts.timestamp_millis()) {
        chrono::LocalResult::Single(truncated) => truncated,
        _ => ts,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chainlog_core::{Crud, CryptoConfig, SignatureAlgorithm};
    use chainlog_crypto::generate_keypair;

    pub(crate) async fn test_engine() -> Arc<ChainEngine> {
        let (private_key_pem, public_key_pem) =
            generate_keypair(SignatureAlgorithm::Ed25519).unwrap();
        let crypto = CryptoService::from_config(&CryptoConfig {
            algorithm: SignatureAlgorithm::Ed25519,
            hash_algorithm: Default::default(),
            private_key_pem,
            public_key_pem,
        })
        .unwrap();
        let store = SqliteStore::in_memory().await.unwrap();
        Arc::new(ChainEngine::new(Arc::new(store), Arc::new(crypto)))
    }

    pub(crate) fn input(action: &str, actor: &str) -> EventInput {
        let mut input = EventInput::new(action, Crud::Create);
        input.actor_id = Some(actor.into());
        input
    }

    #[tokio::test]
    async fn genesis_event_has_no_previous_hash() {
        let engine = test_engine().await;
        let stream = StreamKey::new("P", "E");

        let event = engine.append(&stream, input("user.create", "u1")).await.unwrap();
        assert!(event.previous_hash.is_none());
        assert!(!event.hash.is_empty());
        assert!(!event.signature.is_empty());

        let canonical = canonical_event_bytes(&event).unwrap();
        assert_eq!(engine.crypto().digest_hex(&canonical), event.hash);
        assert!(engine.crypto().verify(&canonical, &event.signature));
    }

    #[tokio::test]
    async fn second_event_links_to_the_first() {
        let engine = test_engine().await;
        let stream = StreamKey::new("P", "E");

        let first = engine.append(&stream, input("user.create", "u1")).await.unwrap();
        let mut second_input = input("user.update", "u1");
        second_input.crud = Crud::Update;
        second_input.target_id = Some("u1".into());
        second_input.target_type = Some("user".into());
        let second = engine.append(&stream, second_input).await.unwrap();

        assert_eq!(second.previous_hash.as_deref(), Some(first.hash.as_str()));
        assert!(second.received_at > first.received_at);
    }

    #[tokio::test]
    async fn duplicate_external_id_is_rejected() {
        let engine = test_engine().await;
        let stream = StreamKey::new("P", "E");

        let mut first = input("order.create", "u1");
        first.external_id = Some("order-1".into());
        engine.append(&stream, first.clone()).await.unwrap();

        let err = engine.append(&stream, first.clone()).await.unwrap_err();
        assert_eq!(err.code(), "duplicate_external_id");

        // The same key is free in another stream.
        let other = StreamKey::new("P", "staging");
        engine.append(&other, first).await.unwrap();
    }

    #[tokio::test]
    async fn batch_appends_in_order_and_atomically() {
        let engine = test_engine().await;
        let stream = StreamKey::new("P", "E");

        let events = engine
            .append_batch(
                &stream,
                (0..5).map(|n| input("job.run", &format!("u{n}"))).collect(),
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 5);
        assert!(events[0].previous_hash.is_none());
        for pair in events.windows(2) {
            assert_eq!(pair[1].previous_hash.as_deref(), Some(pair[0].hash.as_str()));
        }

        // A batch with an internal duplicate rolls back entirely.
        let mut a = input("order.create", "u1");
        a.external_id = Some("dup".into());
        let err = engine
            .append_batch(&stream, vec![a.clone(), a])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "duplicate_external_id");

        let all = engine
            .store()
            .events_in_range(&stream, None, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 5, "failed batch left nothing behind");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_stream_submissions_form_one_chain() {
        let engine = test_engine().await;
        let stream = StreamKey::new("P", "E");

        let submissions = (0..10).map(|n| {
            let engine = engine.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                engine.append(&stream, input("task.spawn", &format!("u{n}"))).await
            })
        });
        for result in futures::future::join_all(submissions).await {
            result.unwrap().unwrap();
        }

        let chain = engine
            .store()
            .events_in_range(&stream, None, None)
            .await
            .unwrap();
        assert_eq!(chain.len(), 10);
        assert!(chain[0].previous_hash.is_none());
        for pair in chain.windows(2) {
            assert_eq!(pair[1].previous_hash.as_deref(), Some(pair[0].hash.as_str()));
            assert!(pair[1].received_at > pair[0].received_at);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn streams_are_independent() {
        let engine = test_engine().await;
        let one = StreamKey::new("P", "E1");
        let two = StreamKey::new("P", "E2");

        let submissions = (0..20).map(|n| {
            let engine = engine.clone();
            let stream = if n % 2 == 0 { one.clone() } else { two.clone() };
            tokio::spawn(async move {
                engine.append(&stream, input("ping.send", &format!("u{n}"))).await
            })
        });
        for result in futures::future::join_all(submissions).await {
            result.unwrap().unwrap();
        }

        for stream in [&one, &two] {
            let chain = engine.store().events_in_range(stream, None, None).await.unwrap();
            assert_eq!(chain.len(), 10);
            assert_eq!(
                chain.iter().filter(|e| e.previous_hash.is_none()).count(),
                1,
                "exactly one genesis per stream"
            );
            for pair in chain.windows(2) {
                assert_eq!(pair[1].previous_hash.as_deref(), Some(pair[0].hash.as_str()));
            }
        }
    }

    #[tokio::test]
    async fn client_clock_skew_is_accepted() {
        let engine = test_engine().await;
        let stream = StreamKey::new("P", "E");

        let mut ahead = input("clock.test", "u1");
        ahead.created_at = Some(Utc::now() + Duration::hours(2));
        let event = engine.append(&stream, ahead).await.unwrap();
        assert!(event.created_at > event.received_at);

        let mut behind = input("clock.test", "u2");
        behind.created_at = Some(Utc::now() - Duration::days(30));
        let event = engine.append(&stream, behind).await.unwrap();
        assert!(event.created_at < event.received_at);
    }
}
