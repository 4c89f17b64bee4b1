//! Event rows: inserts, scoped lookups, chain-tip reads, filtered queries.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use uuid::Uuid;

use chainlog_core::{
    format_timestamp, parse_timestamp, AuditError, AuditEvent, Crud, Cursor, EventFilter,
    EventPage, StreamKey,
};

use crate::{db_err, json_err, SqliteStore};

/// The newest event of a stream, as seen inside an append transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTip {
    /// Hash of the newest event.
    pub hash: String,
    /// When the newest event was received.
    pub received_at: DateTime<Utc>,
}

impl SqliteStore {
    /// Insert one committed event inside the caller's transaction.
    pub async fn insert_event(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        event: &AuditEvent,
    ) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                id, external_id, action, crud,
                actor_id, actor_name, actor_href, actor_fields,
                target_id, target_name, target_href, target_type, target_fields,
                group_id, group_name,
                description, component, version, source_ip,
                is_anonymous, is_failure, fields, metadata,
                created_at, received_at,
                hash, previous_hash, signature,
                project_id, environment_id
            ) VALUES (
                ?, ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?,
                ?, ?, ?,
                ?, ?
            )
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.external_id)
        .bind(&event.action)
        .bind(event.crud.as_str())
        .bind(&event.actor_id)
        .bind(&event.actor_name)
        .bind(&event.actor_href)
        .bind(serde_json::to_string(&event.actor_fields).map_err(json_err)?)
        .bind(&event.target_id)
        .bind(&event.target_name)
        .bind(&event.target_href)
        .bind(&event.target_type)
        .bind(serde_json::to_string(&event.target_fields).map_err(json_err)?)
        .bind(&event.group_id)
        .bind(&event.group_name)
        .bind(&event.description)
        .bind(&event.component)
        .bind(&event.version)
        .bind(&event.source_ip)
        .bind(event.is_anonymous)
        .bind(event.is_failure)
        .bind(serde_json::to_string(&event.fields).map_err(json_err)?)
        .bind(serde_json::to_string(&event.metadata).map_err(json_err)?)
        .bind(format_timestamp(event.created_at))
        .bind(format_timestamp(event.received_at))
        .bind(&event.hash)
        .bind(&event.previous_hash)
        .bind(&event.signature)
        .bind(&event.project_id)
        .bind(&event.environment_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Insert a batch of committed events inside the caller's transaction.
    /// Atomic with the transaction: either every row lands or none do.
    pub async fn insert_events(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        events: &[AuditEvent],
    ) -> Result<(), AuditError> {
        for event in events {
            self.insert_event(tx, event).await?;
        }
        Ok(())
    }

    /// Scoped lookup of one event.
    pub async fn get_event(
        &self,
        id: Uuid,
        stream: &StreamKey,
    ) -> Result<Option<AuditEvent>, AuditError> {
        let row = sqlx::query(
            "SELECT * FROM audit_events
             WHERE id = ? AND project_id = ? AND environment_id = ?",
        )
        .bind(id.to_string())
        .bind(&stream.project_id)
        .bind(&stream.environment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(row_to_event).transpose()
    }

    /// The newest event of `stream`, read inside the caller's append
    /// transaction. `None` for an empty stream.
    pub async fn chain_tip(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        stream: &StreamKey,
    ) -> Result<Option<ChainTip>, AuditError> {
        let row = sqlx::query(
            "SELECT hash, received_at FROM audit_events
             WHERE project_id = ? AND environment_id = ?
             ORDER BY received_at DESC, id DESC
             LIMIT 1",
        )
        .bind(&stream.project_id)
        .bind(&stream.environment_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        row.map(|r| {
            Ok(ChainTip {
                hash: r.try_get("hash").map_err(db_err)?,
                received_at: parse_timestamp(
                    &r.try_get::<String, _>("received_at").map_err(db_err)?,
                )?,
            })
        })
        .transpose()
    }

    /// Whether `external_id` is already committed in `stream`. Read inside
    /// the append transaction so the dedupe check and the insert observe
    /// the same state.
    pub async fn has_external_id(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        stream: &StreamKey,
        external_id: &str,
    ) -> Result<bool, AuditError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM audit_events
                 WHERE project_id = ? AND environment_id = ? AND external_id = ?
             )",
        )
        .bind(&stream.project_id)
        .bind(&stream.environment_id)
        .bind(external_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(exists != 0)
    }

    /// Filtered, keyset-paginated query over one stream.
    pub async fn query_events(&self, filter: &EventFilter) -> Result<EventPage, AuditError> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_events");
        push_filters(&mut count_qb, filter, false);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_events");
        push_filters(&mut qb, filter, true);
        qb.push(" ORDER BY received_at ASC, id ASC LIMIT ");
        // One extra row decides whether another page exists.
        qb.push_bind(i64::from(filter.limit) + 1);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut events = rows
            .into_iter()
            .map(row_to_event)
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = if events.len() > filter.limit as usize {
            events.truncate(filter.limit as usize);
            events.last().map(|e| Cursor::after(e).encode())
        } else {
            None
        };

        Ok(EventPage {
            events,
            next_cursor,
            total: total as u64,
        })
    }

    /// All events of `stream` with `received_at` inside the given bounds
    /// (inclusive), in chain order. Used by the verifier and the exporter.
    pub async fn events_in_range(
        &self,
        stream: &StreamKey,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM audit_events WHERE project_id = ",
        );
        qb.push_bind(&stream.project_id);
        qb.push(" AND environment_id = ");
        qb.push_bind(&stream.environment_id);
        if let Some(start) = start {
            qb.push(" AND received_at >= ");
            qb.push_bind(format_timestamp(start));
        }
        if let Some(end) = end {
            qb.push(" AND received_at <= ");
            qb.push_bind(format_timestamp(end));
        }
        qb.push(" ORDER BY received_at ASC, id ASC");

        qb.build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(row_to_event)
            .collect()
    }

    /// Streams that have at least one committed event.
    pub async fn list_streams(&self) -> Result<Vec<StreamKey>, AuditError> {
        let rows = sqlx::query(
            "SELECT DISTINCT project_id, environment_id FROM audit_events
             ORDER BY project_id, environment_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|r| {
                Ok(StreamKey {
                    project_id: r.try_get("project_id").map_err(db_err)?,
                    environment_id: r.try_get("environment_id").map_err(db_err)?,
                })
            })
            .collect()
    }
}

fn push_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, filter: &'a EventFilter, cursor: bool) {
    qb.push(" WHERE project_id = ");
    qb.push_bind(&filter.stream.project_id);
    qb.push(" AND environment_id = ");
    qb.push_bind(&filter.stream.environment_id);
    if let Some(action) = &filter.action {
        qb.push(" AND action = ");
        qb.push_bind(action);
    }
    if let Some(actor_id) = &filter.actor_id {
        qb.push(" AND actor_id = ");
        qb.push_bind(actor_id);
    }
    if let Some(target_id) = &filter.target_id {
        qb.push(" AND target_id = ");
        qb.push_bind(target_id);
    }
    if let Some(start) = filter.start {
        qb.push(" AND received_at >= ");
        qb.push_bind(format_timestamp(start));
    }
    if let Some(end) = filter.end {
        qb.push(" AND received_at <= ");
        qb.push_bind(format_timestamp(end));
    }
    if let Some(needle) = &filter.description_contains {
        qb.push(" AND description LIKE ");
        qb.push_bind(format!("%{needle}%"));
    }
    if cursor {
        if let Some(cursor) = &filter.cursor {
            let ts = format_timestamp(cursor.received_at);
            qb.push(" AND (received_at > ");
            qb.push_bind(ts.clone());
            qb.push(" OR (received_at = ");
            qb.push_bind(ts);
            qb.push(" AND id > ");
            qb.push_bind(cursor.id.to_string());
            qb.push("))");
        }
    }
}

pub(crate) fn row_to_event(row: SqliteRow) -> Result<AuditEvent, AuditError> {
    fn get<'r, T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>>(
        row: &'r SqliteRow,
        column: &str,
    ) -> Result<T, AuditError> {
        row.try_get(column).map_err(db_err)
    }

    let id: String = get(&row, "id")?;
    let crud: String = get(&row, "crud")?;
    Ok(AuditEvent {
        id: Uuid::parse_str(&id)
            .map_err(|e| AuditError::Storage(format!("corrupt event id `{id}`: {e}")))?,
        external_id: get(&row, "external_id")?,
        action: get(&row, "action")?,
        crud: Crud::parse(&crud)?,
        actor_id: get(&row, "actor_id")?,
        actor_name: get(&row, "actor_name")?,
        actor_href: get(&row, "actor_href")?,
        actor_fields: serde_json::from_str(&get::<String>(&row, "actor_fields")?)
            .map_err(json_err)?,
        target_id: get(&row, "target_id")?,
        target_name: get(&row, "target_name")?,
        target_href: get(&row, "target_href")?,
        target_type: get(&row, "target_type")?,
        target_fields: serde_json::from_str(&get::<String>(&row, "target_fields")?)
            .map_err(json_err)?,
        group_id: get(&row, "group_id")?,
        group_name: get(&row, "group_name")?,
        description: get(&row, "description")?,
        component: get(&row, "component")?,
        version: get(&row, "version")?,
        source_ip: get(&row, "source_ip")?,
        is_anonymous: get(&row, "is_anonymous")?,
        is_failure: get(&row, "is_failure")?,
        fields: serde_json::from_str(&get::<String>(&row, "fields")?).map_err(json_err)?,
        metadata: serde_json::from_str(&get::<String>(&row, "metadata")?).map_err(json_err)?,
        created_at: parse_timestamp(&get::<String>(&row, "created_at")?)?,
        received_at: parse_timestamp(&get::<String>(&row, "received_at")?)?,
        hash: get(&row, "hash")?,
        previous_hash: get(&row, "previous_hash")?,
        signature: get(&row, "signature")?,
        project_id: get(&row, "project_id")?,
        environment_id: get(&row, "environment_id")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    pub(crate) fn sample_event(stream: &StreamKey, n: i64) -> AuditEvent {
        let received = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(n);
        AuditEvent {
            id: Uuid::new_v4(),
            external_id: None,
            action: "user.create".into(),
            crud: Crud::Create,
            actor_id: Some(format!("u{n}")),
            actor_name: Some("Sam".into()),
            actor_href: None,
            actor_fields: BTreeMap::new(),
            target_id: Some("t1".into()),
            target_name: None,
            target_href: None,
            target_type: Some("user".into()),
            target_fields: BTreeMap::new(),
            group_id: None,
            group_name: None,
            description: Some(format!("created user {n}")),
            component: Some("api".into()),
            version: None,
            source_ip: Some("10.0.0.1".into()),
            is_anonymous: false,
            is_failure: false,
            fields: BTreeMap::new(),
            metadata: BTreeMap::new(),
            created_at: received,
            received_at: received,
            hash: format!("{n:064x}"),
            previous_hash: (n > 0).then(|| format!("{:064x}", n - 1)),
            signature: "c2lnbmF0dXJl".into(),
            project_id: stream.project_id.clone(),
            environment_id: stream.environment_id.clone(),
        }
    }

    pub(crate) async fn insert_all(store: &SqliteStore, events: &[AuditEvent]) {
        let mut tx = store.begin().await.unwrap();
        for event in events {
            store.insert_event(&mut tx, event).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stream = StreamKey::new("p", "e");
        let mut event = sample_event(&stream, 0);
        event.fields.insert("ok".into(), serde_json::json!(true));
        insert_all(&store, std::slice::from_ref(&event)).await;

        let loaded = store.get_event(event.id, &stream).await.unwrap().unwrap();
        assert_eq!(loaded, event);

        // Scoping: same id, wrong stream.
        let other = StreamKey::new("p", "other");
        assert!(store.get_event(event.id, &other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chain_tip_follows_received_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stream = StreamKey::new("p", "e");

        let mut tx = store.begin().await.unwrap();
        assert!(store.chain_tip(&mut tx, &stream).await.unwrap().is_none());
        tx.commit().await.unwrap();

        let events: Vec<_> = (0..3).map(|n| sample_event(&stream, n)).collect();
        insert_all(&store, &events).await;

        let mut tx = store.begin().await.unwrap();
        let tip = store.chain_tip(&mut tx, &stream).await.unwrap().unwrap();
        assert_eq!(tip.hash, events[2].hash);
    }

    #[tokio::test]
    async fn update_of_committed_rows_is_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stream = StreamKey::new("p", "e");
        let event = sample_event(&stream, 0);
        insert_all(&store, std::slice::from_ref(&event)).await;

        let err = sqlx::query("UPDATE audit_events SET description = 'rewritten'")
            .execute(store.pool())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[tokio::test]
    async fn a_stream_has_at_most_one_genesis() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stream = StreamKey::new("p", "e");
        let genesis_a = sample_event(&stream, 0);
        let mut genesis_b = sample_event(&stream, 1);
        genesis_b.previous_hash = None;

        insert_all(&store, std::slice::from_ref(&genesis_a)).await;
        let mut tx = store.begin().await.unwrap();
        let err = store.insert_event(&mut tx, &genesis_b).await.unwrap_err();
        assert_eq!(err.code(), "chain_conflict");
    }

    #[tokio::test]
    async fn external_ids_are_unique_per_stream() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stream = StreamKey::new("p", "e");
        let mut first = sample_event(&stream, 0);
        first.external_id = Some("order-1".into());
        insert_all(&store, std::slice::from_ref(&first)).await;

        let mut tx = store.begin().await.unwrap();
        assert!(store
            .has_external_id(&mut tx, &stream, "order-1")
            .await
            .unwrap());
        assert!(!store
            .has_external_id(&mut tx, &stream, "order-2")
            .await
            .unwrap());

        // The same key in a different stream is fine.
        let other = StreamKey::new("p", "staging");
        assert!(!store
            .has_external_id(&mut tx, &other, "order-1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stream = StreamKey::new("p", "e");
        let events: Vec<_> = (0..5).map(|n| sample_event(&stream, n)).collect();
        insert_all(&store, &events).await;
        // A second stream that must never leak into results.
        let other = StreamKey::new("p", "staging");
        insert_all(&store, &[sample_event(&other, 0)]).await;

        let mut filter = EventFilter::for_stream(stream.clone());
        filter.limit = 2;
        let page1 = store.query_events(&filter).await.unwrap();
        assert_eq!(page1.total, 5);
        assert_eq!(page1.events.len(), 2);
        let cursor = page1.next_cursor.expect("more pages");

        filter.cursor = Some(Cursor::decode(&cursor).unwrap());
        let page2 = store.query_events(&filter).await.unwrap();
        assert_eq!(page2.events.len(), 2);
        assert_ne!(page1.events[1].id, page2.events[0].id);

        filter.cursor = Some(Cursor::decode(&page2.next_cursor.unwrap()).unwrap());
        let page3 = store.query_events(&filter).await.unwrap();
        assert_eq!(page3.events.len(), 1);
        assert!(page3.next_cursor.is_none());

        let mut by_actor = EventFilter::for_stream(stream.clone());
        by_actor.actor_id = Some("u3".into());
        let page = store.query_events(&by_actor).await.unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].actor_id.as_deref(), Some("u3"));

        let mut by_text = EventFilter::for_stream(stream);
        by_text.description_contains = Some("user 4".into());
        let page = store.query_events(&by_text).await.unwrap();
        assert_eq!(page.events.len(), 1);
    }

    #[tokio::test]
    async fn range_and_stream_listing() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stream = StreamKey::new("p", "e");
        let events: Vec<_> = (0..4).map(|n| sample_event(&stream, n)).collect();
        insert_all(&store, &events).await;

        let middle = store
            .events_in_range(
                &stream,
                Some(events[1].received_at),
                Some(events[2].received_at),
            )
            .await
            .unwrap();
        assert_eq!(middle.len(), 2);
        assert_eq!(middle[0].id, events[1].id);

        assert_eq!(store.list_streams().await.unwrap(), vec![stream]);
    }
}
