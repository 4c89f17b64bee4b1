//! Deterministic canonical byte form of an audit event.
//!
//! The canonical form is the compact JSON encoding of every signable field,
//! with object keys in ascending lexicographic order and absent optional
//! fields emitted as explicit `null` so that two structurally different
//! events can never share an encoding. It is the input to both the digest
//! and the signature, and it is re-derived verbatim during verification.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::error::AuditError;
use crate::event::AuditEvent;

/// Timestamp encoding used everywhere a time crosses a byte boundary:
/// ISO-8601 UTC with millisecond precision, e.g. `2026-03-01T09:30:00.125Z`.
///
/// The width is fixed, so lexicographic order over encoded timestamps equals
/// chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp previously produced by [`format_timestamp`].
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, AuditError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuditError::Storage(format!("malformed stored timestamp `{s}`: {e}")))
}

/// Serialize the signable fields of `event` into the canonical byte form.
///
/// Covers identity, action, actor, target, group, descriptive fields,
/// `created_at`, `received_at`, `fields`, `previous_hash`, and the stream
/// key. Excludes `hash`, `signature`, and `metadata`. The `serde_json`
/// object model keeps map keys sorted (its map is a `BTreeMap`), which is
/// what makes the encoding independent of insertion order; the JSON number
/// model cannot represent non-finite values, so any value that reaches this
/// function is encodable.
pub fn canonical_event_bytes(event: &AuditEvent) -> Result<Vec<u8>, AuditError> {
    let payload = json!({
        "id": event.id,
        "external_id": event.external_id,
        "action": event.action,
        "crud": event.crud,
        "actor_id": event.actor_id,
        "actor_name": event.actor_name,
        "actor_href": event.actor_href,
        "actor_fields": event.actor_fields,
        "target_id": event.target_id,
        "target_name": event.target_name,
        "target_href": event.target_href,
        "target_type": event.target_type,
        "target_fields": event.target_fields,
        "group_id": event.group_id,
        "group_name": event.group_name,
        "description": event.description,
        "component": event.component,
        "version": event.version,
        "source_ip": event.source_ip,
        "is_anonymous": event.is_anonymous,
        "is_failure": event.is_failure,
        "fields": event.fields,
        "created_at": format_timestamp(event.created_at),
        "received_at": format_timestamp(event.received_at),
        "previous_hash": event.previous_hash,
        "project_id": event.project_id,
        "environment_id": event.environment_id,
    });
    encode(&payload)
}

fn encode(payload: &Value) -> Result<Vec<u8>, AuditError> {
    serde_json::to_vec(payload)
        .map_err(|e| AuditError::Validation(format!("event is not canonicalizable: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Crud;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn base_event() -> AuditEvent {
        AuditEvent {
            id: Uuid::nil(),
            external_id: None,
            action: "user.create".into(),
            crud: Crud::Create,
            actor_id: Some("u1".into()),
            actor_name: None,
            actor_href: None,
            actor_fields: BTreeMap::new(),
            target_id: None,
            target_name: None,
            target_href: None,
            target_type: None,
            target_fields: BTreeMap::new(),
            group_id: None,
            group_name: None,
            description: None,
            component: None,
            version: None,
            source_ip: None,
            is_anonymous: false,
            is_failure: false,
            fields: BTreeMap::new(),
            metadata: BTreeMap::new(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
            received_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 1).unwrap(),
            hash: String::new(),
            previous_hash: None,
            signature: String::new(),
            project_id: "p".into(),
            environment_id: "e".into(),
        }
    }

    #[test]
    fn timestamps_use_millisecond_utc() {
        let ts = Utc.timestamp_millis_opt(1_767_260_700_125).unwrap();
        let encoded = format_timestamp(ts);
        assert!(encoded.ends_with('Z'));
        assert_eq!(encoded.len(), "2026-01-01T09:45:00.125Z".len());
        assert_eq!(parse_timestamp(&encoded).unwrap(), ts);
    }

    #[test]
    fn structurally_equal_events_encode_identically() {
        let a = base_event();
        let b = base_event();
        assert_eq!(
            canonical_event_bytes(&a).unwrap(),
            canonical_event_bytes(&b).unwrap()
        );
    }

    #[test]
    fn map_insertion_order_does_not_matter() {
        let mut a = base_event();
        a.actor_fields.insert("role".into(), "admin".into());
        a.actor_fields.insert("dept".into(), "eng".into());

        let mut b = base_event();
        b.actor_fields.insert("dept".into(), "eng".into());
        b.actor_fields.insert("role".into(), "admin".into());

        assert_eq!(
            canonical_event_bytes(&a).unwrap(),
            canonical_event_bytes(&b).unwrap()
        );
    }

    #[test]
    fn absent_optionals_are_explicit_nulls() {
        let event = base_event();
        let bytes = canonical_event_bytes(&event).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"external_id\":null"));
        assert!(text.contains("\"previous_hash\":null"));
    }

    #[test]
    fn hash_signature_and_metadata_are_excluded() {
        let mut a = base_event();
        let baseline = canonical_event_bytes(&a).unwrap();

        a.hash = "deadbeef".into();
        a.signature = "c2ln".into();
        a.metadata.insert("trace".into(), "abc".into());
        assert_eq!(canonical_event_bytes(&a).unwrap(), baseline);
    }

    #[test]
    fn every_signable_field_perturbs_the_encoding() {
        let baseline = canonical_event_bytes(&base_event()).unwrap();

        let mut e = base_event();
        e.description = Some("x".into());
        assert_ne!(canonical_event_bytes(&e).unwrap(), baseline);

        let mut e = base_event();
        e.previous_hash = Some("00".into());
        assert_ne!(canonical_event_bytes(&e).unwrap(), baseline);

        let mut e = base_event();
        e.environment_id = "e2".into();
        assert_ne!(canonical_event_bytes(&e).unwrap(), baseline);
    }

    proptest! {
        #[test]
        fn canonical_form_is_deterministic(
            keys in proptest::collection::vec("[a-z]{1,8}", 0..8),
            value in "[ -~]{0,16}",
        ) {
            let mut a = base_event();
            let mut b = base_event();
            for k in keys.iter() {
                a.fields.insert(k.clone(), serde_json::Value::String(value.clone()));
            }
            for k in keys.iter().rev() {
                b.fields.insert(k.clone(), serde_json::Value::String(value.clone()));
            }
            prop_assert_eq!(
                canonical_event_bytes(&a).unwrap(),
                canonical_event_bytes(&b).unwrap()
            );
        }
    }
}
