//! Audit event model: submissions, committed events, and stream scoping.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuditError;

//─────────────────────────────
//  Validation limits
//─────────────────────────────

/// Maximum allowed length for the dotted `action` string.
pub const MAX_ACTION_LEN: usize = 255;

/// Maximum allowed length for identifier-like fields (actor/target/group ids,
/// names, hrefs, component, version, source ip, external id).
pub const MAX_IDENT_LEN: usize = 255;

/// Maximum allowed length for the free-form description.
pub const MAX_DESCRIPTION_LEN: usize = 4096;

//─────────────────────────────
//  Stream scoping
//─────────────────────────────

/// Key of a tenant stream. Every hash chain is scoped to exactly one
/// `(project, environment)` pair; events in different streams are
/// independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    /// Tenant project identifier.
    pub project_id: String,
    /// Environment identifier within the project.
    pub environment_id: String,
}

impl StreamKey {
    /// Build a stream key from its two components.
    pub fn new(project_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            environment_id: environment_id.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.environment_id)
    }
}

//─────────────────────────────
//  CRUD classification
//─────────────────────────────

/// Coarse classification of the operation an audit event describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crud {
    /// Something was created.
    #[default]
    Create,
    /// Something was read.
    Read,
    /// Something was updated.
    Update,
    /// Something was deleted.
    Delete,
}

impl Crud {
    /// Stable lowercase name, as persisted and as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse the stable lowercase name back into the enum.
    pub fn parse(s: &str) -> Result<Self, AuditError> {
        match s {
            "create" => Ok(Self::Create),
            "read" => Ok(Self::Read),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(AuditError::Validation(format!(
                "unknown crud classification `{other}`"
            ))),
        }
    }
}

impl fmt::Display for Crud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Event submission
//─────────────────────────────

/// A client-supplied audit event, before the server assigns identity,
/// timestamps, chain links, and a signature.
///
/// String-keyed maps use [`BTreeMap`] so iteration order is already the
/// lexicographic key order the canonical form requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    /// Pre-assigned event id. Normally absent; the ingest pipeline assigns
    /// one at accept time so backlog replay commits under the same id.
    pub id: Option<Uuid>,
    /// Optional client-supplied dedupe key, unique per stream when present.
    pub external_id: Option<String>,
    /// Dotted action name, e.g. `user.login`.
    pub action: String,
    /// CRUD classification of the action.
    pub crud: Crud,
    /// Identifier of the acting principal.
    pub actor_id: Option<String>,
    /// Human-readable actor name.
    pub actor_name: Option<String>,
    /// Link to the actor in the calling system.
    pub actor_href: Option<String>,
    /// Additional string-valued actor attributes.
    pub actor_fields: BTreeMap<String, String>,
    /// Identifier of the acted-upon entity.
    pub target_id: Option<String>,
    /// Human-readable target name.
    pub target_name: Option<String>,
    /// Link to the target in the calling system.
    pub target_href: Option<String>,
    /// Kind of the target entity, e.g. `user` or `invoice`.
    pub target_type: Option<String>,
    /// Additional string-valued target attributes.
    pub target_fields: BTreeMap<String, String>,
    /// Identifier of the group the event belongs to.
    pub group_id: Option<String>,
    /// Human-readable group name.
    pub group_name: Option<String>,
    /// Free-form description of what happened.
    pub description: Option<String>,
    /// Component of the calling system that emitted the event.
    pub component: Option<String>,
    /// Version of the calling component.
    pub version: Option<String>,
    /// Source IP address of the original request.
    pub source_ip: Option<String>,
    /// Whether the actor was anonymous.
    pub is_anonymous: bool,
    /// Whether the described operation failed.
    pub is_failure: bool,
    /// Arbitrary JSON-valued attributes; part of the signed payload.
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Internal string-valued annotations; opaque to the chain and never
    /// covered by hash or signature.
    pub metadata: BTreeMap<String, String>,
    /// Event time as claimed by the client. Advisory only; the chain is
    /// ordered by server-observed `received_at`.
    pub created_at: Option<DateTime<Utc>>,
}

impl EventInput {
    /// Start a submission with the two required fields.
    pub fn new(action: impl Into<String>, crud: Crud) -> Self {
        Self {
            action: action.into(),
            crud,
            ..Self::default()
        }
    }

    /// Validate submission shape: required fields present, lengths within
    /// storage limits, at least one of actor/target identified.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.action.trim().is_empty() {
            return Err(AuditError::Validation("action must not be empty".into()));
        }
        if self.action.len() > MAX_ACTION_LEN {
            return Err(AuditError::Validation(format!(
                "action exceeds {MAX_ACTION_LEN} characters"
            )));
        }
        if self.actor_id.is_none() && self.target_id.is_none() {
            return Err(AuditError::Validation(
                "at least one of actor_id or target_id is required".into(),
            ));
        }
        for (name, value) in [
            ("external_id", &self.external_id),
            ("actor_id", &self.actor_id),
            ("actor_name", &self.actor_name),
            ("actor_href", &self.actor_href),
            ("target_id", &self.target_id),
            ("target_name", &self.target_name),
            ("target_href", &self.target_href),
            ("target_type", &self.target_type),
            ("group_id", &self.group_id),
            ("group_name", &self.group_name),
            ("component", &self.component),
            ("version", &self.version),
            ("source_ip", &self.source_ip),
        ] {
            if let Some(v) = value {
                if v.len() > MAX_IDENT_LEN {
                    return Err(AuditError::Validation(format!(
                        "{name} exceeds {MAX_IDENT_LEN} characters"
                    )));
                }
            }
        }
        if let Some(d) = &self.description {
            if d.len() > MAX_DESCRIPTION_LEN {
                return Err(AuditError::Validation(format!(
                    "description exceeds {MAX_DESCRIPTION_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}

//─────────────────────────────
//  Committed event
//─────────────────────────────

/// A fully committed audit event: the submission plus server-assigned
/// identity, timestamps, chain links, and signature. Immutable once
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Server-assigned event identifier (UUID v4 unless pre-assigned).
    pub id: Uuid,
    /// Optional client-supplied dedupe key.
    pub external_id: Option<String>,
    /// Dotted action name.
    pub action: String,
    /// CRUD classification.
    pub crud: Crud,
    /// Acting principal identifier.
    pub actor_id: Option<String>,
    /// Actor display name.
    pub actor_name: Option<String>,
    /// Actor link.
    pub actor_href: Option<String>,
    /// Additional actor attributes.
    pub actor_fields: BTreeMap<String, String>,
    /// Target identifier.
    pub target_id: Option<String>,
    /// Target display name.
    pub target_name: Option<String>,
    /// Target link.
    pub target_href: Option<String>,
    /// Target entity kind.
    pub target_type: Option<String>,
    /// Additional target attributes.
    pub target_fields: BTreeMap<String, String>,
    /// Group identifier.
    pub group_id: Option<String>,
    /// Group display name.
    pub group_name: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Emitting component.
    pub component: Option<String>,
    /// Component version.
    pub version: Option<String>,
    /// Source IP of the original request.
    pub source_ip: Option<String>,
    /// Whether the actor was anonymous.
    pub is_anonymous: bool,
    /// Whether the described operation failed.
    pub is_failure: bool,
    /// Arbitrary JSON-valued attributes; signed.
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Internal annotations; excluded from hash and signature.
    pub metadata: BTreeMap<String, String>,
    /// Client-claimed event time (advisory).
    pub created_at: DateTime<Utc>,
    /// Authoritative server time at ingest; defines chain order.
    pub received_at: DateTime<Utc>,
    /// Lowercase hex digest of the canonical form.
    pub hash: String,
    /// Hash of the previous event in the stream; `None` only for genesis.
    pub previous_hash: Option<String>,
    /// Base64 signature over the canonical form.
    pub signature: String,
    /// Owning project.
    pub project_id: String,
    /// Owning environment.
    pub environment_id: String,
}

impl AuditEvent {
    /// The stream this event belongs to.
    pub fn stream(&self) -> StreamKey {
        StreamKey::new(self.project_id.clone(), self.environment_id.clone())
    }
}
