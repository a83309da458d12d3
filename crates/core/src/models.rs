//! Change model: files, snapshots, diff reports, and change records.
//!
//! A [`DiffReport`] is the wire-level description of one entity difference
//! produced by a plugin. A [`Change`] is the immutable history record derived
//! from a report once it is attributed to a file, plugin, and replica. Both
//! obey the same presence rule:
//!
//! | operation | before / old | after / neu |
//! |-----------|--------------|-------------|
//! | create    | absent       | present     |
//! | update    | present      | present     |
//! | delete    | present      | absent      |

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::ChangeError;

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// One versioned file's current materialized content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LixFile {
    pub id: String,
    pub path: String,
    pub data: Vec<u8>,
}

impl LixFile {
    pub fn new(id: impl Into<String>, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            data: data.into(),
        }
    }

    /// Same file identity with different content.
    pub fn with_data(&self, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: self.id.clone(),
            path: self.path.clone(),
            data: data.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity kinds and keys
// ---------------------------------------------------------------------------

/// The closed set of entity kinds plugins can declare.
///
/// `File` is reserved for whole-file reports on opaque content or when a
/// plugin fails to decompose a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    File,
    Bundle,
    Message,
    Variant,
    Property,
    Record,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Bundle => "bundle",
            Self::Message => "message",
            Self::Variant => "variant",
            Self::Property => "property",
            Self::Record => "record",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addresses one entity inside a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityKind,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Serialized payload of one entity: a JSON object with at least an `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Snapshot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Read a snapshot out of an arbitrary JSON value.
    pub fn from_value(value: Value) -> Result<Self, ChangeError> {
        let Value::Object(mut fields) = value else {
            return Err(ChangeError::InvalidSnapshot(
                "snapshot must be a JSON object".into(),
            ));
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            Some(other) => {
                return Err(ChangeError::InvalidSnapshot(format!(
                    "snapshot id must be a string, got {other}"
                )))
            }
            None => return Err(ChangeError::InvalidSnapshot("snapshot has no id".into())),
        };
        Ok(Self { id, fields })
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(self.fields.len() + 1);
        object.insert("id".into(), Value::String(self.id.clone()));
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.clone());
        }
        Value::Object(object)
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// The kind of mutation. The derived ordering is the application order:
/// creates, then updates, then deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Derive the operation implied by which snapshots are present.
    pub fn from_states(before: Option<&Snapshot>, after: Option<&Snapshot>) -> Option<Self> {
        match (before, after) {
            (None, Some(_)) => Some(Self::Create),
            (Some(_), Some(_)) => Some(Self::Update),
            (Some(_), None) => Some(Self::Delete),
            (None, None) => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Check the presence rule for one operation and its two optional snapshots.
fn check_presence(
    operation: Operation,
    entity_id: &str,
    before: Option<&Snapshot>,
    after: Option<&Snapshot>,
) -> Result<(), ChangeError> {
    match operation {
        Operation::Create if before.is_some() => {
            return Err(ChangeError::UnexpectedBefore {
                entity_id: entity_id.into(),
            })
        }
        Operation::Update | Operation::Delete if before.is_none() => {
            return Err(ChangeError::MissingBefore {
                operation,
                entity_id: entity_id.into(),
            })
        }
        Operation::Create | Operation::Update if after.is_none() => {
            return Err(ChangeError::MissingAfter {
                operation,
                entity_id: entity_id.into(),
            })
        }
        Operation::Delete if after.is_some() => {
            return Err(ChangeError::UnexpectedAfter {
                entity_id: entity_id.into(),
            })
        }
        _ => {}
    }
    if let (Some(b), Some(a)) = (before, after) {
        if b.id != a.id {
            return Err(ChangeError::IdMismatch {
                before: b.id.clone(),
                after: a.id.clone(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DiffReport
// ---------------------------------------------------------------------------

/// One entity-level difference between two file states, in wire shape:
/// `{type, operation, old?, neu?, meta?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    #[serde(rename = "type")]
    pub entity_type: EntityKind,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neu: Option<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl DiffReport {
    pub fn create(entity_type: EntityKind, neu: Snapshot) -> Self {
        Self {
            entity_type,
            operation: Operation::Create,
            old: None,
            neu: Some(neu),
            meta: None,
        }
    }

    pub fn update(entity_type: EntityKind, old: Snapshot, neu: Snapshot) -> Self {
        Self {
            entity_type,
            operation: Operation::Update,
            old: Some(old),
            neu: Some(neu),
            meta: None,
        }
    }

    pub fn delete(entity_type: EntityKind, old: Snapshot) -> Self {
        Self {
            entity_type,
            operation: Operation::Delete,
            old: Some(old),
            neu: None,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Id of the entity this report describes.
    pub fn entity_id(&self) -> &str {
        self.neu
            .as_ref()
            .or(self.old.as_ref())
            .map(|s| s.id.as_str())
            .unwrap_or_default()
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id())
    }

    pub fn validate(&self) -> Result<(), ChangeError> {
        if self.old.is_none() && self.neu.is_none() {
            return Err(ChangeError::EmptyTransition);
        }
        check_presence(
            self.operation,
            self.entity_id(),
            self.old.as_ref(),
            self.neu.as_ref(),
        )
    }
}

/// Sort reports into application order: creates, updates, deletes; each
/// group by entity id, then entity type. The sort is stable.
pub fn sort_reports(reports: &mut [DiffReport]) {
    reports.sort_by(|a, b| {
        (a.operation, a.entity_id(), a.entity_type).cmp(&(b.operation, b.entity_id(), b.entity_type))
    });
}

// ---------------------------------------------------------------------------
// Replicas and changes
// ---------------------------------------------------------------------------

/// Identifies an independently evolving copy of a repository's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Immutable record of one entity-level mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub file_id: String,
    pub entity_id: String,
    pub entity_type: EntityKind,
    pub operation: Operation,
    pub before: Option<Snapshot>,
    pub after: Option<Snapshot>,
    pub plugin_key: String,
    pub origin: ReplicaId,
    pub created_at: DateTime<Utc>,
}

impl Change {
    /// Attribute a diff report to a file, plugin, and replica.
    pub fn from_report(
        report: DiffReport,
        file_id: impl Into<String>,
        plugin_key: impl Into<String>,
        origin: ReplicaId,
    ) -> Result<Self, ChangeError> {
        report.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            file_id: file_id.into(),
            entity_id: report.entity_id().to_string(),
            entity_type: report.entity_type,
            operation: report.operation,
            before: report.old,
            after: report.neu,
            plugin_key: plugin_key.into(),
            origin,
            created_at: Utc::now(),
        })
    }

    /// Build a change from a state transition, deriving the operation.
    pub fn from_states(
        file_id: impl Into<String>,
        entity_type: EntityKind,
        before: Option<Snapshot>,
        after: Option<Snapshot>,
        plugin_key: impl Into<String>,
        origin: ReplicaId,
    ) -> Result<Self, ChangeError> {
        let operation = Operation::from_states(before.as_ref(), after.as_ref())
            .ok_or(ChangeError::EmptyTransition)?;
        let entity_id = after
            .as_ref()
            .or(before.as_ref())
            .map(|s| s.id.clone())
            .unwrap_or_default();
        check_presence(operation, &entity_id, before.as_ref(), after.as_ref())?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            file_id: file_id.into(),
            entity_id,
            entity_type,
            operation,
            before,
            after,
            plugin_key: plugin_key.into(),
            origin,
            created_at: Utc::now(),
        })
    }

    /// A fresh record carrying the same transition as `self`.
    pub fn reissue(&self, origin: ReplicaId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ChangeError> {
        check_presence(
            self.operation,
            &self.entity_id,
            self.before.as_ref(),
            self.after.as_ref(),
        )?;
        if let Some(snapshot) = self.after.as_ref().or(self.before.as_ref()) {
            if snapshot.id != self.entity_id {
                return Err(ChangeError::IdMismatch {
                    before: self.entity_id.clone(),
                    after: snapshot.id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// The wire-level view of this change.
    pub fn to_report(&self) -> DiffReport {
        DiffReport {
            entity_type: self.entity_type,
            operation: self.operation,
            old: self.before.clone(),
            neu: self.after.clone(),
            meta: None,
        }
    }
}

/// Total order used by the applier. Matches [`sort_reports`] and breaks the
/// remaining ties by creation time and change id.
pub fn change_order(a: &Change, b: &Change) -> Ordering {
    (a.operation, a.entity_id.as_str(), a.entity_type)
        .cmp(&(b.operation, b.entity_id.as_str(), b.entity_type))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_changes(changes: &mut [Change]) {
    changes.sort_by(change_order);
}
