//! Translation message files: a JSON array of `{id, ...}` objects.
//!
//! Each array element is one `message` entity. Serialization keeps the base
//! file's element order and appends new messages in id order, always as
//! pretty-printed JSON with a trailing newline. Applying a diff to its old
//! state therefore reproduces the new state's messages, not its bytes: a new
//! state that reorders existing elements or uses other whitespace comes back
//! in base order and pretty-printed.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use lixmerge_core::conflict::{Conflict, ConflictResolver, Resolution};
use lixmerge_core::errors::{ApplyError, ParseError, PluginError};
use lixmerge_core::models::{DiffReport, EntityKind, LixFile, Operation, Snapshot};
use lixmerge_core::plugin::{default_entity_diff, Capabilities, Entity, Plugin};

pub const KEY: &str = "json_messages";
pub const DEFAULT_GLOB: &str = "**/*.messages.json";

pub struct JsonMessagesPlugin {
    glob: String,
}

impl Default for JsonMessagesPlugin {
    fn default() -> Self {
        Self::new(DEFAULT_GLOB)
    }
}

impl JsonMessagesPlugin {
    pub fn new(glob: impl Into<String>) -> Self {
        Self { glob: glob.into() }
    }

    fn malformed(file: &LixFile, detail: impl Into<String>) -> ParseError {
        ParseError::Malformed {
            plugin: KEY.to_string(),
            path: file.path.clone(),
            detail: detail.into(),
        }
    }

    /// Ids of the messages in `file`, in file order. Unreadable files have
    /// no order to preserve.
    fn id_order(&self, file: &LixFile) -> Vec<String> {
        self.parse(file)
            .map(|entities| entities.into_iter().map(|e| e.snapshot.id).collect())
            .unwrap_or_default()
    }
}

/// Names of the fields whose values differ between two snapshots.
fn changed_fields(old: &Snapshot, neu: &Snapshot) -> Vec<Value> {
    let mut names: Vec<&String> = old.fields.keys().chain(neu.fields.keys()).collect();
    names.sort();
    names.dedup();
    names
        .into_iter()
        .filter(|name| old.get(name) != neu.get(name))
        .map(|name| Value::String(name.clone()))
        .collect()
}

#[async_trait]
impl Plugin for JsonMessagesPlugin {
    fn key(&self) -> &str {
        KEY
    }

    fn glob(&self) -> &str {
        &self.glob
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::for_kinds([EntityKind::Message])
            .with_entity_diff()
            .with_resolution()
    }

    fn parse(&self, file: &LixFile) -> Result<Vec<Entity>, ParseError> {
        if file.data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_slice(&file.data)?;
        let Value::Array(items) = value else {
            return Err(Self::malformed(file, "expected a JSON array of messages"));
        };
        items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| {
                Snapshot::from_value(item)
                    .map(|snapshot| Entity::new(EntityKind::Message, snapshot))
                    .map_err(|e| Self::malformed(file, format!("message {idx}: {e}")))
            })
            .collect()
    }

    fn serialize(&self, base: &LixFile, entities: &[Entity]) -> Result<Vec<u8>, ApplyError> {
        let order = self.id_order(base);
        let position = |id: &str| order.iter().position(|o| o == id).unwrap_or(usize::MAX);

        let mut messages: Vec<&Entity> = entities.iter().collect();
        messages.sort_by(|a, b| {
            (position(&a.snapshot.id), &a.snapshot.id).cmp(&(position(&b.snapshot.id), &b.snapshot.id))
        });

        let array: Vec<Value> = messages.iter().map(|e| e.snapshot.to_value()).collect();
        let mut data = serde_json::to_vec_pretty(&array)
            .map_err(|e| ApplyError::Serialize(e.to_string()))?;
        data.push(b'\n');
        Ok(data)
    }

    async fn diff_entity(
        &self,
        kind: EntityKind,
        old: Option<&Snapshot>,
        neu: Option<&Snapshot>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        let Some(report) = default_entity_diff(kind, old, neu) else {
            return Ok(Vec::new());
        };
        let report = match (report.operation, old, neu) {
            (Operation::Update, Some(o), Some(n)) => {
                let mut meta = Map::new();
                meta.insert("changed_fields".into(), Value::Array(changed_fields(o, n)));
                report.with_meta(meta)
            }
            _ => report,
        };
        Ok(vec![report])
    }

    async fn try_resolve_conflict(&self, conflict: &Conflict) -> Result<Resolution, PluginError> {
        let resolution =
            ConflictResolver::field_union(conflict).map_err(|source| PluginError::InvalidReport {
                plugin: KEY.to_string(),
                source,
            })?;
        debug!(
            conflict_id = %conflict.id,
            resolved = resolution.is_resolved(),
            "field union attempted"
        );
        Ok(resolution)
    }
}
