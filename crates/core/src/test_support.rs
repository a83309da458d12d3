//! Small plugins used by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::conflict::{Conflict, Resolution};
use crate::errors::{ApplyError, ConflictDetectionError, ParseError, PluginError};
use crate::models::{DiffReport, EntityKind, LixFile, Snapshot};
use crate::plugin::{Capabilities, ConflictArgs, Entity, Plugin};

/// Owns JSON objects of the form `{"<id>": <value>, ...}`; each member is a
/// `record` entity `{id, value}`.
pub struct RecordPlugin {
    key: String,
    glob: String,
    setup_calls: AtomicUsize,
    source_wins: bool,
    broken_detection: bool,
}

impl RecordPlugin {
    pub fn new(key: &str, glob: &str) -> Self {
        Self {
            key: key.to_string(),
            glob: glob.to_string(),
            setup_calls: AtomicUsize::new(0),
            source_wins: false,
            broken_detection: false,
        }
    }

    /// Resolve every conflict in favour of the source replica.
    pub fn source_wins(mut self) -> Self {
        self.source_wins = true;
        self
    }

    /// Report conflicts itself, and always fail doing so.
    pub fn broken_detection(mut self) -> Self {
        self.broken_detection = true;
        self
    }

    pub fn setup_calls(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    pub fn file(id: &str, path: &str, json: Value) -> LixFile {
        LixFile::new(id, path, serde_json::to_vec(&json).unwrap())
    }

    pub fn record(id: &str, value: impl Into<Value>) -> Snapshot {
        Snapshot::new(id).with_field("value", value)
    }
}

#[async_trait]
impl Plugin for RecordPlugin {
    fn key(&self) -> &str {
        &self.key
    }

    fn glob(&self) -> &str {
        &self.glob
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::for_kinds([EntityKind::Record]);
        if self.source_wins {
            caps = caps.with_resolution();
        }
        if self.broken_detection {
            caps = caps.with_conflict_reporting();
        }
        caps
    }

    async fn setup(&self) -> Result<(), PluginError> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn parse(&self, file: &LixFile) -> Result<Vec<Entity>, ParseError> {
        if file.data.is_empty() {
            return Ok(Vec::new());
        }
        let object: Map<String, Value> =
            serde_json::from_slice(&file.data).map_err(|e| ParseError::Malformed {
                plugin: self.key.clone(),
                path: file.path.clone(),
                detail: e.to_string(),
            })?;
        Ok(object
            .into_iter()
            .map(|(id, value)| Entity::new(EntityKind::Record, Self::record(&id, value)))
            .collect())
    }

    fn serialize(&self, _base: &LixFile, entities: &[Entity]) -> Result<Vec<u8>, ApplyError> {
        let object: Map<String, Value> = entities
            .iter()
            .map(|e| {
                let value = e.snapshot.get("value").cloned().unwrap_or(Value::Null);
                (e.snapshot.id.clone(), value)
            })
            .collect();
        serde_json::to_vec(&object).map_err(|e| ApplyError::Serialize(e.to_string()))
    }

    async fn report_conflicts(
        &self,
        args: ConflictArgs<'_>,
    ) -> Result<Vec<Conflict>, ConflictDetectionError> {
        Err(ConflictDetectionError::Plugin {
            plugin: self.key.clone(),
            detail: format!("history for '{}' is unreadable", args.file_id),
        })
    }

    async fn try_resolve_conflict(&self, conflict: &Conflict) -> Result<Resolution, PluginError> {
        if !self.source_wins {
            return Ok(Resolution::Unresolved);
        }
        Ok(Resolution::Resolved {
            change: conflict.change_a.clone(),
        })
    }
}

/// Contributes a single `bundle` entity summarising any file's size through a
/// whole-file diff.
pub struct SizePlugin;

impl SizePlugin {
    fn summary(file: &LixFile) -> Snapshot {
        Snapshot::new("size").with_field("bytes", file.data.len() as u64)
    }
}

#[async_trait]
impl Plugin for SizePlugin {
    fn key(&self) -> &str {
        "size"
    }

    fn glob(&self) -> &str {
        "**/*"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::for_kinds([EntityKind::Bundle]).with_whole_file_diff()
    }

    fn parse(&self, file: &LixFile) -> Result<Vec<Entity>, ParseError> {
        Ok(vec![Entity::new(EntityKind::Bundle, Self::summary(file))])
    }

    fn serialize(&self, base: &LixFile, _entities: &[Entity]) -> Result<Vec<u8>, ApplyError> {
        Ok(base.data.clone())
    }

    async fn diff_file(
        &self,
        old: Option<&LixFile>,
        neu: Option<&LixFile>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        let old = old.map(Self::summary);
        let neu = neu.map(Self::summary);
        Ok(crate::plugin::default_entity_diff(EntityKind::Bundle, old.as_ref(), neu.as_ref())
            .into_iter()
            .collect())
    }
}
