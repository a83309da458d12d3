//! `key=value` property files.
//!
//! Every non-comment line is a `property` entity `{id: key, value}`. Lines
//! starting with `#` or `!` and blank lines are comments: they are not
//! entities but survive serialization in place. A repeated key keeps its
//! first position and its last value.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use lixmerge_core::conflict::{Conflict, ConflictResolver, Resolution};
use lixmerge_core::errors::{ApplyError, ParseError, PluginError};
use lixmerge_core::models::{sort_reports, DiffReport, EntityKind, LixFile, Snapshot};
use lixmerge_core::plugin::{default_entity_diff, Capabilities, Entity, Plugin};

pub const KEY: &str = "properties";
pub const DEFAULT_GLOB: &str = "**/*.properties";

/// One line of a property file.
enum Line<'a> {
    Comment(&'a str),
    Property { key: &'a str, value: &'a str },
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    text.lines()
        .map(|raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                return Line::Comment(raw);
            }
            match trimmed.find(['=', ':']) {
                Some(idx) => Line::Property {
                    key: trimmed[..idx].trim_end(),
                    value: trimmed[idx + 1..].trim_start(),
                },
                None => Line::Property {
                    key: trimmed,
                    value: "",
                },
            }
        })
        .collect()
}

pub struct PropertiesPlugin {
    glob: String,
}

impl Default for PropertiesPlugin {
    fn default() -> Self {
        Self::new(DEFAULT_GLOB)
    }
}

impl PropertiesPlugin {
    pub fn new(glob: impl Into<String>) -> Self {
        Self { glob: glob.into() }
    }

    fn text<'a>(file: &'a LixFile) -> Result<&'a str, ParseError> {
        std::str::from_utf8(&file.data).map_err(|e| ParseError::Malformed {
            plugin: KEY.to_string(),
            path: file.path.clone(),
            detail: e.to_string(),
        })
    }

    fn snapshots(&self, file: Option<&LixFile>) -> Result<BTreeMap<String, Snapshot>, ParseError> {
        let Some(file) = file else {
            return Ok(BTreeMap::new());
        };
        Ok(self
            .parse(file)?
            .into_iter()
            .map(|e| (e.snapshot.id.clone(), e.snapshot))
            .collect())
    }
}

fn value_of(entity: &Entity) -> &str {
    entity
        .snapshot
        .get("value")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

#[async_trait]
impl Plugin for PropertiesPlugin {
    fn key(&self) -> &str {
        KEY
    }

    fn glob(&self) -> &str {
        &self.glob
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::for_kinds([EntityKind::Property])
            .with_whole_file_diff()
            .with_resolution()
    }

    fn parse(&self, file: &LixFile) -> Result<Vec<Entity>, ParseError> {
        let mut entities: Vec<Entity> = Vec::new();
        for line in split_lines(Self::text(file)?) {
            let Line::Property { key, value } = line else {
                continue;
            };
            if key.is_empty() {
                return Err(ParseError::Malformed {
                    plugin: KEY.to_string(),
                    path: file.path.clone(),
                    detail: format!("property without a key: '{value}'"),
                });
            }
            let snapshot = Snapshot::new(key).with_field("value", value);
            match entities.iter_mut().find(|e| e.snapshot.id == key) {
                Some(existing) => existing.snapshot = snapshot,
                None => entities.push(Entity::new(EntityKind::Property, snapshot)),
            }
        }
        Ok(entities)
    }

    fn serialize(&self, base: &LixFile, entities: &[Entity]) -> Result<Vec<u8>, ApplyError> {
        let base_text = Self::text(base)?;
        let mut pending: BTreeMap<&str, &Entity> = entities
            .iter()
            .map(|e| (e.snapshot.id.as_str(), e))
            .collect();

        let mut out = String::with_capacity(base_text.len());
        for line in split_lines(base_text) {
            match line {
                Line::Comment(raw) => {
                    out.push_str(raw);
                    out.push('\n');
                }
                Line::Property { key, .. } => {
                    // Deleted keys drop their line; repeats collapse into the first.
                    if let Some(entity) = pending.remove(key) {
                        out.push_str(&format!("{key}={}\n", value_of(entity)));
                    }
                }
            }
        }
        for (key, entity) in pending {
            out.push_str(&format!("{key}={}\n", value_of(entity)));
        }
        Ok(out.into_bytes())
    }

    async fn diff_file(
        &self,
        old: Option<&LixFile>,
        neu: Option<&LixFile>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        let old = self.snapshots(old)?;
        let neu = self.snapshots(neu)?;

        let mut reports: Vec<DiffReport> = old
            .keys()
            .chain(neu.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter_map(|key| default_entity_diff(EntityKind::Property, old.get(key), neu.get(key)))
            .collect();
        sort_reports(&mut reports);
        debug!(reports = reports.len(), "properties diff");
        Ok(reports)
    }

    async fn try_resolve_conflict(&self, conflict: &Conflict) -> Result<Resolution, PluginError> {
        ConflictResolver::last_writer_wins(conflict).map_err(|source| PluginError::InvalidReport {
            plugin: KEY.to_string(),
            source,
        })
    }
}
