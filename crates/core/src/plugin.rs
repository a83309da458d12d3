//! The plugin boundary.
//!
//! A plugin owns every file whose path matches its glob. It decomposes file
//! bytes into typed entities, serializes entities back into bytes, and may
//! override diffing, application, conflict reporting, and conflict
//! resolution. Default method bodies implement the generic behavior so a
//! minimal plugin only supplies `parse` and `serialize`.
//!
//! What a plugin can do is declared once through [`Capabilities`]; the
//! registry caches the declaration at registration time and the engines
//! consult the cached copy instead of probing the plugin on every call.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::conflict::resolver::Resolution;
use crate::conflict::{pending_changes, Conflict, ConflictDetector};
use crate::errors::{ApplyError, ChangeError, ConflictDetectionError, ParseError, PluginError};
use crate::models::{Change, DiffReport, EntityKey, EntityKind, LixFile, Operation, Snapshot};
use crate::replica::Replica;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a plugin declares it can handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Entity kinds the plugin produces and applies.
    pub entity_kinds: BTreeSet<EntityKind>,
    /// `diff_file` computes the whole diff; structural diffing is skipped.
    pub whole_file_diff: bool,
    /// `diff_entity` is consulted per changed entity.
    pub entity_diff: bool,
    /// `report_conflicts` replaces the generic detector.
    pub report_conflicts: bool,
    /// `try_resolve_conflict` is attempted before the fallback strategy.
    pub resolve: bool,
}

impl Capabilities {
    pub fn for_kinds(kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        Self {
            entity_kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_whole_file_diff(mut self) -> Self {
        self.whole_file_diff = true;
        self
    }

    pub fn with_entity_diff(mut self) -> Self {
        self.entity_diff = true;
        self
    }

    pub fn with_conflict_reporting(mut self) -> Self {
        self.report_conflicts = true;
        self
    }

    pub fn with_resolution(mut self) -> Self {
        self.resolve = true;
        self
    }

    /// Whether entities of `kind` can be applied. `File` is always handled
    /// by the core.
    pub fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::File || self.entity_kinds.contains(&kind)
    }
}

// ---------------------------------------------------------------------------
// Entities and call arguments
// ---------------------------------------------------------------------------

/// A typed, individually diffable sub-object of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub snapshot: Snapshot,
}

impl Entity {
    pub fn new(kind: EntityKind, snapshot: Snapshot) -> Self {
        Self { kind, snapshot }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.snapshot.id.clone())
    }
}

/// Arguments for [`Plugin::apply_changes`]. `changes` arrive already sorted
/// into application order.
pub struct ApplyArgs<'a> {
    pub replica: Option<&'a dyn Replica>,
    pub file: &'a LixFile,
    pub changes: &'a [Change],
}

/// Arguments for [`Plugin::report_conflicts`].
pub struct ConflictArgs<'a> {
    pub file_id: &'a str,
    pub source: &'a dyn Replica,
    pub target: &'a dyn Replica,
}

// ---------------------------------------------------------------------------
// Plugin trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Globally unique key.
    fn key(&self) -> &str;

    /// Glob pattern selecting the files this plugin owns.
    fn glob(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// One-time initialization. Runs only in the main process role.
    async fn setup(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Decompose file bytes into entities.
    fn parse(&self, file: &LixFile) -> Result<Vec<Entity>, ParseError>;

    /// Produce file bytes from the full entity set. `base` is the file the
    /// entities were applied to.
    fn serialize(&self, base: &LixFile, entities: &[Entity]) -> Result<Vec<u8>, ApplyError>;

    /// Whole-file diff, used when `whole_file_diff` is declared.
    async fn diff_file(
        &self,
        _old: Option<&LixFile>,
        _neu: Option<&LixFile>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        Err(PluginError::Unsupported {
            plugin: self.key().to_string(),
            capability: "diff_file",
        })
    }

    /// Diff of one entity present in at least one of the two states.
    async fn diff_entity(
        &self,
        kind: EntityKind,
        old: Option<&Snapshot>,
        neu: Option<&Snapshot>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        Ok(default_entity_diff(kind, old, neu).into_iter().collect())
    }

    async fn apply_changes(&self, args: ApplyArgs<'_>) -> Result<Vec<u8>, ApplyError> {
        apply_entity_changes(self, args.file, args.changes)
    }

    async fn report_conflicts(
        &self,
        args: ConflictArgs<'_>,
    ) -> Result<Vec<Conflict>, ConflictDetectionError> {
        let (source, target) = pending_changes(args.file_id, args.source, args.target).await?;
        Ok(ConflictDetector::detect(args.file_id, &source, &target))
    }

    async fn try_resolve_conflict(&self, _conflict: &Conflict) -> Result<Resolution, PluginError> {
        Ok(Resolution::Unresolved)
    }
}

// ---------------------------------------------------------------------------
// Generic behavior shared by the default methods
// ---------------------------------------------------------------------------

/// Payload comparison for one entity: create, delete, update when the
/// snapshots differ, nothing when they are equal.
pub fn default_entity_diff(
    kind: EntityKind,
    old: Option<&Snapshot>,
    neu: Option<&Snapshot>,
) -> Option<DiffReport> {
    match (old, neu) {
        (None, Some(n)) => Some(DiffReport::create(kind, n.clone())),
        (Some(o), None) => Some(DiffReport::delete(kind, o.clone())),
        (Some(o), Some(n)) if o != n => Some(DiffReport::update(kind, o.clone(), n.clone())),
        _ => None,
    }
}

/// Index parsed entities by key, rejecting duplicates.
pub fn index_entities(
    path: &str,
    entities: Vec<Entity>,
) -> Result<BTreeMap<EntityKey, Entity>, ParseError> {
    let mut indexed = BTreeMap::new();
    for entity in entities {
        let key = entity.key();
        if indexed.contains_key(&key) {
            return Err(ParseError::DuplicateEntity {
                path: path.to_string(),
                entity: key,
            });
        }
        indexed.insert(key, entity);
    }
    Ok(indexed)
}

/// Replay ordered entity changes on top of the parsed base file and
/// serialize the result through the plugin.
pub fn apply_entity_changes<P: Plugin + ?Sized>(
    plugin: &P,
    base: &LixFile,
    changes: &[Change],
) -> Result<Vec<u8>, ApplyError> {
    let mut entities = index_entities(&base.path, plugin.parse(base)?)?;

    for change in changes {
        let key = change.entity_key();
        match change.operation {
            Operation::Create => {
                if entities.contains_key(&key) {
                    return Err(ApplyError::EntityExists(key));
                }
                let after = change.after.clone().ok_or_else(|| {
                    ApplyError::InvalidChange(ChangeError::MissingAfter {
                        operation: change.operation,
                        entity_id: change.entity_id.clone(),
                    })
                })?;
                entities.insert(key, Entity::new(change.entity_type, after));
            }
            Operation::Update => {
                let Some(slot) = entities.get_mut(&key) else {
                    return Err(ApplyError::EntityMissing {
                        operation: change.operation,
                        entity: key,
                    });
                };
                if let Some(after) = &change.after {
                    slot.snapshot = after.clone();
                }
            }
            Operation::Delete => {
                if entities.remove(&key).is_none() {
                    return Err(ApplyError::EntityMissing {
                        operation: change.operation,
                        entity: key,
                    });
                }
            }
        }
    }

    let entities: Vec<Entity> = entities.into_values().collect();
    plugin.serialize(base, &entities)
}
