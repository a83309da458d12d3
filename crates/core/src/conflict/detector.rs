//! Conflict detection logic.
//!
//! Given the pending changes of two replicas for one file, the detector folds
//! each side's changes per entity into a net effect and reports entities both
//! sides changed incompatibly.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob;
use crate::errors::{ChangeError, ConflictDetectionError, ReplicaError};
use crate::models::{Change, EntityKey, EntityKind, Operation, ReplicaId, Snapshot};
use crate::plugin::ConflictArgs;
use crate::registry::RegisteredPlugin;
use crate::replica::Replica;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides created or updated the entity to different values.
    Content,
    /// One side updated, the other deleted.
    EditDelete,
    /// One side created, the other deleted.
    CreateDelete,
    /// An opaque file changed to different bytes on both sides.
    WholeFile,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::EditDelete => write!(f, "edit_delete"),
            Self::CreateDelete => write!(f, "create_delete"),
            Self::WholeFile => write!(f, "whole_file"),
        }
    }
}

/// Order-independent identity of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConflictKey {
    pub file_id: String,
    pub entity: EntityKey,
    pub change_ids: (String, String),
}

/// An incompatibility between two changes made by different replicas.
///
/// `change_a` comes from the source replica and `change_b` from the target
/// replica of the detection call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// Derived from the file, entity, and unordered change pair.
    pub id: String,
    pub file_id: String,
    pub entity: EntityKey,
    pub conflict_type: ConflictType,
    pub change_a: Change,
    pub change_b: Change,
    /// Entity value both replicas started from, when they agree on one.
    #[serde(default)]
    pub base: Option<Snapshot>,
    pub description: String,
    pub resolved: bool,
    /// Id of the change that recorded the resolution.
    pub resolution: Option<String>,
}

impl Conflict {
    pub fn new(change_a: Change, change_b: Change, conflict_type: ConflictType) -> Self {
        let entity = change_a.entity_key();
        let file_id = change_a.file_id.clone();
        let (first, second) = ordered_pair(&change_a.id, &change_b.id);
        let id = Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{file_id}\u{1f}{entity}\u{1f}{first}\u{1f}{second}").as_bytes(),
        )
        .to_string();

        let (r1, r2) = ordered_pair(change_a.origin.as_str(), change_b.origin.as_str());
        let description = format!(
            "{conflict_type} conflict on {entity} in file '{file_id}' between replicas '{r1}' and '{r2}'"
        );

        let base = if change_a.before == change_b.before {
            change_a.before.clone()
        } else {
            None
        };

        Self {
            id,
            file_id,
            entity,
            conflict_type,
            change_a,
            change_b,
            base,
            description,
            resolved: false,
            resolution: None,
        }
    }

    /// Override the common ancestor value, e.g. with a folded net `before`.
    pub fn with_base(mut self, base: Option<Snapshot>) -> Self {
        self.base = base;
        self
    }

    pub fn key(&self) -> ConflictKey {
        let (first, second) = ordered_pair(&self.change_a.id, &self.change_b.id);
        ConflictKey {
            file_id: self.file_id.clone(),
            entity: self.entity.clone(),
            change_ids: (first.to_string(), second.to_string()),
        }
    }

    /// Record the change that resolved this conflict.
    pub fn mark_resolved(&mut self, resolution_change_id: impl Into<String>) {
        self.resolved = true;
        self.resolution = Some(resolution_change_id.into());
    }

    /// The replica the conflict is being merged into.
    pub fn target_replica(&self) -> &ReplicaId {
        &self.change_b.origin
    }
}

fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// ---------------------------------------------------------------------------
// Net effects
// ---------------------------------------------------------------------------

/// The combined effect of one replica's pending changes to one entity.
#[derive(Debug, Clone)]
pub struct NetChange {
    pub operation: Operation,
    pub before: Option<Snapshot>,
    pub after: Option<Snapshot>,
    /// Most recent change contributing to the effect.
    pub last: Change,
    /// Number of changes folded into the effect.
    pub count: usize,
}

impl NetChange {
    /// The net effect as a single change. A lone change is returned as-is;
    /// folded effects become a new record attributed to the last change's
    /// replica and plugin.
    pub fn to_change(&self) -> Result<Change, ChangeError> {
        if self.count == 1 {
            return Ok(self.last.clone());
        }
        Change::from_states(
            self.last.file_id.clone(),
            self.last.entity_type,
            self.before.clone(),
            self.after.clone(),
            self.last.plugin_key.clone(),
            self.last.origin.clone(),
        )
    }
}

/// Fold a replica's changes for `file_id`, oldest first, into one net effect
/// per entity. Entities whose changes cancel out (created then deleted, or
/// changed back to the original value) are omitted.
pub fn net_changes(file_id: &str, changes: &[Change]) -> BTreeMap<EntityKey, NetChange> {
    let mut folded: BTreeMap<EntityKey, (Option<Snapshot>, Option<Snapshot>, Change, usize)> =
        BTreeMap::new();

    for change in changes.iter().filter(|c| c.file_id == file_id) {
        folded
            .entry(change.entity_key())
            .and_modify(|(_, after, last, count)| {
                *after = change.after.clone();
                *last = change.clone();
                *count += 1;
            })
            .or_insert_with(|| {
                (
                    change.before.clone(),
                    change.after.clone(),
                    change.clone(),
                    1,
                )
            });
    }

    folded
        .into_iter()
        .filter_map(|(key, (before, after, last, count))| {
            if before == after {
                return None;
            }
            let operation = Operation::from_states(before.as_ref(), after.as_ref())?;
            Some((
                key,
                NetChange {
                    operation,
                    before,
                    after,
                    last,
                    count,
                },
            ))
        })
        .collect()
}

/// Drop the changes both histories contain (same change id), leaving each
/// replica's changes the other has not seen yet.
pub fn exclude_shared(source: Vec<Change>, target: Vec<Change>) -> (Vec<Change>, Vec<Change>) {
    let source_ids: BTreeSet<String> = source.iter().map(|c| c.id.clone()).collect();
    let target_ids: BTreeSet<String> = target.iter().map(|c| c.id.clone()).collect();
    let shared = source_ids.intersection(&target_ids).count();
    if shared > 0 {
        debug!(shared, "excluding changes present on both replicas");
    }
    (
        source
            .into_iter()
            .filter(|c| !target_ids.contains(&c.id))
            .collect(),
        target
            .into_iter()
            .filter(|c| !source_ids.contains(&c.id))
            .collect(),
    )
}

/// Each replica's pending changes for `file_id`: its history minus the
/// changes both replicas share.
pub async fn pending_changes(
    file_id: &str,
    source: &dyn Replica,
    target: &dyn Replica,
) -> Result<(Vec<Change>, Vec<Change>), ReplicaError> {
    let source_changes = source.changes_for_file(file_id).await?;
    let target_changes = target.changes_for_file(file_id).await?;
    Ok(exclude_shared(source_changes, target_changes))
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless conflict detector that compares two sets of changes.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Compare two replicas' pending changes for one file and return the
    /// conflicting entities, sorted by entity key.
    ///
    /// The result is symmetric: swapping the arguments yields conflicts with
    /// the same keys and ids.
    pub fn detect(file_id: &str, source: &[Change], target: &[Change]) -> Vec<Conflict> {
        let source_net = net_changes(file_id, source);
        let target_net = net_changes(file_id, target);
        debug!(
            file_id,
            source_entities = source_net.len(),
            target_entities = target_net.len(),
            "detecting entity conflicts"
        );

        let mut conflicts = Vec::new();
        for (key, a) in &source_net {
            let Some(b) = target_net.get(key) else {
                continue;
            };
            if let Some(conflict_type) = classify_conflict(a, b) {
                let base = if a.before == b.before {
                    a.before.clone()
                } else {
                    None
                };
                let conflict = Conflict::new(a.last.clone(), b.last.clone(), conflict_type)
                    .with_base(base);
                debug!(
                    file_id,
                    entity = %conflict.entity,
                    conflict_type = %conflict.conflict_type,
                    "conflict detected"
                );
                conflicts.push(conflict);
            }
        }

        info!(file_id, count = conflicts.len(), "conflict detection complete");
        conflicts
    }

    /// Byte-level comparison for files without an owning plugin: a conflict
    /// exists when both sides changed the file and end on different content.
    pub fn detect_whole_file(file_id: &str, source: &[Change], target: &[Change]) -> Vec<Conflict> {
        let a = whole_file_effect(file_id, source);
        let b = whole_file_effect(file_id, target);

        let (Some(a), Some(b)) = (a, b) else {
            return Vec::new();
        };
        let digest_a = a.after.as_ref().and_then(blob::snapshot_digest);
        let digest_b = b.after.as_ref().and_then(blob::snapshot_digest);
        if digest_a == digest_b {
            return Vec::new();
        }

        let conflict_type = match (a.operation, b.operation) {
            (Operation::Delete, _) | (_, Operation::Delete) => ConflictType::EditDelete,
            _ => ConflictType::WholeFile,
        };
        debug!(file_id, %conflict_type, "whole-file conflict detected");
        vec![Conflict::new(a.last, b.last, conflict_type)]
    }

    /// Detect conflicts for one file through its owning plugin.
    ///
    /// Plugins declaring `report_conflicts` compute the set themselves;
    /// others use [`detect`](Self::detect); opaque files use
    /// [`detect_whole_file`](Self::detect_whole_file).
    pub async fn report(
        owner: Option<&RegisteredPlugin>,
        file_id: &str,
        source: &dyn Replica,
        target: &dyn Replica,
    ) -> Result<Vec<Conflict>, ConflictDetectionError> {
        match owner {
            Some(entry) if entry.capabilities().report_conflicts => {
                let mut conflicts = entry
                    .plugin()
                    .report_conflicts(ConflictArgs {
                        file_id,
                        source,
                        target,
                    })
                    .await
                    .inspect_err(|e| {
                        warn!(plugin = entry.key(), file_id, error = %e, "plugin conflict detection failed")
                    })?;
                conflicts.sort_by(|x, y| (&x.entity, x.key()).cmp(&(&y.entity, y.key())));
                conflicts.dedup_by(|x, y| x.key() == y.key());
                Ok(conflicts)
            }
            Some(_) => {
                let (source_changes, target_changes) =
                    pending_changes(file_id, source, target).await?;
                Ok(Self::detect(file_id, &source_changes, &target_changes))
            }
            None => {
                let (source_changes, target_changes) =
                    pending_changes(file_id, source, target).await?;
                Ok(Self::detect_whole_file(
                    file_id,
                    &source_changes,
                    &target_changes,
                ))
            }
        }
    }
}

/// Net effect of a replica's whole-file changes for `file_id`.
fn whole_file_effect(file_id: &str, changes: &[Change]) -> Option<NetChange> {
    let whole_file: Vec<Change> = changes
        .iter()
        .filter(|c| c.entity_type == EntityKind::File)
        .cloned()
        .collect();
    let net = net_changes(file_id, &whole_file);
    // A file's whole-file entity is keyed by the file id.
    net.into_values().last()
}

/// Classify what kind of conflict exists between two net effects on the same
/// entity. Every rule is symmetric in its arguments.
fn classify_conflict(a: &NetChange, b: &NetChange) -> Option<ConflictType> {
    // Identical outcomes (including both deleted) never conflict.
    if a.after == b.after {
        return None;
    }

    match (a.operation, b.operation) {
        (Operation::Create | Operation::Update, Operation::Create | Operation::Update) => {
            Some(ConflictType::Content)
        }
        (Operation::Update, Operation::Delete) | (Operation::Delete, Operation::Update) => {
            Some(ConflictType::EditDelete)
        }
        (Operation::Create, Operation::Delete) | (Operation::Delete, Operation::Create) => {
            Some(ConflictType::CreateDelete)
        }
        (Operation::Delete, Operation::Delete) => None,
    }
}
