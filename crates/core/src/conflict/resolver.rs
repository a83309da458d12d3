//! Conflict resolution.
//!
//! The [`ConflictResolver`] asks the owning plugin first and falls back to a
//! configured [`ResolutionStrategy`]. A successful resolution is a new
//! [`Change`] expressed against the target replica's current value of the
//! entity, so applying it to the target yields the winning state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::blob::OPAQUE_PLUGIN_KEY;
use crate::errors::{ChangeError, PluginError};
use crate::models::{Change, Snapshot};
use crate::registry::RegisteredPlugin;

use super::detector::Conflict;
use super::merger::Merger;

/// Fallback strategies applied when the owning plugin declines.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Never resolve automatically.
    #[default]
    Manual,
    /// The most recent change wins.
    LastWriterWins,
    /// Merge object payloads field by field against the common base.
    FieldUnion,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::LastWriterWins => write!(f, "last_writer_wins"),
            Self::FieldUnion => write!(f, "field_union"),
        }
    }
}

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The conflict is settled by `change`.
    Resolved { change: Change },
    /// Left for the caller.
    Unresolved,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    pub fn change(&self) -> Option<&Change> {
        match self {
            Self::Resolved { change } => Some(change),
            Self::Unresolved => None,
        }
    }
}

/// Stateless conflict resolution operations. Every method may be retried.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve `conflict` through its owning plugin, then `fallback`.
    pub async fn try_resolve(
        owner: Option<&RegisteredPlugin>,
        conflict: &Conflict,
        fallback: ResolutionStrategy,
    ) -> Result<Resolution, PluginError> {
        let plugin_key = owner.map_or(OPAQUE_PLUGIN_KEY, |o| o.key());

        if let Some(entry) = owner.filter(|o| o.capabilities().resolve) {
            match entry.plugin().try_resolve_conflict(conflict).await? {
                Resolution::Resolved { change } => {
                    let change = Self::accept_plugin_change(entry.key(), conflict, change)?;
                    info!(
                        conflict_id = %conflict.id,
                        plugin = entry.key(),
                        "conflict resolved by plugin"
                    );
                    return Ok(Resolution::Resolved { change });
                }
                Resolution::Unresolved => {
                    debug!(
                        conflict_id = %conflict.id,
                        plugin = entry.key(),
                        %fallback,
                        "plugin declined, using fallback strategy"
                    );
                }
            }
        }

        Self::resolve_with(conflict, fallback).map_err(|source| PluginError::InvalidReport {
            plugin: plugin_key.to_string(),
            source,
        })
    }

    /// Resolve `conflict` with one strategy, without consulting a plugin.
    pub fn resolve_with(
        conflict: &Conflict,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution, ChangeError> {
        let resolution = match strategy {
            ResolutionStrategy::Manual => Resolution::Unresolved,
            ResolutionStrategy::LastWriterWins => Self::last_writer_wins(conflict)?,
            ResolutionStrategy::FieldUnion => Self::field_union(conflict)?,
        };
        debug!(
            conflict_id = %conflict.id,
            %strategy,
            resolved = resolution.is_resolved(),
            "resolution attempted"
        );
        Ok(resolution)
    }

    /// The change with the later `created_at` wins; ties are broken by
    /// origin replica, then change id.
    pub fn last_writer_wins(conflict: &Conflict) -> Result<Resolution, ChangeError> {
        let rank = |c: &Change| (c.created_at, c.origin.clone(), c.id.clone());
        let winner = if rank(&conflict.change_a) > rank(&conflict.change_b) {
            &conflict.change_a
        } else {
            &conflict.change_b
        };
        debug!(
            conflict_id = %conflict.id,
            winner = %winner.id,
            origin = %winner.origin,
            "last writer wins"
        );
        let change = Self::resolution_change(conflict, winner.after.clone())?;
        Ok(Resolution::Resolved { change })
    }

    /// Merge both sides' payloads field by field against the common base.
    ///
    /// A field changed by one side only takes that side's value. A string
    /// field changed on both sides is merged line by line. Anything else
    /// changed differently on both sides, or a delete on either side, leaves
    /// the conflict unresolved.
    pub fn field_union(conflict: &Conflict) -> Result<Resolution, ChangeError> {
        let (Some(ours), Some(theirs)) = (&conflict.change_a.after, &conflict.change_b.after)
        else {
            return Ok(Resolution::Unresolved);
        };
        let empty = Map::new();
        let base = conflict.base.as_ref().map_or(&empty, |b| &b.fields);

        let names: BTreeSet<&String> = base
            .keys()
            .chain(ours.fields.keys())
            .chain(theirs.fields.keys())
            .collect();

        let mut merged = Snapshot::new(theirs.id.clone());
        for name in names {
            let b = base.get(name);
            let a = ours.fields.get(name);
            let t = theirs.fields.get(name);

            let value = if a == t || a == b {
                t.cloned()
            } else if t == b {
                a.cloned()
            } else {
                match merge_text(b, a, t) {
                    Some(text) => Some(Value::String(text)),
                    None => {
                        debug!(
                            conflict_id = %conflict.id,
                            field = %name,
                            "field changed on both sides, cannot union"
                        );
                        return Ok(Resolution::Unresolved);
                    }
                }
            };
            if let Some(value) = value {
                merged.fields.insert(name.clone(), value);
            }
        }

        let change = Self::resolution_change(conflict, Some(merged))?;
        Ok(Resolution::Resolved { change })
    }

    /// Express `winner` as a change against the target replica.
    ///
    /// When the target already holds `winner`, its own change is reissued as
    /// the resolution record; applying it to the target is a no-op.
    pub fn resolution_change(
        conflict: &Conflict,
        winner: Option<Snapshot>,
    ) -> Result<Change, ChangeError> {
        let target = &conflict.change_b;
        if target.after == winner {
            return Ok(target.reissue(target.origin.clone()));
        }
        let change = Change::from_states(
            conflict.file_id.clone(),
            conflict.entity.entity_type,
            target.after.clone(),
            winner,
            target.plugin_key.clone(),
            target.origin.clone(),
        )?;
        change.validate()?;
        Ok(change)
    }

    /// Mark `conflict` resolved when `resolution` carries a change. Returns
    /// whether the conflict is now resolved.
    pub fn record(conflict: &mut Conflict, resolution: &Resolution) -> bool {
        if let Some(change) = resolution.change() {
            conflict.mark_resolved(change.id.clone());
        }
        conflict.resolved
    }

    /// Check a plugin-produced change and rebase it onto the target.
    fn accept_plugin_change(
        plugin: &str,
        conflict: &Conflict,
        change: Change,
    ) -> Result<Change, PluginError> {
        change.validate().map_err(|source| PluginError::InvalidReport {
            plugin: plugin.to_string(),
            source,
        })?;
        if change.entity_key() != conflict.entity || change.file_id != conflict.file_id {
            warn!(
                plugin,
                conflict_id = %conflict.id,
                entity = %change.entity_key(),
                "plugin resolved a different entity"
            );
            return Err(PluginError::Other {
                plugin: plugin.to_string(),
                detail: format!(
                    "resolution targets {} in '{}', expected {} in '{}'",
                    change.entity_key(),
                    change.file_id,
                    conflict.entity,
                    conflict.file_id
                ),
            });
        }
        Self::resolution_change(conflict, change.after).map_err(|source| {
            PluginError::InvalidReport {
                plugin: plugin.to_string(),
                source,
            }
        })
    }
}

/// Line-based three-way merge of string values. Missing values count as
/// empty text.
fn merge_text(base: Option<&Value>, ours: Option<&Value>, theirs: Option<&Value>) -> Option<String> {
    fn text(v: Option<&Value>) -> Option<&str> {
        match v {
            None => Some(""),
            Some(Value::String(s)) => Some(s.as_str()),
            Some(_) => None,
        }
    }
    let (Some(Value::String(_)), Some(Value::String(_))) = (ours, theirs) else {
        return None;
    };
    Merger::merge_text(text(base)?, text(ours)?, text(theirs)?).into_clean()
}
