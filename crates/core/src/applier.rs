//! Change applier: replays an ordered change set onto a base file.
//!
//! Application is deterministic. Changes are re-sorted into diff order
//! (creates, updates, deletes; then entity id, type, creation time, change
//! id) before they reach the plugin, so the supply order never matters.

use tracing::{debug, info};

use crate::blob;
use crate::errors::ApplyError;
use crate::models::{sort_changes, Change, EntityKind, LixFile, Operation};
use crate::plugin::ApplyArgs;
use crate::registry::RegisteredPlugin;
use crate::replica::Replica;

pub struct ChangeApplier;

impl ChangeApplier {
    /// Apply `changes` to `base` and return the new file bytes.
    ///
    /// `owner` is the plugin owning the file, `None` for opaque files.
    /// `replica` is handed through to plugins that override application.
    pub async fn apply(
        owner: Option<&RegisteredPlugin>,
        base: &LixFile,
        changes: &[Change],
        replica: Option<&dyn Replica>,
    ) -> Result<Vec<u8>, ApplyError> {
        if changes.is_empty() {
            return Ok(base.data.clone());
        }

        for change in changes {
            change.validate()?;
            if change.file_id != base.id {
                return Err(ApplyError::WrongFile {
                    change_id: change.id.clone(),
                    expected: base.id.clone(),
                    found: change.file_id.clone(),
                });
            }
        }

        let mut ordered = changes.to_vec();
        sort_changes(&mut ordered);

        let whole_file = ordered
            .iter()
            .filter(|c| c.entity_type == EntityKind::File)
            .count();
        if whole_file > 0 && whole_file < ordered.len() {
            return Err(ApplyError::MixedGranularity(base.id.clone()));
        }
        if whole_file > 0 {
            return Self::apply_whole_file(base, &ordered);
        }

        let owner = owner.ok_or_else(|| ApplyError::NoPlugin(base.path.clone()))?;
        if let Some(change) = ordered
            .iter()
            .find(|c| !owner.capabilities().supports(c.entity_type))
        {
            return Err(ApplyError::UnsupportedKind {
                plugin: owner.key().to_string(),
                kind: change.entity_type.to_string(),
            });
        }

        let data = owner
            .plugin()
            .apply_changes(ApplyArgs {
                replica,
                file: base,
                changes: &ordered,
            })
            .await?;
        info!(
            plugin = owner.key(),
            file_id = %base.id,
            changes = ordered.len(),
            bytes = data.len(),
            "applied changes"
        );
        Ok(data)
    }

    /// Replace the file content change by change, checking that each change
    /// was made against the content it replaces.
    fn apply_whole_file(base: &LixFile, changes: &[Change]) -> Result<Vec<u8>, ApplyError> {
        let mut current = base.data.clone();
        for change in changes {
            let current_digest = blob::digest(&current);
            let stale = change
                .before
                .as_ref()
                .and_then(blob::snapshot_digest)
                .is_some_and(|expected| expected != current_digest);

            match change.operation {
                // Empty content counts as an absent file.
                Operation::Create => {
                    if !current.is_empty() {
                        return Err(ApplyError::EntityExists(change.entity_key()));
                    }
                    current = Self::decode_after(change)?;
                }
                Operation::Update => {
                    if stale {
                        return Err(ApplyError::StaleBase {
                            operation: change.operation,
                            file_id: base.id.clone(),
                        });
                    }
                    current = Self::decode_after(change)?;
                }
                Operation::Delete => {
                    if stale {
                        return Err(ApplyError::StaleBase {
                            operation: change.operation,
                            file_id: base.id.clone(),
                        });
                    }
                    current.clear();
                }
            }
            debug!(file_id = %base.id, operation = %change.operation, bytes = current.len(), "whole-file change applied");
        }
        Ok(current)
    }

    fn decode_after(change: &Change) -> Result<Vec<u8>, ApplyError> {
        match &change.after {
            Some(after) => blob::decode_snapshot(after),
            None => Err(ApplyError::Decode(format!(
                "change {} carries no file content",
                change.id
            ))),
        }
    }
}
