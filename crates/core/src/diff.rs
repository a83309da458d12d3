//! Diff engine: ordered entity-level differences between two file states.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::blob;
use crate::errors::{ChangeError, CoreError, ParseError, PluginError};
use crate::models::{sort_reports, Change, DiffReport, EntityKey, LixFile, ReplicaId};
use crate::plugin::{default_entity_diff, index_entities, Entity};
use crate::registry::{PluginRegistry, RegisteredPlugin};
use crate::replica::{InMemoryReplica, Replica};

/// Stateless diff computation.
pub struct DiffEngine;

impl DiffEngine {
    /// Diff two states of one file.
    ///
    /// `plugins` are the plugins matching the file path in registration
    /// order; the first owns the file. An empty slice means the file is
    /// opaque and is diffed as a whole.
    pub async fn diff(
        plugins: &[Arc<RegisteredPlugin>],
        old: Option<&LixFile>,
        neu: Option<&LixFile>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        let Some(path) = neu.or(old).map(|f| f.path.as_str()) else {
            return Ok(Vec::new());
        };

        let Some((owner, supplementary)) = plugins.split_first() else {
            debug!(path, "no plugin matches, diffing as opaque file");
            return Ok(blob::whole_file_report(old, neu).into_iter().collect());
        };

        let owned = if owner.capabilities().whole_file_diff {
            owner.plugin().diff_file(old, neu).await
        } else {
            Self::structural_diff(owner, old, neu).await
        };
        let mut reports = match owned {
            Ok(reports) => reports,
            Err(PluginError::Parse(e)) => {
                warn!(plugin = owner.key(), path, error = %e, "parse failed, falling back to whole-file diff");
                blob::whole_file_report(old, neu).into_iter().collect()
            }
            Err(e) => return Err(e),
        };

        Self::check_reports(owner.key(), &reports)?;
        Self::merge_supplementary(&mut reports, supplementary, old, neu).await;

        sort_reports(&mut reports);
        info!(plugin = owner.key(), path, reports = reports.len(), "diff complete");
        Ok(reports)
    }

    /// Resolve the plugins for the file's path through `registry` and diff.
    pub async fn diff_path(
        registry: &PluginRegistry,
        old: Option<&LixFile>,
        neu: Option<&LixFile>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        let plugins = neu
            .or(old)
            .map(|f| registry.resolve(&f.path))
            .unwrap_or_default();
        Self::diff(&plugins, old, neu).await
    }

    /// Attribute reports to a file, plugin, and replica.
    pub fn to_changes(
        reports: Vec<DiffReport>,
        file_id: &str,
        plugin_key: &str,
        origin: &ReplicaId,
    ) -> Result<Vec<Change>, ChangeError> {
        reports
            .into_iter()
            .map(|r| Change::from_report(r, file_id, plugin_key, origin.clone()))
            .collect()
    }

    /// Diff `old -> neu`, convert the reports into changes stamped with the
    /// replica's id, and append them to its history.
    pub async fn record(
        registry: &PluginRegistry,
        replica: &InMemoryReplica,
        old: Option<&LixFile>,
        neu: Option<&LixFile>,
    ) -> Result<Vec<Change>, CoreError> {
        let Some(file) = neu.or(old) else {
            return Ok(Vec::new());
        };
        let plugins = registry.resolve(&file.path);
        let plugin_key = plugins
            .first()
            .map_or(blob::OPAQUE_PLUGIN_KEY, |p| p.key())
            .to_string();

        let reports = Self::diff(&plugins, old, neu).await?;
        let changes = Self::to_changes(reports, &file.id, &plugin_key, replica.id())?;
        replica.append(changes.clone()).await;
        debug!(file_id = %file.id, changes = changes.len(), "recorded changes");
        Ok(changes)
    }

    /// Parse both states and compare entity by entity.
    async fn structural_diff(
        owner: &RegisteredPlugin,
        old: Option<&LixFile>,
        neu: Option<&LixFile>,
    ) -> Result<Vec<DiffReport>, PluginError> {
        let old_entities = Self::parse_state(owner, old)?;
        let neu_entities = Self::parse_state(owner, neu)?;

        let keys: BTreeSet<&EntityKey> = old_entities.keys().chain(neu_entities.keys()).collect();
        let mut reports = Vec::new();
        for key in keys {
            let o = old_entities.get(key).map(|e| &e.snapshot);
            let n = neu_entities.get(key).map(|e| &e.snapshot);
            if o == n {
                continue;
            }
            if owner.capabilities().entity_diff {
                reports.extend(owner.plugin().diff_entity(key.entity_type, o, n).await?);
            } else {
                reports.extend(default_entity_diff(key.entity_type, o, n));
            }
        }
        debug!(
            plugin = owner.key(),
            old = old_entities.len(),
            neu = neu_entities.len(),
            reports = reports.len(),
            "structural diff"
        );
        Ok(reports)
    }

    fn parse_state(
        owner: &RegisteredPlugin,
        file: Option<&LixFile>,
    ) -> Result<BTreeMap<EntityKey, Entity>, ParseError> {
        let Some(file) = file else {
            return Ok(BTreeMap::new());
        };
        let entities = owner.plugin().parse(file)?;
        if let Some(undeclared) = entities
            .iter()
            .find(|e| !owner.capabilities().supports(e.kind))
        {
            return Err(ParseError::UndeclaredKind {
                plugin: owner.key().to_string(),
                kind: undeclared.kind.to_string(),
            });
        }
        index_entities(&file.path, entities)
    }

    /// Add reports from supplementary whole-file plugins for entity kinds the
    /// owner did not report. The owner wins on duplicate entities.
    async fn merge_supplementary(
        reports: &mut Vec<DiffReport>,
        supplementary: &[Arc<RegisteredPlugin>],
        old: Option<&LixFile>,
        neu: Option<&LixFile>,
    ) {
        let owner_kinds: BTreeSet<_> = reports.iter().map(|r| r.entity_type).collect();
        let mut seen: BTreeSet<EntityKey> = reports.iter().map(DiffReport::entity_key).collect();

        for extra in supplementary
            .iter()
            .filter(|p| p.capabilities().whole_file_diff)
        {
            let extra_reports = match extra.plugin().diff_file(old, neu).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(plugin = extra.key(), error = %e, "supplementary diff failed, skipping");
                    continue;
                }
            };
            if let Err(e) = Self::check_reports(extra.key(), &extra_reports) {
                warn!(plugin = extra.key(), error = %e, "supplementary diff invalid, skipping");
                continue;
            }
            for report in extra_reports {
                if owner_kinds.contains(&report.entity_type) {
                    continue;
                }
                if seen.insert(report.entity_key()) {
                    debug!(plugin = extra.key(), entity = %report.entity_key(), "supplementary report");
                    reports.push(report);
                }
            }
        }
    }

    fn check_reports(plugin: &str, reports: &[DiffReport]) -> Result<(), PluginError> {
        for report in reports {
            report.validate().map_err(|source| PluginError::InvalidReport {
                plugin: plugin.to_string(),
                source,
            })?;
        }
        Ok(())
    }
}
