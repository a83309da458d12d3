//! Merge orchestration across many files.
//!
//! Every file runs as its own sequential pipeline: resolve the owning
//! plugin, detect conflicts between the two replicas, try to resolve each
//! one, and, only when nothing is left unresolved, apply the source's
//! non-conflicting changes plus the resolution changes onto the target's
//! file. Files are independent and run concurrently up to
//! `engine.max_parallel_files`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::applier::ChangeApplier;
use crate::config::EngineConfig;
use crate::conflict::{
    net_changes, pending_changes, Conflict, ConflictDetector, ConflictResolver, Resolution,
};
use crate::errors::CoreError;
use crate::models::{Change, EntityKey, LixFile};
use crate::registry::PluginRegistry;
use crate::replica::Replica;
use crate::telemetry::Telemetry;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How one file's merge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    /// Merged without conflicts.
    Merged,
    /// Merged after every conflict was resolved automatically.
    AutoResolved,
    /// Conflicts remain, or applying the merge failed.
    Unresolved,
    /// Detection or a plugin failed.
    Failed,
}

/// Result of merging one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileMergeResult {
    pub file_id: String,
    pub path: String,
    pub outcome: FileOutcome,
    /// New file bytes for `Merged` and `AutoResolved`.
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
    /// Changes applied onto the target, in application order.
    pub applied: Vec<Change>,
    /// Every conflict found, with resolution state.
    pub conflicts: Vec<Conflict>,
    pub error: Option<String>,
}

impl FileMergeResult {
    fn new(file: &LixFile, outcome: FileOutcome) -> Self {
        Self {
            file_id: file.id.clone(),
            path: file.path.clone(),
            outcome,
            data: None,
            applied: Vec::new(),
            conflicts: Vec::new(),
            error: None,
        }
    }

    fn failed(file: &LixFile, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(file, FileOutcome::Failed)
        }
    }

    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }
}

/// Summary counters for one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub files: usize,
    pub conflicts: usize,
    pub resolved_conflicts: usize,
    pub applied_changes: usize,
}

/// Files partitioned by outcome, each list sorted by file id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub merged: Vec<FileMergeResult>,
    pub auto_resolved: Vec<FileMergeResult>,
    pub unresolved: Vec<FileMergeResult>,
    pub failed: Vec<FileMergeResult>,
    pub stats: MergeStats,
}

impl MergeReport {
    fn push(&mut self, result: FileMergeResult) {
        self.stats.files += 1;
        self.stats.conflicts += result.conflicts.len();
        self.stats.resolved_conflicts += result.conflicts.iter().filter(|c| c.resolved).count();
        self.stats.applied_changes += result.applied.len();
        match result.outcome {
            FileOutcome::Merged => self.merged.push(result),
            FileOutcome::AutoResolved => self.auto_resolved.push(result),
            FileOutcome::Unresolved => self.unresolved.push(result),
            FileOutcome::Failed => self.failed.push(result),
        }
    }

    fn sort(&mut self) {
        for list in [
            &mut self.merged,
            &mut self.auto_resolved,
            &mut self.unresolved,
            &mut self.failed,
        ] {
            list.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        }
    }

    /// Result for one file, whatever its outcome.
    pub fn get(&self, file_id: &str) -> Option<&FileMergeResult> {
        self.merged
            .iter()
            .chain(&self.auto_resolved)
            .chain(&self.unresolved)
            .chain(&self.failed)
            .find(|r| r.file_id == file_id)
    }

    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty() && self.failed.is_empty()
    }

    fn telemetry_properties(&self) -> Map<String, Value> {
        let mut properties = Map::new();
        properties.insert("files".into(), self.stats.files.into());
        properties.insert("merged".into(), self.merged.len().into());
        properties.insert("auto_resolved".into(), self.auto_resolved.len().into());
        properties.insert("unresolved".into(), self.unresolved.len().into());
        properties.insert("failed".into(), self.failed.len().into());
        properties.insert("conflicts".into(), self.stats.conflicts.into());
        properties
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct MergeEngine {
    registry: Arc<PluginRegistry>,
    config: Arc<EngineConfig>,
    telemetry: Telemetry,
}

impl MergeEngine {
    pub fn new(registry: Arc<PluginRegistry>, config: EngineConfig) -> Self {
        let telemetry = Telemetry::from_config(&config.telemetry);
        Self {
            registry,
            config: Arc::new(config),
            telemetry,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Merge `source` into `target` for `files`, the target's current files.
    ///
    /// Duplicate file ids are merged once (first occurrence wins). One file's
    /// failure never affects another.
    pub async fn merge(
        &self,
        source: Arc<dyn Replica>,
        target: Arc<dyn Replica>,
        files: Vec<LixFile>,
    ) -> MergeReport {
        let mut unique: BTreeMap<String, LixFile> = BTreeMap::new();
        for file in files {
            unique.entry(file.id.clone()).or_insert(file);
        }
        info!(
            source = %source.id(),
            target = %target.id(),
            files = unique.len(),
            "starting merge"
        );

        let permits = Arc::new(Semaphore::new(self.config.engine.max_parallel_files.max(1)));
        let mut handles = Vec::with_capacity(unique.len());
        for file in unique.into_values() {
            let registry = Arc::clone(&self.registry);
            let config = Arc::clone(&self.config);
            let source = Arc::clone(&source);
            let target = Arc::clone(&target);
            let permits = Arc::clone(&permits);
            let task_file = file.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                merge_file(&registry, &config, source.as_ref(), target.as_ref(), &task_file).await
            });
            handles.push((file, handle));
        }

        let mut report = MergeReport::default();
        for (file, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(file_id = %file.id, error = %e, "merge task aborted");
                    FileMergeResult::failed(&file, e)
                }
            };
            report.push(result);
        }
        report.sort();

        info!(
            merged = report.merged.len(),
            auto_resolved = report.auto_resolved.len(),
            unresolved = report.unresolved.len(),
            failed = report.failed.len(),
            "merge complete"
        );
        self.telemetry
            .capture("merge_completed", report.telemetry_properties());
        report
    }
}

/// The per-file pipeline.
async fn merge_file(
    registry: &PluginRegistry,
    config: &EngineConfig,
    source: &dyn Replica,
    target: &dyn Replica,
    file: &LixFile,
) -> FileMergeResult {
    let owner = match registry.owner(&file.path) {
        Ok(owner) => Some(owner),
        Err(e) => {
            debug!(path = %file.path, error = %e, "merging as opaque file");
            None
        }
    };
    let owner_ref = owner.as_deref();

    // Detect.
    let mut conflicts =
        match ConflictDetector::report(owner_ref, &file.id, source, target).await {
            Ok(conflicts) => conflicts,
            Err(e) => {
                warn!(file_id = %file.id, error = %e, "conflict detection failed");
                return FileMergeResult::failed(file, CoreError::from(e));
            }
        };

    // Resolve.
    let strategy = config.resolution.strategy_for(owner_ref.map(|o| o.key()));
    let mut resolutions = Vec::new();
    for conflict in &mut conflicts {
        let resolution = match ConflictResolver::try_resolve(owner_ref, conflict, strategy).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(conflict_id = %conflict.id, error = %e, "resolution failed");
                Resolution::Unresolved
            }
        };
        if ConflictResolver::record(conflict, &resolution) {
            if let Resolution::Resolved { change } = resolution {
                resolutions.push(change);
            }
        }
    }

    let unresolved = conflicts.iter().filter(|c| !c.resolved).count();
    if unresolved > 0 {
        info!(file_id = %file.id, conflicts = conflicts.len(), unresolved, "file left unresolved");
        return FileMergeResult {
            conflicts,
            ..FileMergeResult::new(file, FileOutcome::Unresolved)
        };
    }

    // Apply.
    let changes = match merge_changes(file, source, target, &conflicts, resolutions).await {
        Ok(changes) => changes,
        Err(e) => {
            warn!(file_id = %file.id, error = %e, "collecting changes failed");
            return FileMergeResult {
                conflicts,
                ..FileMergeResult::failed(file, e)
            };
        }
    };

    match ChangeApplier::apply(owner_ref, file, &changes, Some(target)).await {
        Ok(data) => {
            let outcome = if conflicts.is_empty() {
                FileOutcome::Merged
            } else {
                FileOutcome::AutoResolved
            };
            debug!(file_id = %file.id, path = %file.path, applied = changes.len(), ?outcome, "file merged");
            FileMergeResult {
                data: Some(data),
                applied: changes,
                conflicts,
                ..FileMergeResult::new(file, outcome)
            }
        }
        Err(e) => {
            warn!(file_id = %file.id, error = %e, "applying merge failed");
            FileMergeResult {
                conflicts,
                error: Some(e.to_string()),
                ..FileMergeResult::new(file, FileOutcome::Unresolved)
            }
        }
    }
}

/// The changes to apply onto the target: the source's net effect for every
/// entity not in conflict and not already identical on the target, plus the
/// resolution changes that actually move the target's state.
async fn merge_changes(
    file: &LixFile,
    source: &dyn Replica,
    target: &dyn Replica,
    conflicts: &[Conflict],
    resolutions: Vec<Change>,
) -> Result<Vec<Change>, CoreError> {
    let (source_changes, target_changes) = pending_changes(&file.id, source, target).await?;
    let source_net = net_changes(&file.id, &source_changes);
    let target_net = net_changes(&file.id, &target_changes);

    let conflicted: BTreeSet<&EntityKey> = conflicts.iter().map(|c| &c.entity).collect();
    let target_state = |key: &EntityKey| target_net.get(key).map(|net| &net.after);

    let mut changes = Vec::new();
    for (key, net) in &source_net {
        if conflicted.contains(key) {
            continue;
        }
        if target_state(key) == Some(&net.after) {
            debug!(file_id = %file.id, entity = %key, "already present on target, skipping");
            continue;
        }
        changes.push(net.to_change()?);
    }
    for change in resolutions {
        if target_state(&change.entity_key()) == Some(&change.after) {
            debug!(file_id = %file.id, entity = %change.entity_key(), "target keeps its value");
            continue;
        }
        changes.push(change);
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessRole;
    use crate::conflict::ResolutionStrategy;
    use crate::diff::DiffEngine;
    use crate::replica::InMemoryReplica;
    use crate::test_support::RecordPlugin;
    use serde_json::json;

    fn registry() -> Arc<PluginRegistry> {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(RecordPlugin::new("records", "*.json")))
            .unwrap();
        Arc::new(registry)
    }

    fn config(strategy: ResolutionStrategy) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.engine.role = ProcessRole::Main;
        config.engine.max_parallel_files = 2;
        config.resolution.strategy = strategy;
        config
    }

    async fn edit(
        registry: &PluginRegistry,
        replica: &InMemoryReplica,
        old: &LixFile,
        neu: &LixFile,
    ) {
        DiffEngine::record(registry, replica, Some(old), Some(neu))
            .await
            .unwrap();
    }

    fn parsed(data: &[u8]) -> Value {
        serde_json::from_slice(data).unwrap()
    }

    #[tokio::test]
    async fn test_disjoint_edits_merge_cleanly() {
        let registry = registry();
        let base = RecordPlugin::file("f1", "data.json", json!({"a": 1, "b": 2}));
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));

        let ours = RecordPlugin::file("f1", "data.json", json!({"a": 10, "b": 2}));
        let theirs = RecordPlugin::file("f1", "data.json", json!({"a": 1, "b": 2, "c": 3}));
        edit(&registry, &source, &base, &ours).await;
        edit(&registry, &target, &base, &theirs).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual));
        let report = engine
            .merge(source, target, vec![theirs.clone(), theirs.clone()])
            .await;

        assert_eq!(report.stats.files, 1);
        assert_eq!(report.merged.len(), 1);
        let merged = &report.merged[0];
        assert_eq!(merged.outcome, FileOutcome::Merged);
        assert_eq!(
            parsed(merged.data.as_ref().unwrap()),
            json!({"a": 10, "b": 2, "c": 3})
        );
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_conflict_left_unresolved_under_manual() {
        let registry = registry();
        let base = RecordPlugin::file("f1", "data.json", json!({"a": 1}));
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));

        let ours = RecordPlugin::file("f1", "data.json", json!({"a": 2}));
        let theirs = RecordPlugin::file("f1", "data.json", json!({"a": 3}));
        edit(&registry, &source, &base, &ours).await;
        edit(&registry, &target, &base, &theirs).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual));
        let report = engine.merge(source, target, vec![theirs]).await;

        assert_eq!(report.unresolved.len(), 1);
        let result = &report.unresolved[0];
        assert!(result.data.is_none());
        assert_eq!(result.unresolved_conflicts().count(), 1);
        assert_eq!(report.stats.resolved_conflicts, 0);
    }

    #[tokio::test]
    async fn test_last_writer_wins_auto_resolves() {
        let registry = registry();
        let base = RecordPlugin::file("f1", "data.json", json!({"a": 1, "b": 1}));
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));

        let theirs = RecordPlugin::file("f1", "data.json", json!({"a": 3, "b": 1}));
        edit(&registry, &target, &base, &theirs).await;
        // The source edits later and therefore wins.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let ours = RecordPlugin::file("f1", "data.json", json!({"a": 2, "b": 5}));
        edit(&registry, &source, &base, &ours).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::LastWriterWins));
        let report = engine.merge(source, target, vec![theirs]).await;

        assert_eq!(report.auto_resolved.len(), 1);
        let result = &report.auto_resolved[0];
        assert!(result.conflicts.iter().all(|c| c.resolved));
        assert_eq!(parsed(result.data.as_ref().unwrap()), json!({"a": 2, "b": 5}));
        assert_eq!(report.stats.resolved_conflicts, 1);
    }

    #[tokio::test]
    async fn test_opaque_files_merge_and_conflict() {
        let registry = registry();
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));

        // f2: only the source changed it.
        let logo = LixFile::new("f2", "logo.png", vec![1, 2, 3]);
        let logo_new = logo.with_data(vec![4, 5, 6]);
        edit(&registry, &source, &logo, &logo_new).await;

        // f3: both changed it.
        let icon = LixFile::new("f3", "icon.png", vec![0]);
        let icon_ours = icon.with_data(vec![1]);
        let icon_theirs = icon.with_data(vec![2]);
        edit(&registry, &source, &icon, &icon_ours).await;
        edit(&registry, &target, &icon, &icon_theirs).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual));
        let report = engine
            .merge(source, target, vec![logo, icon_theirs])
            .await;

        let f2 = report.get("f2").unwrap();
        assert_eq!(f2.outcome, FileOutcome::Merged);
        assert_eq!(f2.data.as_deref(), Some(&[4u8, 5, 6][..]));

        let f3 = report.get("f3").unwrap();
        assert_eq!(f3.outcome, FileOutcome::Unresolved);
        assert_eq!(
            f3.conflicts[0].conflict_type,
            crate::conflict::ConflictType::WholeFile
        );
    }

    #[tokio::test]
    async fn test_identical_edits_are_skipped() {
        let registry = registry();
        let base = RecordPlugin::file("f1", "data.json", json!({"a": 1}));
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));

        let both = RecordPlugin::file("f1", "data.json", json!({"a": 7}));
        edit(&registry, &source, &base, &both).await;
        edit(&registry, &target, &base, &both).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual));
        let report = engine.merge(source, target, vec![both.clone()]).await;

        let result = report.get("f1").unwrap();
        assert_eq!(result.outcome, FileOutcome::Merged);
        assert!(result.applied.is_empty());
        assert_eq!(result.data.as_deref(), Some(both.data.as_slice()));
    }

    #[tokio::test]
    async fn test_apply_failure_is_unresolved_and_isolated() {
        let registry = registry();
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));

        // The source updates an entity the target file does not contain.
        let base = RecordPlugin::file("f1", "data.json", json!({"a": 1}));
        let ours = RecordPlugin::file("f1", "data.json", json!({"a": 2}));
        edit(&registry, &source, &base, &ours).await;
        let target_file = RecordPlugin::file("f1", "data.json", json!({}));

        let other = RecordPlugin::file("f4", "other.json", json!({"x": 1}));
        let other_new = RecordPlugin::file("f4", "other.json", json!({"x": 2}));
        edit(&registry, &source, &other, &other_new).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual));
        let report = engine
            .merge(source, target, vec![target_file, other])
            .await;

        let f1 = report.get("f1").unwrap();
        assert_eq!(f1.outcome, FileOutcome::Unresolved);
        assert!(f1.error.is_some());
        assert_eq!(report.get("f4").unwrap().outcome, FileOutcome::Merged);
    }

    #[tokio::test]
    async fn test_shared_history_keeps_edit_delete_conflict() {
        let registry = registry();
        let base = RecordPlugin::file("f1", "data.json", json!({"msg.greeting": "Hi"}));
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));

        // Both replicas hold the same creation record.
        let created = DiffEngine::record(&registry, &source, None, Some(&base))
            .await
            .unwrap();
        target.append(created).await;

        let ours = RecordPlugin::file("f1", "data.json", json!({"msg.greeting": "Hello"}));
        let theirs = RecordPlugin::file("f1", "data.json", json!({}));
        edit(&registry, &source, &base, &ours).await;
        edit(&registry, &target, &base, &theirs).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual));
        let report = engine.merge(source, target, vec![theirs]).await;

        let result = report.get("f1").unwrap();
        assert_eq!(result.outcome, FileOutcome::Unresolved);
        assert!(result.data.is_none());
        assert_eq!(result.conflicts.len(), 1);
        let conflict = &result.conflicts[0];
        assert_eq!(
            conflict.conflict_type,
            crate::conflict::ConflictType::EditDelete
        );
        assert_eq!(conflict.base, Some(RecordPlugin::record("msg.greeting", "Hi")));
    }

    #[tokio::test]
    async fn test_shared_history_alone_applies_nothing() {
        let registry = registry();
        let file = RecordPlugin::file("f1", "data.json", json!({"a": 1}));
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));
        let created = DiffEngine::record(&registry, &source, None, Some(&file))
            .await
            .unwrap();
        target.append(created).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual));
        let report = engine.merge(source, target, vec![file.clone()]).await;

        let result = report.get("f1").unwrap();
        assert_eq!(result.outcome, FileOutcome::Merged);
        assert!(result.applied.is_empty());
        assert_eq!(result.data.as_deref(), Some(file.data.as_slice()));
    }

    #[tokio::test]
    async fn test_detection_failure_fails_only_that_file() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(
                RecordPlugin::new("broken", "broken/*.json").broken_detection(),
            ))
            .unwrap();
        registry
            .register(Arc::new(RecordPlugin::new("records", "*.json")))
            .unwrap();
        let registry = Arc::new(registry);
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));

        let bad = RecordPlugin::file("f1", "broken/data.json", json!({"a": 1}));
        let bad_new = RecordPlugin::file("f1", "broken/data.json", json!({"a": 2}));
        edit(&registry, &source, &bad, &bad_new).await;

        let good = RecordPlugin::file("f2", "data.json", json!({"x": 1}));
        let good_new = RecordPlugin::file("f2", "data.json", json!({"x": 2}));
        edit(&registry, &source, &good, &good_new).await;

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual));
        let report = engine.merge(source, target, vec![bad, good]).await;

        assert_eq!(report.failed.len(), 1);
        let failed = &report.failed[0];
        assert_eq!(failed.file_id, "f1");
        assert_eq!(failed.outcome, FileOutcome::Failed);
        assert!(failed.data.is_none());
        assert!(failed.error.as_deref().unwrap().contains("unreadable"));

        assert_eq!(report.merged.len(), 1);
        let merged = report.get("f2").unwrap();
        assert_eq!(merged.outcome, FileOutcome::Merged);
        assert_eq!(parsed(merged.data.as_ref().unwrap()), json!({"x": 2}));
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_telemetry_captures_summary() {
        use crate::telemetry::TelemetryForwarder;

        let registry = registry();
        let source = Arc::new(InMemoryReplica::new("source"));
        let target = Arc::new(InMemoryReplica::new("target"));
        let telemetry = Telemetry::Enabled(Arc::new(TelemetryForwarder::new("token")));

        let engine = MergeEngine::new(registry, config(ResolutionStrategy::Manual))
            .with_telemetry(telemetry);
        let report = engine
            .merge(source, target, vec![LixFile::new("f1", "a.json", b"{}".to_vec())])
            .await;
        assert_eq!(report.merged.len(), 1);

        let events = engine.telemetry().drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].properties["files"], json!(1));
    }
}
