//! End-to-end merge scenarios through the built-in plugins.

use std::sync::Arc;

use serde_json::{json, Value};

use lixmerge_core::conflict::{ConflictDetector, ConflictResolver, ConflictType, ResolutionStrategy};
use lixmerge_core::config::EngineConfig;
use lixmerge_core::merge_engine::{FileOutcome, MergeEngine};
use lixmerge_core::models::{DiffReport, EntityKind, LixFile, Operation, Snapshot};
use lixmerge_core::registry::PluginRegistry;
use lixmerge_core::replica::InMemoryReplica;
use lixmerge_core::{ChangeApplier, DiffEngine};
use lixmerge_plugins::builtin_registry;

// ===========================================================================
// Helpers
// ===========================================================================

const PATH: &str = "locales/en.messages.json";

fn messages(json: Value) -> LixFile {
    LixFile::new("en", PATH, serde_json::to_vec_pretty(&json).unwrap())
}

fn parsed(data: &[u8]) -> Value {
    serde_json::from_slice(data).unwrap()
}

fn msg(id: &str, value: &str) -> Snapshot {
    Snapshot::new(id).with_field("value", value)
}

fn registry() -> Arc<PluginRegistry> {
    Arc::new(builtin_registry().unwrap())
}

async fn edit(registry: &PluginRegistry, replica: &InMemoryReplica, old: &LixFile, neu: Option<&LixFile>) {
    DiffEngine::record(registry, replica, Some(old), neu)
        .await
        .unwrap();
}

fn base() -> LixFile {
    messages(json!([{"id": "msg.greeting", "value": "Hi"}]))
}

// ===========================================================================
// Examples
// ===========================================================================

#[tokio::test]
async fn test_diff_then_apply_reproduces_new_state() {
    let registry = registry();
    let old = base();
    let neu = messages(json!([
        {"id": "msg.greeting", "value": "Hello"},
        {"id": "msg.bye", "value": "Bye"}
    ]));

    let reports = DiffEngine::diff_path(&registry, Some(&old), Some(&neu))
        .await
        .unwrap();

    // Content matches the expected listing; creates are emitted first.
    let expected_update = DiffReport::update(
        EntityKind::Message,
        msg("msg.greeting", "Hi"),
        msg("msg.greeting", "Hello"),
    );
    let expected_create = DiffReport::create(EntityKind::Message, msg("msg.bye", "Bye"));
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0], expected_create);
    assert_eq!(reports[1].operation, Operation::Update);
    assert_eq!(reports[1].old, expected_update.old);
    assert_eq!(reports[1].neu, expected_update.neu);

    let wire = serde_json::to_value(&reports[0]).unwrap();
    assert_eq!(
        wire,
        json!({"type": "message", "operation": "create", "neu": {"id": "msg.bye", "value": "Bye"}})
    );

    let owner = registry.owner(PATH).unwrap();
    let changes = DiffEngine::to_changes(reports, "en", owner.key(), &"a".into()).unwrap();
    let data = ChangeApplier::apply(Some(&*owner), &old, &changes, None)
        .await
        .unwrap();
    assert_eq!(parsed(&data), parsed(&neu.data));
    assert_eq!(data, neu.data.iter().copied().chain([b'\n']).collect::<Vec<u8>>());
}

#[tokio::test]
async fn test_update_versus_delete_is_one_unresolved_conflict() {
    let registry = registry();
    let a = InMemoryReplica::new("a");
    let b = InMemoryReplica::new("b");

    let old = base();
    edit(&registry, &a, &old, Some(&messages(json!([{"id": "msg.greeting", "value": "Hello"}])))).await;
    edit(&registry, &b, &old, Some(&messages(json!([])))).await;

    let owner = registry.owner(PATH).unwrap();
    let conflicts = ConflictDetector::report(Some(&*owner), "en", &a, &b).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::EditDelete);

    let a_changes = a.changes().await;
    let b_changes = b.changes().await;
    assert_eq!(conflict.change_a.id, a_changes[0].id);
    assert_eq!(conflict.change_b.id, b_changes[0].id);

    let resolution = ConflictResolver::try_resolve(Some(&*owner), conflict, ResolutionStrategy::Manual)
        .await
        .unwrap();
    assert!(!resolution.is_resolved());

    // The same conflict from the other side has the same identity.
    let swapped = ConflictDetector::report(Some(&*owner), "en", &b, &a).await.unwrap();
    assert_eq!(swapped[0].id, conflict.id);
}

#[tokio::test]
async fn test_independent_edits_merge_cleanly() {
    let registry = registry();
    let source = Arc::new(InMemoryReplica::new("a"));
    let target = Arc::new(InMemoryReplica::new("b"));

    let old = base();
    let ours = messages(json!([{"id": "msg.greeting", "value": "Hello"}]));
    let theirs = messages(json!([
        {"id": "msg.greeting", "value": "Hi"},
        {"id": "msg.farewell", "value": "Farewell"}
    ]));
    edit(&registry, &source, &old, Some(&ours)).await;
    edit(&registry, &target, &old, Some(&theirs)).await;

    let owner = registry.owner(PATH).unwrap();
    let conflicts = ConflictDetector::report(Some(&*owner), "en", source.as_ref(), target.as_ref())
        .await
        .unwrap();
    assert!(conflicts.is_empty());

    let engine = MergeEngine::new(Arc::clone(&registry), EngineConfig::default());
    let report = engine.merge(source, target, vec![theirs]).await;
    assert_eq!(report.merged.len(), 1);
    assert_eq!(
        parsed(report.merged[0].data.as_ref().unwrap()),
        json!([
            {"id": "msg.greeting", "value": "Hello"},
            {"id": "msg.farewell", "value": "Farewell"}
        ])
    );
}

// ===========================================================================
// Plugin-specific resolution
// ===========================================================================

#[tokio::test]
async fn test_messages_field_union_auto_resolves() {
    let registry = registry();
    let source = Arc::new(InMemoryReplica::new("a"));
    let target = Arc::new(InMemoryReplica::new("b"));

    let old = base();
    let ours = messages(json!([{"id": "msg.greeting", "value": "Hello"}]));
    let theirs = messages(json!([{"id": "msg.greeting", "value": "Hi", "note": "formal?"}]));
    edit(&registry, &source, &old, Some(&ours)).await;
    edit(&registry, &target, &old, Some(&theirs)).await;

    let engine = MergeEngine::new(registry, EngineConfig::default());
    let report = engine.merge(source, target, vec![theirs]).await;

    assert_eq!(report.auto_resolved.len(), 1);
    let result = &report.auto_resolved[0];
    assert_eq!(result.outcome, FileOutcome::AutoResolved);
    assert_eq!(
        parsed(result.data.as_ref().unwrap()),
        json!([{"id": "msg.greeting", "value": "Hello", "note": "formal?"}])
    );
}

#[tokio::test]
async fn test_properties_last_writer_wins() {
    let registry = registry();
    let source = Arc::new(InMemoryReplica::new("a"));
    let target = Arc::new(InMemoryReplica::new("b"));

    let old = LixFile::new("app", "config/app.properties", b"# app\ntitle=Demo\nsize=1\n".to_vec());
    let theirs = old.with_data(b"# app\ntitle=Server\nsize=1\n".to_vec());
    edit(&registry, &target, &old, Some(&theirs)).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let ours = old.with_data(b"# app\ntitle=Laptop\nsize=2\n".to_vec());
    edit(&registry, &source, &old, Some(&ours)).await;

    let engine = MergeEngine::new(registry, EngineConfig::default());
    let report = engine.merge(source, target, vec![theirs]).await;

    assert_eq!(report.auto_resolved.len(), 1);
    let data = report.auto_resolved[0].data.clone().unwrap();
    assert_eq!(String::from_utf8(data).unwrap(), "# app\ntitle=Laptop\nsize=2\n");
}

#[tokio::test]
async fn test_unparseable_messages_fall_back_to_whole_file() {
    let registry = registry();
    let source = Arc::new(InMemoryReplica::new("a"));
    let target = Arc::new(InMemoryReplica::new("b"));

    let old = base();
    let broken = old.with_data(b"[{\"id\": ".to_vec());
    edit(&registry, &source, &old, Some(&broken)).await;

    let recorded = source.changes().await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].entity_type, EntityKind::File);

    let engine = MergeEngine::new(registry, EngineConfig::default());
    let report = engine.merge(source, target, vec![old]).await;
    assert_eq!(report.merged.len(), 1);
    assert_eq!(report.merged[0].data.as_deref(), Some(broken.data.as_slice()));
}
