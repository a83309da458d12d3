//! Read access to a replica's change history.
//!
//! The merge pipeline only needs to list changes per file or per entity; the
//! storage behind a replica is someone else's concern. [`InMemoryReplica`] is
//! an append-only implementation used for embedding and tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::ReplicaError;
use crate::models::{Change, EntityKey, ReplicaId};

/// Read-only view of a replica's history.
#[async_trait]
pub trait Replica: Send + Sync {
    fn id(&self) -> &ReplicaId;

    /// Changes recorded for a file, oldest first.
    async fn changes_for_file(&self, file_id: &str) -> Result<Vec<Change>, ReplicaError>;

    /// Changes recorded for one entity of a file, oldest first.
    async fn changes_for_entity(
        &self,
        file_id: &str,
        entity: &EntityKey,
    ) -> Result<Vec<Change>, ReplicaError> {
        let changes = self.changes_for_file(file_id).await?;
        Ok(changes
            .into_iter()
            .filter(|c| c.entity_type == entity.entity_type && c.entity_id == entity.entity_id)
            .collect())
    }
}

/// Append-only, in-memory change history.
pub struct InMemoryReplica {
    id: ReplicaId,
    changes: RwLock<Vec<Change>>,
}

impl InMemoryReplica {
    pub fn new(id: impl Into<ReplicaId>) -> Self {
        Self {
            id: id.into(),
            changes: RwLock::new(Vec::new()),
        }
    }

    /// Append changes to the end of the history. Existing records are never
    /// touched.
    pub async fn append(&self, changes: impl IntoIterator<Item = Change>) -> usize {
        let mut history = self.changes.write().await;
        let before = history.len();
        history.extend(changes);
        let appended = history.len() - before;
        debug!(replica = %self.id, appended, total = history.len(), "appended changes");
        appended
    }

    pub async fn len(&self) -> usize {
        self.changes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.changes.read().await.is_empty()
    }

    /// Ids of every file with at least one recorded change.
    pub async fn file_ids(&self) -> BTreeSet<String> {
        self.changes
            .read()
            .await
            .iter()
            .map(|c| c.file_id.clone())
            .collect()
    }

    /// Full history snapshot, oldest first.
    pub async fn changes(&self) -> Vec<Change> {
        self.changes.read().await.clone()
    }
}

#[async_trait]
impl Replica for InMemoryReplica {
    fn id(&self) -> &ReplicaId {
        &self.id
    }

    async fn changes_for_file(&self, file_id: &str) -> Result<Vec<Change>, ReplicaError> {
        Ok(self
            .changes
            .read()
            .await
            .iter()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, Snapshot};

    fn create(file_id: &str, entity: &str, origin: &str) -> Change {
        Change::from_states(
            file_id,
            EntityKind::Record,
            None,
            Some(Snapshot::new(entity).with_field("value", "v")),
            "test",
            ReplicaId::from(origin),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let replica = InMemoryReplica::new("a");
        assert!(replica.is_empty().await);

        let appended = replica
            .append(vec![
                create("f1", "x", "a"),
                create("f2", "y", "a"),
                create("f1", "z", "a"),
            ])
            .await;
        assert_eq!(appended, 3);
        assert_eq!(replica.len().await, 3);

        let f1 = replica.changes_for_file("f1").await.unwrap();
        assert_eq!(f1.len(), 2);
        assert_eq!(f1[0].entity_id, "x");
        assert_eq!(f1[1].entity_id, "z");

        let z = replica
            .changes_for_entity("f1", &EntityKey::new(EntityKind::Record, "z"))
            .await
            .unwrap();
        assert_eq!(z.len(), 1);

        let ids: Vec<String> = replica.file_ids().await.into_iter().collect();
        assert_eq!(ids, vec!["f1".to_string(), "f2".to_string()]);
    }
}
