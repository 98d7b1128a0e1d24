//! Authoritative entity storage.

use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use worksync_protocol::{now_millis, Entity, EntityId, EntityKind, ScopeId};

/// Storage behind the request handler.
///
/// `commit` is the only write path and performs the optimistic version
/// check atomically with the write.
pub trait EntityRepository: Send + Sync + 'static {
    /// Returns the stored entity, soft-deleted or not.
    fn get(&self, kind: EntityKind, id: EntityId) -> Option<Entity>;

    /// Returns every entity of `kind` broadcast under `scope`, including
    /// soft-deleted ones, ordered by id.
    fn list(&self, kind: EntityKind, scope: ScopeId) -> Vec<Entity>;

    /// Stores `entity` if the stored version equals `expected_version`.
    ///
    /// An expected version of 0 creates the entity and fails if the id is
    /// already taken. On success the stored entity carries version
    /// `expected_version + 1`.
    fn commit(&self, entity: Entity, expected_version: u64) -> ServerResult<Entity>;
}

/// In-memory repository.
#[derive(Default)]
pub struct MemoryRepository {
    entities: RwLock<HashMap<(EntityKind, EntityId), Entity>>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl EntityRepository for MemoryRepository {
    fn get(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        self.entities.read().get(&(kind, id)).cloned()
    }

    fn list(&self, kind: EntityKind, scope: ScopeId) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .entities
            .read()
            .values()
            .filter(|e| e.kind == kind && e.scopes().contains(&scope))
            .cloned()
            .collect();
        entities.sort_by_key(|e| e.id);
        entities
    }

    fn commit(&self, mut entity: Entity, expected_version: u64) -> ServerResult<Entity> {
        let key = (entity.kind, entity.id);
        let mut entities = self.entities.write();

        match (entities.get(&key), expected_version) {
            (Some(existing), 0) => {
                return Err(ServerError::VersionConflict {
                    expected: 0,
                    actual: existing.version,
                });
            }
            (None, 0) => {}
            (None, _) => {
                return Err(ServerError::NotFound {
                    kind: entity.kind,
                    id: entity.id,
                });
            }
            (Some(existing), expected) if existing.version != expected => {
                return Err(ServerError::VersionConflict {
                    expected,
                    actual: existing.version,
                });
            }
            (Some(_), _) => {}
        }

        entity.version = expected_version + 1;
        entity.updated_at = now_millis();
        entities.insert(key, entity.clone());
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(project: ScopeId, title: &str) -> Entity {
        Entity::draft(EntityKind::WorkItem)
            .in_project(project)
            .with_field("title", title)
    }

    #[test]
    fn create_assigns_first_version() {
        let repo = MemoryRepository::new();
        let stored = repo.commit(item(ScopeId::new(), "A"), 0).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(repo.get(EntityKind::WorkItem, stored.id), Some(stored));
    }

    #[test]
    fn duplicate_create_conflicts() {
        let repo = MemoryRepository::new();
        let stored = repo.commit(item(ScopeId::new(), "A"), 0).unwrap();
        let err = repo.commit(stored.clone(), 0).unwrap_err();
        assert!(matches!(
            err,
            ServerError::VersionConflict {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[test]
    fn stale_version_conflicts_without_writing() {
        let repo = MemoryRepository::new();
        let mut stored = repo.commit(item(ScopeId::new(), "v1"), 0).unwrap();
        for n in 2..=5 {
            stored = repo
                .commit(stored.clone().with_field("title", format!("v{n}")), n - 1)
                .unwrap();
        }
        assert_eq!(stored.version, 5);

        let err = repo
            .commit(stored.clone().with_field("title", "stale"), 3)
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::VersionConflict {
                expected: 3,
                actual: 5
            }
        ));
        let current = repo.get(EntityKind::WorkItem, stored.id).unwrap();
        assert_eq!(current.version, 5);
        assert_eq!(current.text("title"), Some("v5"));
    }

    #[test]
    fn update_of_missing_entity_is_not_found() {
        let repo = MemoryRepository::new();
        let err = repo.commit(item(ScopeId::new(), "A"), 4).unwrap_err();
        assert!(matches!(err, ServerError::NotFound { .. }));
        assert!(repo.is_empty());
    }

    #[test]
    fn list_filters_by_kind_and_scope() {
        let repo = MemoryRepository::new();
        let scope = ScopeId::new();
        let other = ScopeId::new();
        repo.commit(item(scope, "A"), 0).unwrap();
        repo.commit(item(scope, "B"), 0).unwrap();
        repo.commit(item(other, "C"), 0).unwrap();
        repo.commit(
            Entity::draft(EntityKind::Sprint)
                .in_project(scope)
                .with_field("name", "S1"),
            0,
        )
        .unwrap();

        let listed = repo.list(EntityKind::WorkItem, scope);
        assert_eq!(listed.len(), 2);
        assert!(listed.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(repo.len(), 4);
    }
}
