//! Change events emitted after a mutation commits.

use crate::entity::{Entity, FieldValue};
use crate::id::{EntityId, ScopeId};
use crate::kind::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Type of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    /// Entity was created.
    Created,
    /// Entity was updated.
    Updated,
    /// Entity was soft-deleted.
    Deleted,
}

/// One changed field with its old and new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Field or attribute name.
    pub field: String,
    /// Value before the mutation (`Null` when absent).
    pub old_value: FieldValue,
    /// Value after the mutation (`Null` when removed).
    pub new_value: FieldValue,
}

/// A server-emitted notification describing an accepted mutation.
///
/// Change events are emitted only after the mutation has been committed.
/// They carry the full authoritative entity, so a receiver never needs to
/// replay the field changes to stay consistent; `changes` exists for
/// fine-grained UI diffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of the affected entity.
    pub kind: EntityKind,
    /// Affected entity.
    pub entity_id: EntityId,
    /// Scopes the event is broadcast under.
    pub scope_ids: Vec<ScopeId>,
    /// Type of change.
    pub change_type: ChangeType,
    /// Authoritative entity snapshot after the change.
    pub entity: Entity,
    /// Changed fields (updates only).
    pub changes: Vec<FieldChange>,
}

impl ChangeEvent {
    /// Creates a creation event.
    pub fn created(entity: Entity) -> Self {
        Self::new(ChangeType::Created, entity, Vec::new())
    }

    /// Creates an update event carrying the diff from `before`.
    ///
    /// The event is broadcast under the scopes of both revisions, so
    /// subscribers of a scope the entity just left still hear about it.
    pub fn updated(before: &Entity, entity: Entity) -> Self {
        let changes = diff(before, &entity);
        let mut event = Self::new(ChangeType::Updated, entity, changes);
        for scope in before.scopes() {
            if !event.scope_ids.contains(&scope) {
                event.scope_ids.push(scope);
            }
        }
        event
    }

    /// Creates a deletion event.
    pub fn deleted(entity: Entity) -> Self {
        Self::new(ChangeType::Deleted, entity, Vec::new())
    }

    fn new(change_type: ChangeType, entity: Entity, changes: Vec<FieldChange>) -> Self {
        Self {
            kind: entity.kind,
            entity_id: entity.id,
            scope_ids: entity.scopes(),
            change_type,
            entity,
            changes,
        }
    }

    /// Authoritative version carried by the event.
    pub fn version(&self) -> u64 {
        self.entity.version
    }

    /// Returns true if the event is broadcast under `scope`.
    pub fn in_scope(&self, scope: &ScopeId) -> bool {
        self.scope_ids.contains(scope)
    }
}

/// Computes the field-level changes between two revisions of an entity.
///
/// Covers kind-specific fields, attributes and the soft-delete marker.
/// Version and `updated_at` are bookkeeping and never reported.
pub fn diff(before: &Entity, after: &Entity) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    let names: BTreeSet<&String> = before.fields.keys().chain(after.fields.keys()).collect();
    for name in names {
        let old = before.fields.get(name).cloned().unwrap_or(FieldValue::Null);
        let new = after.fields.get(name).cloned().unwrap_or(FieldValue::Null);
        if old != new {
            changes.push(FieldChange {
                field: name.clone(),
                old_value: old,
                new_value: new,
            });
        }
    }

    let old_attrs = before.attributes.named_values();
    let new_attrs = after.attributes.named_values();
    for ((name, old), (_, new)) in old_attrs.into_iter().zip(new_attrs) {
        if old != new {
            changes.push(FieldChange {
                field: name.to_string(),
                old_value: old,
                new_value: new,
            });
        }
    }

    if before.deleted_at != after.deleted_at {
        changes.push(FieldChange {
            field: "deleted_at".to_string(),
            old_value: before.deleted_at.map(FieldValue::Timestamp).into(),
            new_value: after.deleted_at.map(FieldValue::Timestamp).into(),
        });
    }

    changes
}
