//! Versioned entity model.

use crate::id::{EntityId, ScopeId};
use crate::kind::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Returns the current wall-clock time in Unix milliseconds.
pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Millis
}

/// A dynamically typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Absent value. Setting a field to `Null` in a patch removes it.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Reference to another entity.
    Id(EntityId),
    /// Point in time, Unix milliseconds.
    Timestamp(Millis),
}

impl FieldValue {
    /// Returns the text if this is a `Text` value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is an `Integer` value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the referenced id if this is an `Id` value.
    pub fn as_id(&self) -> Option<EntityId> {
        match self {
            FieldValue::Id(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<EntityId> for FieldValue {
    fn from(id: EntityId) -> Self {
        FieldValue::Id(id)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Capability-gated attributes shared across entity kinds.
///
/// Which of these a kind may carry is declared by its
/// [`Capabilities`](crate::Capabilities).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// Owning project (project-scoped kinds).
    pub project_id: Option<ScopeId>,
    /// Parent entity (hierarchical kinds).
    pub parent_id: Option<EntityId>,
    /// Sort position among siblings (positioned kinds).
    pub position: Option<i64>,
    /// Assigned user (assignable kinds).
    pub assignee_id: Option<EntityId>,
}

impl Attributes {
    /// Attribute names paired with their current values, for diffing.
    pub fn named_values(&self) -> [(&'static str, FieldValue); 4] {
        [
            (
                "project_id",
                self.project_id.map(EntityId::from).into(),
            ),
            ("parent_id", self.parent_id.into()),
            ("position", self.position.into()),
            ("assignee_id", self.assignee_id.into()),
        ]
    }

    fn apply(&self, patch: &AttributePatch) -> Self {
        Self {
            project_id: patch.project_id.apply(self.project_id),
            parent_id: patch.parent_id.apply(self.parent_id),
            position: patch.position.apply(self.position),
            assignee_id: patch.assignee_id.apply(self.assignee_id),
        }
    }
}

/// A single attribute edit within a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edit<T> {
    /// Leave the current value untouched.
    #[default]
    Keep,
    /// Replace the current value.
    Set(T),
    /// Remove the current value.
    Clear,
}

impl<T: Copy> Edit<T> {
    /// Applies the edit to a current value.
    pub fn apply(&self, current: Option<T>) -> Option<T> {
        match self {
            Edit::Keep => current,
            Edit::Set(value) => Some(*value),
            Edit::Clear => None,
        }
    }

    /// Returns true for `Keep`.
    pub fn is_keep(&self) -> bool {
        matches!(self, Edit::Keep)
    }
}

/// Attribute edits carried by a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePatch {
    /// Edit to the owning project.
    pub project_id: Edit<ScopeId>,
    /// Edit to the parent entity.
    pub parent_id: Edit<EntityId>,
    /// Edit to the sort position.
    pub position: Edit<i64>,
    /// Edit to the assignee.
    pub assignee_id: Edit<EntityId>,
}

impl AttributePatch {
    fn is_empty(&self) -> bool {
        self.project_id.is_keep()
            && self.parent_id.is_keep()
            && self.position.is_keep()
            && self.assignee_id.is_keep()
    }
}

/// Requested changes to an existing entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPatch {
    /// Field values to set. A `Null` value removes the field.
    pub fields: BTreeMap<String, FieldValue>,
    /// Attribute edits.
    pub attributes: AttributePatch,
}

impl EntityPatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Removes a field.
    pub fn remove(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldValue::Null);
        self
    }

    /// Moves the entity to another project.
    pub fn project(mut self, edit: Edit<ScopeId>) -> Self {
        self.attributes.project_id = edit;
        self
    }

    /// Edits the parent entity.
    pub fn parent(mut self, edit: Edit<EntityId>) -> Self {
        self.attributes.parent_id = edit;
        self
    }

    /// Edits the sort position.
    pub fn position(mut self, edit: Edit<i64>) -> Self {
        self.attributes.position = edit;
        self
    }

    /// Edits the assignee.
    pub fn assignee(mut self, edit: Edit<EntityId>) -> Self {
        self.attributes.assignee_id = edit;
        self
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.attributes.is_empty()
    }

    /// Projects the patch over `entity`.
    ///
    /// Version and timestamps are left untouched: the server assigns them.
    pub fn apply_to(&self, entity: &Entity) -> Entity {
        let mut merged = entity.clone();
        for (name, value) in &self.fields {
            if value.is_null() {
                merged.fields.remove(name);
            } else {
                merged.fields.insert(name.clone(), value.clone());
            }
        }
        merged.attributes = entity.attributes.apply(&self.attributes);
        merged
    }
}

/// A synchronized, versioned entity.
///
/// `version` starts at 1 when the server first commits the entity and grows
/// by exactly one per accepted mutation. A client-side draft that the server
/// has not confirmed yet has version 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity identifier.
    pub id: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Server-assigned version.
    pub version: u64,
    /// Time of the last accepted mutation.
    pub updated_at: Millis,
    /// Soft-delete marker.
    pub deleted_at: Option<Millis>,
    /// Capability-gated attributes.
    pub attributes: Attributes,
    /// Kind-specific fields.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    /// Creates an unconfirmed draft of the given kind with a fresh id.
    pub fn draft(kind: EntityKind) -> Self {
        Self {
            id: EntityId::new(),
            kind,
            version: 0,
            updated_at: now_millis(),
            deleted_at: None,
            attributes: Attributes::default(),
            fields: BTreeMap::new(),
        }
    }

    /// Sets the entity id.
    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = id;
        self
    }

    /// Sets a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets the owning project.
    pub fn in_project(mut self, project: ScopeId) -> Self {
        self.attributes.project_id = Some(project);
        self
    }

    /// Sets the parent entity.
    pub fn with_parent(mut self, parent: EntityId) -> Self {
        self.attributes.parent_id = Some(parent);
        self
    }

    /// Sets the sort position.
    pub fn at_position(mut self, position: i64) -> Self {
        self.attributes.position = Some(position);
        self
    }

    /// Sets the assignee.
    pub fn assigned_to(mut self, assignee: EntityId) -> Self {
        self.attributes.assignee_id = Some(assignee);
        self
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Returns a text field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_text)
    }

    /// Returns true if the entity is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns true once the server has committed at least one version.
    pub fn is_confirmed(&self) -> bool {
        self.version > 0
    }

    /// Returns the scopes this entity is broadcast to.
    pub fn scopes(&self) -> Vec<ScopeId> {
        (self.kind.strategy().scopes)(self)
    }
}
