//! Entity kinds and their per-kind strategy table.
//!
//! Every kind shares the same [`Entity`] shape. What differs per kind is
//! captured in a small table of plain functions ([`KindStrategy`]) instead of
//! a type hierarchy: which optional attributes the kind may carry, how it is
//! validated, how a patch is merged over it, and which scopes it is broadcast
//! to.

use crate::entity::{Entity, EntityPatch, FieldValue};
use crate::id::ScopeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of short text fields such as titles and names.
pub const MAX_TITLE_LEN: usize = 500;

/// The kinds of synchronized entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A unit of work.
    WorkItem,
    /// A project; also the scope everything else is broadcast under.
    Project,
    /// A time-boxed iteration.
    Sprint,
    /// A comment on a work item.
    Comment,
    /// Time logged against a work item.
    TimeEntry,
    /// A blocking dependency between two work items.
    DependencyLink,
}

impl EntityKind {
    /// All entity kinds.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::WorkItem,
        EntityKind::Project,
        EntityKind::Sprint,
        EntityKind::Comment,
        EntityKind::TimeEntry,
        EntityKind::DependencyLink,
    ];

    /// Returns the strategy table for this kind.
    pub fn strategy(self) -> &'static KindStrategy {
        match self {
            EntityKind::WorkItem => &WORK_ITEM,
            EntityKind::Project => &PROJECT,
            EntityKind::Sprint => &SPRINT,
            EntityKind::Comment => &COMMENT,
            EntityKind::TimeEntry => &TIME_ENTRY,
            EntityKind::DependencyLink => &DEPENDENCY_LINK,
        }
    }

    /// Returns a stable lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::WorkItem => "work_item",
            EntityKind::Project => "project",
            EntityKind::Sprint => "sprint",
            EntityKind::Comment => "comment",
            EntityKind::TimeEntry => "time_entry",
            EntityKind::DependencyLink => "dependency_link",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Orthogonal capabilities a kind may have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Deleting sets `deleted_at` instead of removing the entity.
    pub soft_delete: bool,
    /// Belongs to a project (`attributes.project_id`).
    pub project_scoped: bool,
    /// Has a sort position (`attributes.position`).
    pub positioned: bool,
    /// Has a parent entity (`attributes.parent_id`).
    pub hierarchical: bool,
    /// Can be assigned to a user (`attributes.assignee_id`).
    pub assignable: bool,
}

/// An entity failed kind-specific validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {message}")]
pub struct ValidationError {
    /// Kind being validated.
    pub kind: EntityKind,
    /// What is wrong.
    pub message: String,
}

impl ValidationError {
    /// Creates a validation error.
    pub fn new(kind: EntityKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Per-kind behaviour table.
#[derive(Debug)]
pub struct KindStrategy {
    /// The kind this table describes.
    pub kind: EntityKind,
    /// Attributes this kind may carry.
    pub capabilities: Capabilities,
    /// Checks required fields and attribute capabilities.
    pub validate: fn(&Entity) -> Result<(), ValidationError>,
    /// Projects a patch over an entity.
    pub merge: fn(&Entity, &EntityPatch) -> Entity,
    /// Scopes the entity is broadcast to.
    pub scopes: fn(&Entity) -> Vec<ScopeId>,
}

impl KindStrategy {
    /// Validates an entity against this kind.
    pub fn validate(&self, entity: &Entity) -> Result<(), ValidationError> {
        if entity.kind != self.kind {
            return Err(ValidationError::new(
                self.kind,
                format!("entity is a {}", entity.kind),
            ));
        }
        check_capabilities(entity, self.capabilities)?;
        (self.validate)(entity)
    }

    /// Projects `patch` over `entity`.
    pub fn merge(&self, entity: &Entity, patch: &EntityPatch) -> Entity {
        (self.merge)(entity, patch)
    }
}

static WORK_ITEM: KindStrategy = KindStrategy {
    kind: EntityKind::WorkItem,
    capabilities: Capabilities {
        soft_delete: true,
        project_scoped: true,
        positioned: true,
        hierarchical: true,
        assignable: true,
    },
    validate: validate_work_item,
    merge: merge_patch,
    scopes: project_scope,
};

static PROJECT: KindStrategy = KindStrategy {
    kind: EntityKind::Project,
    capabilities: Capabilities {
        soft_delete: true,
        project_scoped: false,
        positioned: true,
        hierarchical: false,
        assignable: false,
    },
    validate: validate_project,
    merge: merge_patch,
    scopes: own_scope,
};

static SPRINT: KindStrategy = KindStrategy {
    kind: EntityKind::Sprint,
    capabilities: Capabilities {
        soft_delete: true,
        project_scoped: true,
        positioned: true,
        hierarchical: false,
        assignable: false,
    },
    validate: validate_sprint,
    merge: merge_patch,
    scopes: project_scope,
};

static COMMENT: KindStrategy = KindStrategy {
    kind: EntityKind::Comment,
    capabilities: Capabilities {
        soft_delete: true,
        project_scoped: true,
        positioned: false,
        hierarchical: true,
        assignable: false,
    },
    validate: validate_comment,
    merge: merge_patch,
    scopes: project_scope,
};

static TIME_ENTRY: KindStrategy = KindStrategy {
    kind: EntityKind::TimeEntry,
    capabilities: Capabilities {
        soft_delete: true,
        project_scoped: true,
        positioned: false,
        hierarchical: true,
        assignable: true,
    },
    validate: validate_time_entry,
    merge: merge_patch,
    scopes: project_scope,
};

static DEPENDENCY_LINK: KindStrategy = KindStrategy {
    kind: EntityKind::DependencyLink,
    capabilities: Capabilities {
        soft_delete: true,
        project_scoped: true,
        positioned: false,
        hierarchical: false,
        assignable: false,
    },
    validate: validate_dependency_link,
    merge: merge_link_patch,
    scopes: project_scope,
};

fn check_capabilities(entity: &Entity, caps: Capabilities) -> Result<(), ValidationError> {
    let attrs = &entity.attributes;
    let offending = [
        ("project_id", attrs.project_id.is_some() && !caps.project_scoped),
        ("parent_id", attrs.parent_id.is_some() && !caps.hierarchical),
        ("position", attrs.position.is_some() && !caps.positioned),
        ("assignee_id", attrs.assignee_id.is_some() && !caps.assignable),
    ];
    for (name, bad) in offending {
        if bad {
            return Err(ValidationError::new(
                entity.kind,
                format!("{name} is not supported"),
            ));
        }
    }
    if caps.project_scoped && attrs.project_id.is_none() {
        return Err(ValidationError::new(entity.kind, "project_id is required"));
    }
    if entity.deleted_at.is_some() && !caps.soft_delete {
        return Err(ValidationError::new(entity.kind, "cannot be deleted"));
    }
    Ok(())
}

fn require_text<'a>(entity: &'a Entity, name: &str) -> Result<&'a str, ValidationError> {
    match entity.field(name) {
        Some(FieldValue::Text(text)) if !text.trim().is_empty() => {
            if text.len() > MAX_TITLE_LEN && name != "body" {
                Err(ValidationError::new(
                    entity.kind,
                    format!("{name} exceeds {MAX_TITLE_LEN} bytes"),
                ))
            } else {
                Ok(text)
            }
        }
        Some(FieldValue::Text(_)) => Err(ValidationError::new(
            entity.kind,
            format!("{name} must not be blank"),
        )),
        Some(_) => Err(ValidationError::new(
            entity.kind,
            format!("{name} must be text"),
        )),
        None => Err(ValidationError::new(
            entity.kind,
            format!("{name} is required"),
        )),
    }
}

fn validate_work_item(entity: &Entity) -> Result<(), ValidationError> {
    require_text(entity, "title")?;
    if entity.attributes.parent_id == Some(entity.id) {
        return Err(ValidationError::new(
            entity.kind,
            "work item cannot be its own parent",
        ));
    }
    Ok(())
}

fn validate_project(entity: &Entity) -> Result<(), ValidationError> {
    require_text(entity, "name").map(|_| ())
}

fn validate_sprint(entity: &Entity) -> Result<(), ValidationError> {
    require_text(entity, "name")?;
    let starts = entity.field("starts_at");
    let ends = entity.field("ends_at");
    if let (Some(FieldValue::Timestamp(start)), Some(FieldValue::Timestamp(end))) = (starts, ends)
    {
        if start >= end {
            return Err(ValidationError::new(
                entity.kind,
                "sprint must end after it starts",
            ));
        }
    }
    Ok(())
}

fn validate_comment(entity: &Entity) -> Result<(), ValidationError> {
    require_text(entity, "body")?;
    if entity.attributes.parent_id.is_none() {
        return Err(ValidationError::new(
            entity.kind,
            "comment must belong to a work item",
        ));
    }
    Ok(())
}

fn validate_time_entry(entity: &Entity) -> Result<(), ValidationError> {
    if entity.attributes.parent_id.is_none() {
        return Err(ValidationError::new(
            entity.kind,
            "time entry must belong to a work item",
        ));
    }
    match entity.field("minutes").and_then(FieldValue::as_integer) {
        Some(minutes) if minutes > 0 => Ok(()),
        _ => Err(ValidationError::new(
            entity.kind,
            "minutes must be a positive integer",
        )),
    }
}

fn validate_dependency_link(entity: &Entity) -> Result<(), ValidationError> {
    let from = entity.field("from").and_then(FieldValue::as_id);
    let to = entity.field("to").and_then(FieldValue::as_id);
    match (from, to) {
        (Some(from), Some(to)) if from != to => Ok(()),
        (Some(_), Some(_)) => Err(ValidationError::new(
            entity.kind,
            "a work item cannot depend on itself",
        )),
        _ => Err(ValidationError::new(
            entity.kind,
            "from and to must reference work items",
        )),
    }
}

fn merge_patch(entity: &Entity, patch: &EntityPatch) -> Entity {
    patch.apply_to(entity)
}

/// Link endpoints are immutable; re-pointing a dependency means a new link.
fn merge_link_patch(entity: &Entity, patch: &EntityPatch) -> Entity {
    let mut patch = patch.clone();
    patch.fields.remove("from");
    patch.fields.remove("to");
    patch.apply_to(entity)
}

fn project_scope(entity: &Entity) -> Vec<ScopeId> {
    entity.attributes.project_id.into_iter().collect()
}

fn own_scope(entity: &Entity) -> Vec<ScopeId> {
    vec![ScopeId::from(entity.id)]
}
