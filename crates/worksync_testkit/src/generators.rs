//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random entities and patches that
//! keep the invariants the server enforces.

use proptest::prelude::*;
use worksync_protocol::{
    Edit, Entity, EntityId, EntityKind, EntityPatch, FieldValue, ScopeId,
};

/// Strategy for generating entity ids.
pub fn entity_id_strategy() -> impl Strategy<Value = EntityId> {
    prop::array::uniform16(any::<u8>()).prop_map(EntityId::from_bytes)
}

/// Strategy for generating scope ids.
pub fn scope_id_strategy() -> impl Strategy<Value = ScopeId> {
    entity_id_strategy().prop_map(ScopeId::from)
}

/// Strategy for picking an entity kind.
pub fn entity_kind_strategy() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(EntityKind::ALL.to_vec())
}

/// Strategy for non-blank titles within the length limit.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z0-9][A-Za-z0-9 ]{0,63}").expect("Invalid regex")
}

/// Strategy for arbitrary field values.
pub fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Null),
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i64>().prop_map(FieldValue::Integer),
        "[a-z ]{0,24}".prop_map(FieldValue::Text),
        entity_id_strategy().prop_map(FieldValue::Id),
        any::<u64>().prop_map(FieldValue::Timestamp),
    ]
}

/// Strategy for valid work item drafts.
pub fn work_item_strategy() -> impl Strategy<Value = Entity> {
    (
        scope_id_strategy(),
        title_strategy(),
        prop::option::of(any::<i64>()),
        prop::collection::btree_map("[a-z]{1,8}", field_value_strategy(), 0..4),
    )
        .prop_map(|(project, title, position, extra)| {
            let mut entity = Entity::draft(EntityKind::WorkItem).in_project(project);
            for (name, value) in extra {
                entity = entity.with_field(name, value);
            }
            entity.attributes.position = position;
            entity.with_field("title", title)
        })
}

/// Strategy for attribute edits.
pub fn edit_strategy<T, S>(value: S) -> impl Strategy<Value = Edit<T>>
where
    T: Clone + std::fmt::Debug + 'static,
    S: Strategy<Value = T> + 'static,
{
    prop_oneof![
        Just(Edit::Keep),
        Just(Edit::Clear),
        value.prop_map(Edit::Set),
    ]
}

/// Strategy for patches that keep a work item valid: the title is only
/// ever replaced with another valid title and the project is never
/// cleared.
pub fn work_item_patch_strategy() -> impl Strategy<Value = EntityPatch> {
    (
        prop::option::of(title_strategy()),
        prop::collection::btree_map("[a-z]{1,8}", field_value_strategy(), 0..4),
        edit_strategy(any::<i64>()),
    )
        .prop_map(|(title, fields, position)| {
            let mut patch = EntityPatch::new();
            for (name, value) in fields {
                if name != "title" {
                    patch = patch.set(name, value);
                }
            }
            if let Some(title) = title {
                patch = patch.set("title", title);
            }
            patch.position(position)
        })
}
