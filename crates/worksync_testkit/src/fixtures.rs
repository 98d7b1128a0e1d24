//! Entity and configuration fixtures.
//!
//! Every constructor returns a draft (version 0) that passes its kind's
//! validation.

use std::time::Duration;
use worksync_client::{BreakerConfig, ClientConfig, RetryConfig};
use worksync_protocol::{Credentials, Entity, EntityId, EntityKind, FieldValue, ScopeId};

/// A valid project draft.
pub fn project(name: &str) -> Entity {
    Entity::draft(EntityKind::Project).with_field("name", name)
}

/// The scope a project broadcasts under.
pub fn project_scope(project: &Entity) -> ScopeId {
    ScopeId::from(project.id)
}

/// A valid work item draft in `project`.
pub fn work_item(project: ScopeId, title: &str) -> Entity {
    Entity::draft(EntityKind::WorkItem)
        .in_project(project)
        .with_field("title", title)
}

/// A valid sprint draft in `project`.
pub fn sprint(project: ScopeId, name: &str) -> Entity {
    let starts = worksync_protocol::now_millis();
    Entity::draft(EntityKind::Sprint)
        .in_project(project)
        .with_field("name", name)
        .with_field("starts_at", FieldValue::Timestamp(starts))
        .with_field("ends_at", FieldValue::Timestamp(starts + 14 * 24 * 3600 * 1000))
}

/// A valid comment draft on `work_item`.
pub fn comment(project: ScopeId, work_item: EntityId, body: &str) -> Entity {
    Entity::draft(EntityKind::Comment)
        .in_project(project)
        .with_parent(work_item)
        .with_field("body", body)
}

/// A valid time entry draft on `work_item`.
pub fn time_entry(project: ScopeId, work_item: EntityId, minutes: i64) -> Entity {
    Entity::draft(EntityKind::TimeEntry)
        .in_project(project)
        .with_parent(work_item)
        .with_field("minutes", minutes)
}

/// A valid dependency link draft: `blocker` blocks `blocked`.
pub fn dependency_link(project: ScopeId, blocker: EntityId, blocked: EntityId) -> Entity {
    Entity::draft(EntityKind::DependencyLink)
        .in_project(project)
        .with_field("from", FieldValue::Id(blocker))
        .with_field("to", FieldValue::Id(blocked))
}

/// Client configuration tuned for tests: short backoff, a breaker that
/// recovers quickly and a bounded request timeout.
pub fn client_config(subject: &str) -> ClientConfig {
    client_config_with_token(subject, Vec::new())
}

/// Like [`client_config`], with an authentication token.
pub fn client_config_with_token(subject: &str, token: Vec<u8>) -> ClientConfig {
    ClientConfig::new(Credentials::new(subject, token))
        .with_request_timeout(Duration::from_secs(5))
        .with_retry(
            RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(100)),
        )
        .with_breaker(BreakerConfig::new(5).with_cooldown(Duration::from_millis(50)))
}
