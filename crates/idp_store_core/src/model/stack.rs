//! Stack entity: one service definition owned by a user.
//!
//! # Invariants
//! - `(name, created_by)` is unique.
//! - Team, cloud provider and blueprint are optional identifier references.

use super::{
    audit_accessors, stored_enum, Entity, EntityId, EntityKind, EntityRef, Payload, UniqueKey,
};
use chrono::{DateTime, Utc};

stored_enum! {
    pub enum StackType {
        Infrastructure => "INFRASTRUCTURE",
        RestfulServerless => "RESTFUL_SERVERLESS",
        RestfulApi => "RESTFUL_API",
        JavascriptWebApplication => "JAVASCRIPT_WEB_APPLICATION",
        EventDrivenServerless => "EVENT_DRIVEN_SERVERLESS",
        EventDrivenApi => "EVENT_DRIVEN_API",
    }
}

stored_enum! {
    pub enum ProgrammingLanguage {
        Quarkus => "QUARKUS",
        NodeJs => "NODE_JS",
        React => "REACT",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stack {
    pub id: Option<EntityId>,
    pub name: String,
    pub description: Option<String>,
    pub repository_url: Option<String>,
    pub stack_type: StackType,
    pub programming_language: Option<ProgrammingLanguage>,
    pub is_public: bool,
    pub created_by: String,
    pub team_id: Option<EntityId>,
    pub cloud_provider_id: Option<EntityId>,
    pub blueprint_id: Option<EntityId>,
    pub configuration: Option<Payload>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Stack {
    pub fn new(
        name: impl Into<String>,
        stack_type: StackType,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            repository_url: None,
            stack_type,
            programming_language: None,
            is_public: false,
            created_by: created_by.into(),
            team_id: None,
            cloud_provider_id: None,
            blueprint_id: None,
            configuration: None,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Stack {
    const KIND: EntityKind = EntityKind::Stack;

    audit_accessors!();

    fn references(&self) -> Vec<EntityRef> {
        let mut references = Vec::new();
        if let Some(team_id) = self.team_id {
            references.push(EntityRef::new(EntityKind::Team, team_id));
        }
        if let Some(cloud_provider_id) = self.cloud_provider_id {
            references.push(EntityRef::new(EntityKind::CloudProvider, cloud_provider_id));
        }
        if let Some(blueprint_id) = self.blueprint_id {
            references.push(EntityRef::new(EntityKind::Blueprint, blueprint_id));
        }
        references
    }

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::composite(
            "name_created_by",
            &[&self.name, &self.created_by],
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::{Stack, StackType};
    use crate::model::{Entity, UniqueKey};

    #[test]
    fn same_name_for_different_owners_has_distinct_keys() {
        let first = Stack::new("svc-a", StackType::RestfulApi, "u1");
        let second = Stack::new("svc-a", StackType::RestfulApi, "u2");
        assert_ne!(first.unique_keys(), second.unique_keys());
        assert_eq!(
            first.unique_keys(),
            vec![UniqueKey::composite("name_created_by", &["svc-a", "u1"])]
        );
    }

    #[test]
    fn unset_references_are_not_reported() {
        let stack = Stack::new("svc-a", StackType::Infrastructure, "u1");
        assert!(stack.references().is_empty());
    }
}
