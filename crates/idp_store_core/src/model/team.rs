use super::{audit_accessors, Entity, EntityId, EntityKind, UniqueKey};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: Option<EntityId>,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Team {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            is_active: true,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Team {
    const KIND: EntityKind = EntityKind::Team;

    audit_accessors!();

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::single("name", &self.name)]
    }
}
