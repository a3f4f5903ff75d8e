use super::{audit_accessors, stored_enum, Entity, EntityId, EntityKind, UniqueKey};
use chrono::{DateTime, Utc};

stored_enum! {
    pub enum ApiKeyType {
        User => "USER",
        System => "SYSTEM",
    }
}

/// Hashed API credential. The plaintext key is never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKey {
    pub id: Option<EntityId>,
    pub key_name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub key_type: ApiKeyType,
    pub user_email: Option<String>,
    pub created_by_email: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by_email: Option<String>,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn new(
        key_name: impl Into<String>,
        key_hash: impl Into<String>,
        key_prefix: impl Into<String>,
        key_type: ApiKeyType,
        created_by_email: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            key_name: key_name.into(),
            key_hash: key_hash.into(),
            key_prefix: key_prefix.into(),
            key_type,
            user_email: None,
            created_by_email: created_by_email.into(),
            expires_at: None,
            last_used_at: None,
            revoked_at: None,
            revoked_by_email: None,
            is_active: true,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for ApiKey {
    const KIND: EntityKind = EntityKind::ApiKey;

    audit_accessors!();

    fn unique_keys(&self) -> Vec<UniqueKey> {
        vec![UniqueKey::single("key_hash", &self.key_hash)]
    }
}
