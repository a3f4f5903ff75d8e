//! Row mapping between entities and their SQLite tables.
//!
//! # Invariants
//! - Read paths reject malformed stored values with `Validation` naming
//!   table, column and id instead of masking them.
//! - JSON payloads are stored as text and parsed back losslessly.

use crate::error::{StoreError, StoreResult};
use crate::model::{
    format_timestamp, parse_timestamp, ApiKey, ApiKeyType, Blueprint, CloudProvider, Entity,
    EntityId, EntityKind, ModuleLocationType, Payload, ProgrammingLanguage, PropertyDataType,
    PropertySchema, ResourceCategory, ResourceType, ResourceTypeCloudMapping, Stack, StackType,
    Team,
};
use crate::repo::fields;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

/// Table description for one entity type.
pub(crate) trait SqlEntity: Entity {
    const TABLE: &'static str;
    /// Data columns in bind order; `id`, `created_at` and `updated_at` are
    /// handled by the generic engine.
    const COLUMNS: &'static [&'static str];
    /// Logical query fields answered by a column of the same name.
    const QUERY_COLUMNS: &'static [&'static str];

    fn to_columns(&self) -> StoreResult<Vec<Value>>;

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self>;

    /// SQL predicate with one `?` placeholder for `field`.
    fn filter_clause(field: &str) -> Option<String> {
        Self::QUERY_COLUMNS
            .contains(&field)
            .then(|| format!("{field} = ?"))
    }

    /// Loads rows kept outside the main table.
    fn load_links(&mut self, _conn: &Connection) -> StoreResult<()> {
        Ok(())
    }

    /// Replaces rows kept outside the main table.
    fn store_links(&self, _conn: &Connection) -> StoreResult<()> {
        Ok(())
    }
}

/// Table holding `kind`, used for reference checks and deletes by kind.
pub(crate) fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::CloudProvider => CloudProvider::TABLE,
        EntityKind::ResourceType => ResourceType::TABLE,
        EntityKind::ResourceTypeCloudMapping => ResourceTypeCloudMapping::TABLE,
        EntityKind::PropertySchema => PropertySchema::TABLE,
        EntityKind::Blueprint => Blueprint::TABLE,
        EntityKind::Team => Team::TABLE,
        EntityKind::Stack => Stack::TABLE,
        EntityKind::ApiKey => ApiKey::TABLE,
    }
}

/// Column accessors that turn type or format errors into `Validation`.
pub(crate) struct RowReader<'row> {
    row: &'row Row<'row>,
    table: &'static str,
    id_text: String,
}

impl<'row> RowReader<'row> {
    pub(crate) fn new(row: &'row Row<'row>, table: &'static str) -> StoreResult<Self> {
        let id_text = row
            .get::<_, String>("id")
            .map_err(|err| StoreError::Validation(format!("{table}.id: {err}")))?;
        Ok(Self {
            row,
            table,
            id_text,
        })
    }

    fn invalid(&self, column: &str, detail: impl std::fmt::Display) -> StoreError {
        StoreError::Validation(format!(
            "{}.{} for id {}: {}",
            self.table, column, self.id_text, detail
        ))
    }

    fn raw<T: rusqlite::types::FromSql>(&self, column: &str) -> StoreResult<T> {
        self.row
            .get::<_, T>(column)
            .map_err(|err| self.invalid(column, err))
    }

    pub(crate) fn id(&self) -> StoreResult<EntityId> {
        Uuid::parse_str(&self.id_text).map_err(|_| self.invalid("id", "not a uuid"))
    }

    pub(crate) fn uuid(&self, column: &str) -> StoreResult<EntityId> {
        let text: String = self.raw(column)?;
        Uuid::parse_str(&text).map_err(|_| self.invalid(column, format!("`{text}` is not a uuid")))
    }

    pub(crate) fn opt_uuid(&self, column: &str) -> StoreResult<Option<EntityId>> {
        match self.raw::<Option<String>>(column)? {
            Some(text) => Uuid::parse_str(&text)
                .map(Some)
                .map_err(|_| self.invalid(column, format!("`{text}` is not a uuid"))),
            None => Ok(None),
        }
    }

    pub(crate) fn text(&self, column: &str) -> StoreResult<String> {
        self.raw(column)
    }

    pub(crate) fn opt_text(&self, column: &str) -> StoreResult<Option<String>> {
        self.raw(column)
    }

    pub(crate) fn boolean(&self, column: &str) -> StoreResult<bool> {
        match self.raw::<i64>(column)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.invalid(column, format!("`{other}` is not 0 or 1"))),
        }
    }

    pub(crate) fn opt_i32(&self, column: &str) -> StoreResult<Option<i32>> {
        self.raw(column)
    }

    pub(crate) fn timestamp(&self, column: &str) -> StoreResult<DateTime<Utc>> {
        let text: String = self.raw(column)?;
        parse_timestamp(&text)
            .ok_or_else(|| self.invalid(column, format!("`{text}` is not an RFC 3339 timestamp")))
    }

    pub(crate) fn opt_timestamp(&self, column: &str) -> StoreResult<Option<DateTime<Utc>>> {
        match self.raw::<Option<String>>(column)? {
            Some(text) => parse_timestamp(&text).map(Some).ok_or_else(|| {
                self.invalid(column, format!("`{text}` is not an RFC 3339 timestamp"))
            }),
            None => Ok(None),
        }
    }

    pub(crate) fn stored_enum<T>(&self, column: &str, parse: fn(&str) -> Option<T>) -> StoreResult<T> {
        let text: String = self.raw(column)?;
        parse(&text).ok_or_else(|| self.invalid(column, format!("unknown value `{text}`")))
    }

    pub(crate) fn opt_stored_enum<T>(
        &self,
        column: &str,
        parse: fn(&str) -> Option<T>,
    ) -> StoreResult<Option<T>> {
        match self.raw::<Option<String>>(column)? {
            Some(text) => parse(&text)
                .map(Some)
                .ok_or_else(|| self.invalid(column, format!("unknown value `{text}`"))),
            None => Ok(None),
        }
    }

    pub(crate) fn opt_json(&self, column: &str) -> StoreResult<Option<serde_json::Value>> {
        match self.raw::<Option<String>>(column)? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|err| self.invalid(column, err)),
            None => Ok(None),
        }
    }

    pub(crate) fn opt_payload(&self, column: &str) -> StoreResult<Option<Payload>> {
        match self.opt_json(column)? {
            Some(serde_json::Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(self.invalid(column, format!("expected an object, got {other}"))),
            None => Ok(None),
        }
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn opt_text(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.clone()))
}

fn uuid(value: EntityId) -> Value {
    Value::Text(value.to_string())
}

fn opt_uuid(value: Option<EntityId>) -> Value {
    value.map_or(Value::Null, uuid)
}

fn boolean(value: bool) -> Value {
    Value::Integer(i64::from(value))
}

fn opt_timestamp(value: Option<&DateTime<Utc>>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(format_timestamp(value)))
}

fn opt_json(table: &str, column: &str, value: Option<&serde_json::Value>) -> StoreResult<Value> {
    match value {
        Some(value) => serde_json::to_string(value)
            .map(Value::Text)
            .map_err(|err| StoreError::Validation(format!("{table}.{column}: {err}"))),
        None => Ok(Value::Null),
    }
}

fn opt_payload(table: &str, column: &str, value: Option<&Payload>) -> StoreResult<Value> {
    match value {
        Some(map) => serde_json::to_string(map)
            .map(Value::Text)
            .map_err(|err| StoreError::Validation(format!("{table}.{column}: {err}"))),
        None => Ok(Value::Null),
    }
}

/// Bytes a bound row occupies, used for the record size ceiling.
pub(crate) fn encoded_len(values: &[Value]) -> usize {
    values
        .iter()
        .map(|value| match value {
            Value::Null => 1,
            Value::Integer(_) | Value::Real(_) => 8,
            Value::Text(text) => text.len(),
            Value::Blob(bytes) => bytes.len(),
        })
        .sum()
}

impl SqlEntity for CloudProvider {
    const TABLE: &'static str = "cloud_providers";
    const COLUMNS: &'static [&'static str] = &["name", "display_name", "description", "enabled"];
    const QUERY_COLUMNS: &'static [&'static str] = &[fields::NAME, fields::ENABLED];

    fn to_columns(&self) -> StoreResult<Vec<Value>> {
        Ok(vec![
            text(&self.name),
            text(&self.display_name),
            opt_text(self.description.as_ref()),
            boolean(self.enabled),
        ])
    }

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: Some(row.id()?),
            name: row.text("name")?,
            display_name: row.text("display_name")?,
            description: row.opt_text("description")?,
            enabled: row.boolean("enabled")?,
            created_at: Some(row.timestamp("created_at")?),
            updated_at: Some(row.timestamp("updated_at")?),
        })
    }
}

impl SqlEntity for ResourceType {
    const TABLE: &'static str = "resource_types";
    const COLUMNS: &'static [&'static str] =
        &["name", "display_name", "description", "category", "enabled"];
    const QUERY_COLUMNS: &'static [&'static str] =
        &[fields::NAME, fields::CATEGORY, fields::ENABLED];

    fn to_columns(&self) -> StoreResult<Vec<Value>> {
        Ok(vec![
            text(&self.name),
            text(&self.display_name),
            opt_text(self.description.as_ref()),
            text(self.category.as_str()),
            boolean(self.enabled),
        ])
    }

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: Some(row.id()?),
            name: row.text("name")?,
            display_name: row.text("display_name")?,
            description: row.opt_text("description")?,
            category: row.stored_enum("category", ResourceCategory::parse)?,
            enabled: row.boolean("enabled")?,
            created_at: Some(row.timestamp("created_at")?),
            updated_at: Some(row.timestamp("updated_at")?),
        })
    }
}

impl SqlEntity for ResourceTypeCloudMapping {
    const TABLE: &'static str = "resource_type_cloud_mappings";
    const COLUMNS: &'static [&'static str] = &[
        "resource_type_id",
        "cloud_provider_id",
        "terraform_module_location",
        "module_location_type",
        "enabled",
    ];
    const QUERY_COLUMNS: &'static [&'static str] =
        &[fields::RESOURCE_TYPE_ID, fields::CLOUD_PROVIDER_ID];

    fn to_columns(&self) -> StoreResult<Vec<Value>> {
        Ok(vec![
            uuid(self.resource_type_id),
            uuid(self.cloud_provider_id),
            text(&self.terraform_module_location),
            text(self.module_location_type.as_str()),
            boolean(self.enabled),
        ])
    }

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: Some(row.id()?),
            resource_type_id: row.uuid("resource_type_id")?,
            cloud_provider_id: row.uuid("cloud_provider_id")?,
            terraform_module_location: row.text("terraform_module_location")?,
            module_location_type: row
                .stored_enum("module_location_type", ModuleLocationType::parse)?,
            enabled: row.boolean("enabled")?,
            created_at: Some(row.timestamp("created_at")?),
            updated_at: Some(row.timestamp("updated_at")?),
        })
    }
}

impl SqlEntity for PropertySchema {
    const TABLE: &'static str = "property_schemas";
    const COLUMNS: &'static [&'static str] = &[
        "mapping_id",
        "property_name",
        "display_name",
        "description",
        "data_type",
        "required",
        "default_value",
        "validation_rules",
        "display_order",
    ];
    const QUERY_COLUMNS: &'static [&'static str] =
        &[fields::MAPPING_ID, fields::PROPERTY_NAME, fields::REQUIRED];

    fn to_columns(&self) -> StoreResult<Vec<Value>> {
        Ok(vec![
            uuid(self.mapping_id),
            text(&self.property_name),
            text(&self.display_name),
            opt_text(self.description.as_ref()),
            text(self.data_type.as_str()),
            boolean(self.required),
            opt_json(Self::TABLE, "default_value", self.default_value.as_ref())?,
            opt_payload(
                Self::TABLE,
                "validation_rules",
                self.validation_rules.as_ref(),
            )?,
            self.display_order
                .map_or(Value::Null, |order| Value::Integer(i64::from(order))),
        ])
    }

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: Some(row.id()?),
            mapping_id: row.uuid("mapping_id")?,
            property_name: row.text("property_name")?,
            display_name: row.text("display_name")?,
            description: row.opt_text("description")?,
            data_type: row.stored_enum("data_type", PropertyDataType::parse)?,
            required: row.boolean("required")?,
            default_value: row.opt_json("default_value")?,
            validation_rules: row.opt_payload("validation_rules")?,
            display_order: row.opt_i32("display_order")?,
            created_at: Some(row.timestamp("created_at")?),
            updated_at: Some(row.timestamp("updated_at")?),
        })
    }
}

impl SqlEntity for Blueprint {
    const TABLE: &'static str = "blueprints";
    const COLUMNS: &'static [&'static str] = &["name", "description", "is_active"];
    const QUERY_COLUMNS: &'static [&'static str] = &[fields::NAME, fields::IS_ACTIVE];

    fn to_columns(&self) -> StoreResult<Vec<Value>> {
        Ok(vec![
            text(&self.name),
            opt_text(self.description.as_ref()),
            boolean(self.is_active),
        ])
    }

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: Some(row.id()?),
            name: row.text("name")?,
            description: row.opt_text("description")?,
            is_active: row.boolean("is_active")?,
            supported_cloud_provider_ids: Default::default(),
            created_at: Some(row.timestamp("created_at")?),
            updated_at: Some(row.timestamp("updated_at")?),
        })
    }

    fn filter_clause(field: &str) -> Option<String> {
        if field == fields::SUPPORTED_CLOUD_PROVIDER_ID {
            return Some(
                "id IN (SELECT blueprint_id FROM blueprint_cloud_providers WHERE cloud_provider_id = ?)"
                    .to_string(),
            );
        }
        Self::QUERY_COLUMNS
            .contains(&field)
            .then(|| format!("{field} = ?"))
    }

    fn load_links(&mut self, conn: &Connection) -> StoreResult<()> {
        let Some(id) = self.id else {
            return Ok(());
        };
        let mut stmt = conn
            .prepare_cached(
                "SELECT cloud_provider_id FROM blueprint_cloud_providers WHERE blueprint_id = ?1;",
            )
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map([id.to_string()], |row| row.get::<_, String>(0))
            .map_err(StoreError::backend)?;
        self.supported_cloud_provider_ids.clear();
        for text in rows {
            let text = text.map_err(StoreError::backend)?;
            let provider_id = Uuid::parse_str(&text).map_err(|_| {
                StoreError::Validation(format!(
                    "blueprint_cloud_providers.cloud_provider_id for blueprint {id}: `{text}` is not a uuid"
                ))
            })?;
            self.supported_cloud_provider_ids.insert(provider_id);
        }
        Ok(())
    }

    fn store_links(&self, conn: &Connection) -> StoreResult<()> {
        let Some(id) = self.id else {
            return Ok(());
        };
        conn.execute(
            "DELETE FROM blueprint_cloud_providers WHERE blueprint_id = ?1;",
            [id.to_string()],
        )
        .map_err(StoreError::backend)?;
        for provider_id in &self.supported_cloud_provider_ids {
            conn.execute(
                "INSERT INTO blueprint_cloud_providers (blueprint_id, cloud_provider_id) VALUES (?1, ?2);",
                params![id.to_string(), provider_id.to_string()],
            )
            .map_err(StoreError::backend)?;
        }
        Ok(())
    }
}

impl SqlEntity for Team {
    const TABLE: &'static str = "teams";
    const COLUMNS: &'static [&'static str] = &["name", "description", "is_active"];
    const QUERY_COLUMNS: &'static [&'static str] = &[fields::NAME, fields::IS_ACTIVE];

    fn to_columns(&self) -> StoreResult<Vec<Value>> {
        Ok(vec![
            text(&self.name),
            opt_text(self.description.as_ref()),
            boolean(self.is_active),
        ])
    }

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: Some(row.id()?),
            name: row.text("name")?,
            description: row.opt_text("description")?,
            is_active: row.boolean("is_active")?,
            created_at: Some(row.timestamp("created_at")?),
            updated_at: Some(row.timestamp("updated_at")?),
        })
    }
}

impl SqlEntity for Stack {
    const TABLE: &'static str = "stacks";
    const COLUMNS: &'static [&'static str] = &[
        "name",
        "description",
        "repository_url",
        "stack_type",
        "programming_language",
        "is_public",
        "created_by",
        "team_id",
        "cloud_provider_id",
        "blueprint_id",
        "configuration",
    ];
    const QUERY_COLUMNS: &'static [&'static str] = &[
        fields::NAME,
        fields::CREATED_BY,
        fields::STACK_TYPE,
        fields::TEAM_ID,
        fields::CLOUD_PROVIDER_ID,
        fields::BLUEPRINT_ID,
    ];

    fn to_columns(&self) -> StoreResult<Vec<Value>> {
        Ok(vec![
            text(&self.name),
            opt_text(self.description.as_ref()),
            opt_text(self.repository_url.as_ref()),
            text(self.stack_type.as_str()),
            self.programming_language
                .map_or(Value::Null, |language| text(language.as_str())),
            boolean(self.is_public),
            text(&self.created_by),
            opt_uuid(self.team_id),
            opt_uuid(self.cloud_provider_id),
            opt_uuid(self.blueprint_id),
            opt_payload(Self::TABLE, "configuration", self.configuration.as_ref())?,
        ])
    }

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: Some(row.id()?),
            name: row.text("name")?,
            description: row.opt_text("description")?,
            repository_url: row.opt_text("repository_url")?,
            stack_type: row.stored_enum("stack_type", StackType::parse)?,
            programming_language: row
                .opt_stored_enum("programming_language", ProgrammingLanguage::parse)?,
            is_public: row.boolean("is_public")?,
            created_by: row.text("created_by")?,
            team_id: row.opt_uuid("team_id")?,
            cloud_provider_id: row.opt_uuid("cloud_provider_id")?,
            blueprint_id: row.opt_uuid("blueprint_id")?,
            configuration: row.opt_payload("configuration")?,
            created_at: Some(row.timestamp("created_at")?),
            updated_at: Some(row.timestamp("updated_at")?),
        })
    }
}

impl SqlEntity for ApiKey {
    const TABLE: &'static str = "api_keys";
    const COLUMNS: &'static [&'static str] = &[
        "key_name",
        "key_hash",
        "key_prefix",
        "key_type",
        "user_email",
        "created_by_email",
        "expires_at",
        "last_used_at",
        "revoked_at",
        "revoked_by_email",
        "is_active",
    ];
    const QUERY_COLUMNS: &'static [&'static str] = &[
        fields::KEY_HASH,
        fields::USER_EMAIL,
        fields::CREATED_BY_EMAIL,
        fields::IS_ACTIVE,
    ];

    fn to_columns(&self) -> StoreResult<Vec<Value>> {
        Ok(vec![
            text(&self.key_name),
            text(&self.key_hash),
            text(&self.key_prefix),
            text(self.key_type.as_str()),
            opt_text(self.user_email.as_ref()),
            text(&self.created_by_email),
            opt_timestamp(self.expires_at.as_ref()),
            opt_timestamp(self.last_used_at.as_ref()),
            opt_timestamp(self.revoked_at.as_ref()),
            opt_text(self.revoked_by_email.as_ref()),
            boolean(self.is_active),
        ])
    }

    fn from_row(row: &RowReader<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: Some(row.id()?),
            key_name: row.text("key_name")?,
            key_hash: row.text("key_hash")?,
            key_prefix: row.text("key_prefix")?,
            key_type: row.stored_enum("key_type", ApiKeyType::parse)?,
            user_email: row.opt_text("user_email")?,
            created_by_email: row.text("created_by_email")?,
            expires_at: row.opt_timestamp("expires_at")?,
            last_used_at: row.opt_timestamp("last_used_at")?,
            revoked_at: row.opt_timestamp("revoked_at")?,
            revoked_by_email: row.opt_text("revoked_by_email")?,
            is_active: row.boolean("is_active")?,
            created_at: Some(row.timestamp("created_at")?),
            updated_at: Some(row.timestamp("updated_at")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{encoded_len, SqlEntity};
    use crate::model::{Blueprint, Stack};
    use crate::repo::fields;
    use rusqlite::types::Value;

    #[test]
    fn columns_match_bind_values() {
        let stack = Stack::new("svc-a", crate::model::StackType::RestfulApi, "u1");
        assert_eq!(
            stack.to_columns().expect("columns").len(),
            Stack::COLUMNS.len()
        );
    }

    #[test]
    fn blueprint_provider_filter_uses_link_table() {
        let clause = Blueprint::filter_clause(fields::SUPPORTED_CLOUD_PROVIDER_ID)
            .expect("clause should exist");
        assert!(clause.contains("blueprint_cloud_providers"));
        assert!(Blueprint::filter_clause(fields::CREATED_BY).is_none());
    }

    #[test]
    fn encoded_len_counts_text_bytes() {
        let values = vec![Value::Text("abc".to_string()), Value::Integer(1), Value::Null];
        assert_eq!(encoded_len(&values), 3 + 8 + 1);
    }
}
