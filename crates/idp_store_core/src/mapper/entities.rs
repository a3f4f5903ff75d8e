use super::{ItemMapper, ItemReader, ItemWriter, MappingResult};
use crate::kv::Item;
use crate::model::{
    ApiKey, ApiKeyType, Blueprint, CloudProvider, ModuleLocationType, ProgrammingLanguage,
    PropertyDataType, PropertySchema, ResourceCategory, ResourceType, ResourceTypeCloudMapping,
    Stack, StackType, Team,
};

/// Stored attribute names.
pub mod attributes {
    pub const ID: &str = "id";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const NAME: &str = "name";
    pub const DISPLAY_NAME: &str = "displayName";
    pub const DESCRIPTION: &str = "description";
    pub const ENABLED: &str = "enabled";
    pub const ENABLED_KEY: &str = "enabledKey";
    pub const CATEGORY: &str = "category";
    pub const RESOURCE_TYPE_ID: &str = "resourceTypeId";
    pub const CLOUD_PROVIDER_ID: &str = "cloudProviderId";
    pub const TERRAFORM_MODULE_LOCATION: &str = "terraformModuleLocation";
    pub const MODULE_LOCATION_TYPE: &str = "moduleLocationType";
    pub const MAPPING_ID: &str = "mappingId";
    pub const PROPERTY_NAME: &str = "propertyName";
    pub const DATA_TYPE: &str = "dataType";
    pub const REQUIRED: &str = "required";
    pub const REQUIRED_KEY: &str = "requiredKey";
    pub const DEFAULT_VALUE: &str = "defaultValue";
    pub const VALIDATION_RULES: &str = "validationRules";
    pub const DISPLAY_ORDER: &str = "displayOrder";
    pub const IS_ACTIVE: &str = "isActive";
    pub const IS_ACTIVE_KEY: &str = "isActiveKey";
    pub const SUPPORTED_CLOUD_PROVIDER_IDS: &str = "supportedCloudProviderIds";
    pub const REPOSITORY_URL: &str = "repositoryUrl";
    pub const STACK_TYPE: &str = "stackType";
    pub const PROGRAMMING_LANGUAGE: &str = "programmingLanguage";
    pub const IS_PUBLIC: &str = "isPublic";
    pub const CREATED_BY: &str = "createdBy";
    pub const TEAM_ID: &str = "teamId";
    pub const BLUEPRINT_ID: &str = "blueprintId";
    pub const CONFIGURATION: &str = "configuration";
    pub const KEY_NAME: &str = "keyName";
    pub const KEY_HASH: &str = "keyHash";
    pub const KEY_PREFIX: &str = "keyPrefix";
    pub const KEY_TYPE: &str = "keyType";
    pub const USER_EMAIL: &str = "userEmail";
    pub const CREATED_BY_EMAIL: &str = "createdByEmail";
    pub const EXPIRES_AT: &str = "expiresAt";
    pub const LAST_USED_AT: &str = "lastUsedAt";
    pub const REVOKED_AT: &str = "revokedAt";
    pub const REVOKED_BY_EMAIL: &str = "revokedByEmail";
}

use attributes as attr;

impl ItemMapper for CloudProvider {
    const TABLE: &'static str = "cloud_providers";

    fn to_item(&self) -> Item {
        ItemWriter::new(self.id)
            .string(attr::NAME, &self.name)
            .string(attr::DISPLAY_NAME, &self.display_name)
            .opt_string(attr::DESCRIPTION, self.description.as_deref())
            .indexed_bool(attr::ENABLED, attr::ENABLED_KEY, self.enabled)
            .finish(self)
    }

    fn from_item(item: &Item) -> MappingResult<Self> {
        let reader = ItemReader::new(item, Self::TABLE);
        let (created_at, updated_at) = reader.audit()?;
        Ok(Self {
            id: Some(reader.id()?),
            name: reader.string(attr::NAME)?,
            display_name: reader.string(attr::DISPLAY_NAME)?,
            description: reader.opt_string(attr::DESCRIPTION)?,
            enabled: reader.boolean(attr::ENABLED)?,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
        })
    }
}

impl ItemMapper for ResourceType {
    const TABLE: &'static str = "resource_types";

    fn to_item(&self) -> Item {
        ItemWriter::new(self.id)
            .string(attr::NAME, &self.name)
            .string(attr::DISPLAY_NAME, &self.display_name)
            .opt_string(attr::DESCRIPTION, self.description.as_deref())
            .string(attr::CATEGORY, self.category.as_str())
            .indexed_bool(attr::ENABLED, attr::ENABLED_KEY, self.enabled)
            .finish(self)
    }

    fn from_item(item: &Item) -> MappingResult<Self> {
        let reader = ItemReader::new(item, Self::TABLE);
        let (created_at, updated_at) = reader.audit()?;
        Ok(Self {
            id: Some(reader.id()?),
            name: reader.string(attr::NAME)?,
            display_name: reader.string(attr::DISPLAY_NAME)?,
            description: reader.opt_string(attr::DESCRIPTION)?,
            category: reader.stored_enum(attr::CATEGORY, ResourceCategory::parse)?,
            enabled: reader.boolean(attr::ENABLED)?,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
        })
    }
}

impl ItemMapper for ResourceTypeCloudMapping {
    const TABLE: &'static str = "resource_type_cloud_mappings";

    fn to_item(&self) -> Item {
        ItemWriter::new(self.id)
            .id(attr::RESOURCE_TYPE_ID, self.resource_type_id)
            .id(attr::CLOUD_PROVIDER_ID, self.cloud_provider_id)
            .string(
                attr::TERRAFORM_MODULE_LOCATION,
                &self.terraform_module_location,
            )
            .string(attr::MODULE_LOCATION_TYPE, self.module_location_type.as_str())
            .boolean(attr::ENABLED, self.enabled)
            .finish(self)
    }

    fn from_item(item: &Item) -> MappingResult<Self> {
        let reader = ItemReader::new(item, Self::TABLE);
        let (created_at, updated_at) = reader.audit()?;
        Ok(Self {
            id: Some(reader.id()?),
            resource_type_id: reader.uuid(attr::RESOURCE_TYPE_ID)?,
            cloud_provider_id: reader.uuid(attr::CLOUD_PROVIDER_ID)?,
            terraform_module_location: reader.string(attr::TERRAFORM_MODULE_LOCATION)?,
            module_location_type: reader
                .stored_enum(attr::MODULE_LOCATION_TYPE, ModuleLocationType::parse)?,
            enabled: reader.boolean(attr::ENABLED)?,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
        })
    }
}

impl ItemMapper for PropertySchema {
    const TABLE: &'static str = "property_schemas";

    fn to_item(&self) -> Item {
        ItemWriter::new(self.id)
            .id(attr::MAPPING_ID, self.mapping_id)
            .string(attr::PROPERTY_NAME, &self.property_name)
            .string(attr::DISPLAY_NAME, &self.display_name)
            .opt_string(attr::DESCRIPTION, self.description.as_deref())
            .string(attr::DATA_TYPE, self.data_type.as_str())
            .indexed_bool(attr::REQUIRED, attr::REQUIRED_KEY, self.required)
            .opt_json(attr::DEFAULT_VALUE, self.default_value.as_ref())
            .opt_payload(attr::VALIDATION_RULES, self.validation_rules.as_ref())
            .opt_number(attr::DISPLAY_ORDER, self.display_order)
            .finish(self)
    }

    fn from_item(item: &Item) -> MappingResult<Self> {
        let reader = ItemReader::new(item, Self::TABLE);
        let (created_at, updated_at) = reader.audit()?;
        Ok(Self {
            id: Some(reader.id()?),
            mapping_id: reader.uuid(attr::MAPPING_ID)?,
            property_name: reader.string(attr::PROPERTY_NAME)?,
            display_name: reader.string(attr::DISPLAY_NAME)?,
            description: reader.opt_string(attr::DESCRIPTION)?,
            data_type: reader.stored_enum(attr::DATA_TYPE, PropertyDataType::parse)?,
            required: reader.boolean(attr::REQUIRED)?,
            default_value: reader.opt_json(attr::DEFAULT_VALUE)?,
            validation_rules: reader.opt_payload(attr::VALIDATION_RULES)?,
            display_order: reader.opt_i32(attr::DISPLAY_ORDER)?,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
        })
    }
}

impl ItemMapper for Blueprint {
    const TABLE: &'static str = "blueprints";

    fn to_item(&self) -> Item {
        ItemWriter::new(self.id)
            .string(attr::NAME, &self.name)
            .opt_string(attr::DESCRIPTION, self.description.as_deref())
            .indexed_bool(attr::IS_ACTIVE, attr::IS_ACTIVE_KEY, self.is_active)
            .id_list(
                attr::SUPPORTED_CLOUD_PROVIDER_IDS,
                &self.supported_cloud_provider_ids,
            )
            .finish(self)
    }

    fn from_item(item: &Item) -> MappingResult<Self> {
        let reader = ItemReader::new(item, Self::TABLE);
        let (created_at, updated_at) = reader.audit()?;
        Ok(Self {
            id: Some(reader.id()?),
            name: reader.string(attr::NAME)?,
            description: reader.opt_string(attr::DESCRIPTION)?,
            is_active: reader.boolean(attr::IS_ACTIVE)?,
            supported_cloud_provider_ids: reader
                .id_list(attr::SUPPORTED_CLOUD_PROVIDER_IDS)?
                .into_iter()
                .collect(),
            created_at: Some(created_at),
            updated_at: Some(updated_at),
        })
    }
}

impl ItemMapper for Team {
    const TABLE: &'static str = "teams";

    fn to_item(&self) -> Item {
        ItemWriter::new(self.id)
            .string(attr::NAME, &self.name)
            .opt_string(attr::DESCRIPTION, self.description.as_deref())
            .indexed_bool(attr::IS_ACTIVE, attr::IS_ACTIVE_KEY, self.is_active)
            .finish(self)
    }

    fn from_item(item: &Item) -> MappingResult<Self> {
        let reader = ItemReader::new(item, Self::TABLE);
        let (created_at, updated_at) = reader.audit()?;
        Ok(Self {
            id: Some(reader.id()?),
            name: reader.string(attr::NAME)?,
            description: reader.opt_string(attr::DESCRIPTION)?,
            is_active: reader.boolean(attr::IS_ACTIVE)?,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
        })
    }
}

impl ItemMapper for Stack {
    const TABLE: &'static str = "stacks";

    fn to_item(&self) -> Item {
        ItemWriter::new(self.id)
            .string(attr::NAME, &self.name)
            .opt_string(attr::DESCRIPTION, self.description.as_deref())
            .opt_string(attr::REPOSITORY_URL, self.repository_url.as_deref())
            .string(attr::STACK_TYPE, self.stack_type.as_str())
            .opt_string(
                attr::PROGRAMMING_LANGUAGE,
                self.programming_language.map(|language| language.as_str()),
            )
            .boolean(attr::IS_PUBLIC, self.is_public)
            .string(attr::CREATED_BY, &self.created_by)
            .opt_id(attr::TEAM_ID, self.team_id)
            .opt_id(attr::CLOUD_PROVIDER_ID, self.cloud_provider_id)
            .opt_id(attr::BLUEPRINT_ID, self.blueprint_id)
            .opt_payload(attr::CONFIGURATION, self.configuration.as_ref())
            .finish(self)
    }

    fn from_item(item: &Item) -> MappingResult<Self> {
        let reader = ItemReader::new(item, Self::TABLE);
        let (created_at, updated_at) = reader.audit()?;
        Ok(Self {
            id: Some(reader.id()?),
            name: reader.string(attr::NAME)?,
            description: reader.opt_string(attr::DESCRIPTION)?,
            repository_url: reader.opt_string(attr::REPOSITORY_URL)?,
            stack_type: reader.stored_enum(attr::STACK_TYPE, StackType::parse)?,
            programming_language: reader
                .opt_stored_enum(attr::PROGRAMMING_LANGUAGE, ProgrammingLanguage::parse)?,
            is_public: reader.boolean(attr::IS_PUBLIC)?,
            created_by: reader.string(attr::CREATED_BY)?,
            team_id: reader.opt_uuid(attr::TEAM_ID)?,
            cloud_provider_id: reader.opt_uuid(attr::CLOUD_PROVIDER_ID)?,
            blueprint_id: reader.opt_uuid(attr::BLUEPRINT_ID)?,
            configuration: reader.opt_payload(attr::CONFIGURATION)?,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
        })
    }
}

impl ItemMapper for ApiKey {
    const TABLE: &'static str = "api_keys";

    fn to_item(&self) -> Item {
        ItemWriter::new(self.id)
            .string(attr::KEY_NAME, &self.key_name)
            .string(attr::KEY_HASH, &self.key_hash)
            .string(attr::KEY_PREFIX, &self.key_prefix)
            .string(attr::KEY_TYPE, self.key_type.as_str())
            .opt_string(attr::USER_EMAIL, self.user_email.as_deref())
            .string(attr::CREATED_BY_EMAIL, &self.created_by_email)
            .opt_timestamp(attr::EXPIRES_AT, self.expires_at.as_ref())
            .opt_timestamp(attr::LAST_USED_AT, self.last_used_at.as_ref())
            .opt_timestamp(attr::REVOKED_AT, self.revoked_at.as_ref())
            .opt_string(attr::REVOKED_BY_EMAIL, self.revoked_by_email.as_deref())
            .indexed_bool(attr::IS_ACTIVE, attr::IS_ACTIVE_KEY, self.is_active)
            .finish(self)
    }

    fn from_item(item: &Item) -> MappingResult<Self> {
        let reader = ItemReader::new(item, Self::TABLE);
        let (created_at, updated_at) = reader.audit()?;
        Ok(Self {
            id: Some(reader.id()?),
            key_name: reader.string(attr::KEY_NAME)?,
            key_hash: reader.string(attr::KEY_HASH)?,
            key_prefix: reader.string(attr::KEY_PREFIX)?,
            key_type: reader.stored_enum(attr::KEY_TYPE, ApiKeyType::parse)?,
            user_email: reader.opt_string(attr::USER_EMAIL)?,
            created_by_email: reader.string(attr::CREATED_BY_EMAIL)?,
            expires_at: reader.opt_timestamp(attr::EXPIRES_AT)?,
            last_used_at: reader.opt_timestamp(attr::LAST_USED_AT)?,
            revoked_at: reader.opt_timestamp(attr::REVOKED_AT)?,
            revoked_by_email: reader.opt_string(attr::REVOKED_BY_EMAIL)?,
            is_active: reader.boolean(attr::IS_ACTIVE)?,
            created_at: Some(created_at),
            updated_at: Some(updated_at),
        })
    }
}
