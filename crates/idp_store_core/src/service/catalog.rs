//! Explicit relationship traversal over the catalog entities.
//!
//! # Responsibility
//! - Resolve identifier references with a second, explicit fetch.
//! - Build the one cascade the catalog needs as a single unit of work.
//!
//! # Invariants
//! - Nothing here hydrates records implicitly; every hop is a repository
//!   call the caller can see.
//! - The cascade never touches stacks or blueprints. If any still reference
//!   the provider, the whole unit fails with `Conflict`.

use crate::error::StoreResult;
use crate::model::{
    CloudProvider, EntityId, EntityKind, EntityWrite, PropertySchema, ResourceTypeCloudMapping,
    Stack,
};
use crate::provider::Storage;
use crate::repo::{
    CloudProviderRepository, PropertySchemaRepository, Repository,
    ResourceTypeCloudMappingRepository,
};
use crate::tx::TransactionCoordinator;
use log::info;
use std::sync::Arc;

/// What a provider cascade removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeSummary {
    pub mappings: usize,
    pub property_schemas: usize,
}

pub struct CatalogService {
    cloud_providers: Arc<dyn CloudProviderRepository>,
    mappings: Arc<dyn ResourceTypeCloudMappingRepository>,
    property_schemas: Arc<dyn PropertySchemaRepository>,
    transactions: Arc<dyn TransactionCoordinator>,
}

impl CatalogService {
    pub fn new(storage: &Storage) -> Self {
        Self {
            cloud_providers: Arc::clone(&storage.cloud_providers),
            mappings: Arc::clone(&storage.resource_type_cloud_mappings),
            property_schemas: Arc::clone(&storage.property_schemas),
            transactions: Arc::clone(&storage.transactions),
        }
    }

    /// Provider the stack is deployed to; `None` when it has none or the
    /// provider no longer exists.
    pub fn cloud_provider_of(&self, stack: &Stack) -> StoreResult<Option<CloudProvider>> {
        match stack.cloud_provider_id {
            Some(id) => self.cloud_providers.find_by_id(id),
            None => Ok(None),
        }
    }

    pub fn mappings_for_resource_type(
        &self,
        resource_type_id: EntityId,
    ) -> StoreResult<Vec<ResourceTypeCloudMapping>> {
        self.mappings.find_by_resource_type_id(resource_type_id)
    }

    /// Property schemas of `mapping` in display order.
    pub fn schemas_for(&self, mapping: &ResourceTypeCloudMapping) -> StoreResult<Vec<PropertySchema>> {
        match mapping.id {
            Some(id) => self
                .property_schemas
                .find_by_mapping_id_order_by_display_order(id),
            None => Ok(Vec::new()),
        }
    }

    /// Deletes the provider, its mappings and their property schemas in one
    /// unit of work, dependents first.
    ///
    /// # Errors
    /// - `Conflict` when stacks or blueprints still reference the provider.
    /// - `TransactionTooLarge` when the cascade needs more backend items than
    ///   one unit of work allows.
    pub fn delete_cloud_provider_cascade(
        &self,
        cloud_provider_id: EntityId,
    ) -> StoreResult<CascadeSummary> {
        let mut writes = Vec::new();
        let mut summary = CascadeSummary::default();
        let mappings = self.mappings.find_by_cloud_provider_id(cloud_provider_id)?;
        for mapping in &mappings {
            let Some(mapping_id) = mapping.id else {
                continue;
            };
            for schema in self.property_schemas.find_by_mapping_id(mapping_id)? {
                if let Some(write) = EntityWrite::delete_entity(&schema) {
                    writes.push(write);
                    summary.property_schemas += 1;
                }
            }
            writes.push(EntityWrite::delete(EntityKind::ResourceTypeCloudMapping, mapping_id));
            summary.mappings += 1;
        }
        writes.push(EntityWrite::delete(EntityKind::CloudProvider, cloud_provider_id));

        self.transactions.execute(writes)?;
        info!(
            "event=cloud_provider_cascade module=service status=ok mappings={} property_schemas={}",
            summary.mappings, summary.property_schemas
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::CatalogService;
    use crate::config::{DynamoConfig, SqliteConfig, StorageConfig};
    use crate::error::StoreError;
    use crate::model::{
        CloudProvider, ModuleLocationType, PropertyDataType, PropertySchema, ResourceCategory,
        ResourceType, ResourceTypeCloudMapping, Stack, StackType,
    };
    use crate::provider::Storage;
    use crate::repo::Repository;

    fn backends() -> Vec<Storage> {
        vec![
            Storage::open(StorageConfig::sqlite(SqliteConfig::in_memory())).expect("sqlite"),
            Storage::open(StorageConfig::dynamodb(DynamoConfig::in_memory("svc_"))).expect("kv"),
        ]
    }

    #[test]
    fn cascade_removes_mappings_and_schemas() {
        for storage in backends() {
            let aws = storage
                .cloud_providers
                .save(CloudProvider::new("AWS", "Amazon Web Services"))
                .expect("provider");
            let aws_id = aws.id.expect("provider id");
            let bucket = storage
                .resource_types
                .save(ResourceType::new(
                    "bucket",
                    "Bucket",
                    ResourceCategory::NonShared,
                ))
                .expect("resource type");
            let mapping = storage
                .resource_type_cloud_mappings
                .save(ResourceTypeCloudMapping::new(
                    bucket.id.expect("resource type id"),
                    aws_id,
                    "git::modules/s3",
                    ModuleLocationType::Git,
                ))
                .expect("mapping");
            let mapping_id = mapping.id.expect("mapping id");
            for name in ["versioning", "encryption"] {
                storage
                    .property_schemas
                    .save(PropertySchema::new(
                        mapping_id,
                        name,
                        name,
                        PropertyDataType::Boolean,
                    ))
                    .expect("schema");
            }

            let service = CatalogService::new(&storage);
            assert_eq!(service.schemas_for(&mapping).expect("schemas").len(), 2);

            let summary = service
                .delete_cloud_provider_cascade(aws_id)
                .expect("cascade");
            assert_eq!(summary.mappings, 1);
            assert_eq!(summary.property_schemas, 2);
            assert!(!storage.cloud_providers.exists(aws_id).expect("exists"));
            assert_eq!(storage.property_schemas.count().expect("count"), 0);
            assert_eq!(storage.resource_types.count().expect("count"), 1);
        }
    }

    #[test]
    fn cascade_refuses_while_a_stack_uses_the_provider() {
        for storage in backends() {
            let gcp = storage
                .cloud_providers
                .save(CloudProvider::new("GCP", "Google Cloud"))
                .expect("provider");
            let gcp_id = gcp.id.expect("provider id");
            let mut stack = Stack::new("svc-a", StackType::RestfulApi, "u1");
            stack.cloud_provider_id = Some(gcp_id);
            let stack = storage.stacks.save(stack).expect("stack");

            let service = CatalogService::new(&storage);
            assert_eq!(
                service
                    .cloud_provider_of(&stack)
                    .expect("lookup")
                    .and_then(|provider| provider.id),
                Some(gcp_id)
            );
            let err = service
                .delete_cloud_provider_cascade(gcp_id)
                .expect_err("stack still references provider");
            assert!(matches!(err, StoreError::Conflict { .. }), "{err:?}");
            assert!(storage.cloud_providers.exists(gcp_id).expect("exists"));
        }
    }
}
