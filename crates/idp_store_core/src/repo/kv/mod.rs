//! Key-value repository implementation on the DynamoDB data model.
//!
//! # Responsibility
//! - Implement the repository contract for every [`ItemMapper`] entity.
//! - Emulate relational guarantees (uniqueness, references, restricted
//!   deletes) with guard items and conditional transactions.
//!
//! # Invariants
//! - Every write, including a single `save`, is one transaction.
//! - Finders never scan; `find_all` and `count` do and are administrative.
//! - Results are sorted into creation order after retrieval.
//!
//! # See also
//! - `plan` for how one unit of work becomes one transaction.
//! - `schema` for tables, indexes and guard ids.

mod plan;
mod schema;
mod store;
mod tx;

pub(crate) use store::map_kv_error;
pub use store::KvStore;
pub use tx::KvTransactionCoordinator;

use crate::error::{StoreError, StoreResult};
use crate::mapper::ItemMapper;
use crate::model::record::FromRecord;
use crate::model::{
    sort_by_creation, ApiKey, Blueprint, CloudProvider, EntityId, EntityRecord, EntityWrite,
    PropertySchema, ResourceType, ResourceTypeCloudMapping, Stack, Team,
};
use crate::repo::{
    ApiKeyRepository, BlueprintRepository, CloudProviderRepository, FieldFilter,
    PropertySchemaRepository, Repository, ResourceTypeCloudMappingRepository,
    ResourceTypeRepository, StackRepository, TeamRepository,
};
use log::{debug, warn};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// Repository for one entity type over a shared [`KvStore`].
pub struct KvRepository<E> {
    store: Arc<KvStore>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: ItemMapper> KvRepository<E> {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    fn decode_all(items: Vec<crate::kv::Item>) -> StoreResult<Vec<E>> {
        let mut entities = items
            .iter()
            .map(|item| E::from_item(item).map_err(StoreError::from))
            .collect::<StoreResult<Vec<_>>>()?;
        sort_by_creation(&mut entities);
        Ok(entities)
    }
}

impl<E> Repository<E> for KvRepository<E>
where
    E: ItemMapper + FromRecord + Into<EntityRecord>,
{
    fn save(&self, entity: E) -> StoreResult<E> {
        let started_at = Instant::now();
        let outcome = self.store.apply(vec![EntityWrite::save(entity)]);
        let saved = match outcome {
            Ok(mut saved) => saved.pop().and_then(E::from_record),
            Err(err) => {
                warn!(
                    "event=entity_save module=repo backend=dynamodb kind={} status=error error_type={} duration_ms={}",
                    E::KIND,
                    err.error_type(),
                    started_at.elapsed().as_millis()
                );
                return Err(err);
            }
        };
        debug!(
            "event=entity_save module=repo backend=dynamodb kind={} status=ok duration_ms={}",
            E::KIND,
            started_at.elapsed().as_millis()
        );
        saved.ok_or_else(|| {
            StoreError::Validation(format!("{} save returned no record", E::KIND))
        })
    }

    fn find_by_id(&self, id: EntityId) -> StoreResult<Option<E>> {
        match self.store.get_item(E::KIND, id)? {
            Some(item) => Ok(Some(E::from_item(&item)?)),
            None => Ok(None),
        }
    }

    fn find_all(&self) -> StoreResult<Vec<E>> {
        Self::decode_all(self.store.scan(E::KIND)?)
    }

    fn count(&self) -> StoreResult<u64> {
        Ok(self.store.scan(E::KIND)?.len() as u64)
    }

    fn exists(&self, id: EntityId) -> StoreResult<bool> {
        Ok(self.store.get_item(E::KIND, id)?.is_some())
    }

    fn delete_by_id(&self, id: EntityId) -> StoreResult<()> {
        self.store.apply(vec![EntityWrite::delete(E::KIND, id)])?;
        debug!(
            "event=entity_delete module=repo backend=dynamodb kind={} status=ok",
            E::KIND
        );
        Ok(())
    }

    fn find_by(&self, filters: &[FieldFilter]) -> StoreResult<Vec<E>> {
        Self::decode_all(self.store.find_items(E::KIND, filters)?)
    }
}

impl CloudProviderRepository for KvRepository<CloudProvider> {}
impl ResourceTypeRepository for KvRepository<ResourceType> {}
impl ResourceTypeCloudMappingRepository for KvRepository<ResourceTypeCloudMapping> {}
impl PropertySchemaRepository for KvRepository<PropertySchema> {}
impl BlueprintRepository for KvRepository<Blueprint> {}
impl TeamRepository for KvRepository<Team> {}
impl StackRepository for KvRepository<Stack> {}
impl ApiKeyRepository for KvRepository<ApiKey> {}

#[cfg(test)]
mod tests {
    use super::plan::UnitCompiler;
    use super::store::record_from_item;
    use super::{KvRepository, KvStore, KvTransactionCoordinator};
    use crate::error::{StoreError, StoreResult};
    use crate::kv::{KvClient, MemoryKvStore};
    use crate::model::{
        now, Blueprint, CloudProvider, EntityId, EntityKind, EntityRecord, EntityWrite, Stack,
        StackType, Team,
    };
    use crate::repo::{BlueprintRepository, Repository, StackRepository};
    use crate::tx::{
        assign_ids, from_loaded, merge_writes, unit_item_count, TransactionCoordinator,
    };
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;

    fn load_record(
        store: &KvStore,
        kind: EntityKind,
        id: EntityId,
    ) -> StoreResult<Option<EntityRecord>> {
        store
            .get_item(kind, id)?
            .map(|item| record_from_item(kind, &item))
            .transpose()
    }

    fn store() -> Arc<KvStore> {
        let client: Arc<dyn KvClient> = Arc::new(MemoryKvStore::new());
        Arc::new(KvStore::open(client, "test_").expect("open store"))
    }

    #[test]
    fn duplicate_stack_name_for_same_owner_conflicts() {
        let repo = KvRepository::<Stack>::new(store());
        repo.save(Stack::new("svc-a", StackType::RestfulApi, "u1"))
            .expect("first save");
        let err = repo
            .save(Stack::new("svc-a", StackType::RestfulApi, "u1"))
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Conflict { kind: EntityKind::Stack, .. }));
        repo.save(Stack::new("svc-a", StackType::RestfulApi, "u2"))
            .expect("other owner");
        assert!(repo
            .exists_by_name_and_created_by("svc-a", "u1")
            .expect("exists"));
    }

    #[test]
    fn renaming_releases_the_old_unique_value() {
        let store = store();
        let repo = KvRepository::<Team>::new(store);
        let mut team = repo.save(Team::new("platform")).expect("save");
        team.name = "infra".to_string();
        repo.save(team).expect("rename");
        repo.save(Team::new("platform")).expect("old name is free again");
    }

    #[test]
    fn blueprint_links_follow_supported_providers() {
        let store = store();
        let providers = KvRepository::<CloudProvider>::new(Arc::clone(&store));
        let blueprints = KvRepository::<Blueprint>::new(Arc::clone(&store));
        let aws = providers.save(CloudProvider::new("AWS", "Amazon Web Services")).expect("aws");
        let aws_id = aws.id.expect("aws id");

        let mut blueprint = Blueprint::new("web");
        blueprint.supported_cloud_provider_ids.insert(aws_id);
        let mut blueprint = blueprints.save(blueprint).expect("blueprint");
        assert_eq!(
            blueprints
                .find_by_supported_cloud_provider_id(aws_id)
                .expect("find")
                .len(),
            1
        );

        blueprint.supported_cloud_provider_ids.clear();
        blueprints.save(blueprint).expect("unlink");
        assert!(blueprints
            .find_by_supported_cloud_provider_id(aws_id)
            .expect("find")
            .is_empty());
    }

    #[test]
    fn unit_can_delete_dependent_then_parent() {
        let store = store();
        let teams = KvRepository::<Team>::new(Arc::clone(&store));
        let stacks = KvRepository::<Stack>::new(Arc::clone(&store));
        let team = teams.save(Team::new("platform")).expect("team");
        let team_id = team.id.expect("team id");
        let mut stack = Stack::new("svc-a", StackType::RestfulApi, "u1");
        stack.team_id = Some(team_id);
        let stack = stacks.save(stack).expect("stack");

        let blocked = teams.delete_by_id(team_id).expect_err("team still referenced");
        assert!(matches!(blocked, StoreError::Conflict { .. }));

        let coordinator = KvTransactionCoordinator::new(Arc::clone(&store));
        coordinator
            .execute(vec![
                EntityWrite::delete_entity(&stack).expect("saved stack"),
                EntityWrite::delete(EntityKind::Team, team_id),
            ])
            .expect("unit");
        assert!(load_record(&store, EntityKind::Team, team_id)
            .expect("load")
            .is_none());
    }

    #[test]
    fn unit_may_reference_a_record_saved_earlier_in_it() {
        let store = store();
        let coordinator = KvTransactionCoordinator::new(Arc::clone(&store));
        let team = Team {
            id: Some(uuid::Uuid::new_v4()),
            ..Team::new("platform")
        };
        let mut stack = Stack::new("svc-a", StackType::RestfulApi, "u1");
        stack.team_id = team.id;

        let saved = coordinator
            .execute(vec![EntityWrite::save(team), EntityWrite::save(stack)])
            .expect("unit");
        assert_eq!(saved.len(), 2);
        assert!(matches!(&saved[1], EntityRecord::Stack(stack) if stack.id.is_some()));
    }

    #[test]
    fn compiled_transaction_matches_the_item_count() {
        let store = store();
        let providers = KvRepository::<CloudProvider>::new(Arc::clone(&store));
        let blueprints = KvRepository::<Blueprint>::new(Arc::clone(&store));
        let teams = KvRepository::<Team>::new(Arc::clone(&store));
        let aws = providers
            .save(CloudProvider::new("AWS", "Amazon Web Services"))
            .expect("aws")
            .id
            .expect("aws id");
        let gcp = providers
            .save(CloudProvider::new("GCP", "Google Cloud"))
            .expect("gcp")
            .id
            .expect("gcp id");
        let mut blueprint = Blueprint::new("web");
        blueprint.supported_cloud_provider_ids.insert(aws);
        let blueprint = blueprints.save(blueprint).expect("blueprint");
        let mut team = teams.save(Team::new("platform")).expect("team");

        team.name = "infra".to_string();
        let mut both = blueprint.clone();
        both.supported_cloud_provider_ids = BTreeSet::from([aws, gcp]);
        let mut gcp_only = blueprint.clone();
        gcp_only.supported_cloud_provider_ids = BTreeSet::from([gcp]);
        let mut stack = Stack::new("svc-a", StackType::RestfulApi, "u1");
        stack.team_id = team.id;
        stack.blueprint_id = blueprint.id;
        let mut writes = vec![
            EntityWrite::save(team),
            EntityWrite::save(both),
            EntityWrite::save(stack),
            EntityWrite::save(Team::new("platform")),
            EntityWrite::save(gcp_only),
        ];
        assign_ids(&mut writes);

        let merged = merge_writes(&writes).expect("merge");
        let mut stored = HashMap::new();
        for net in &merged.writes {
            stored.insert(net.target, store.load_record(net.target).expect("load"));
        }
        let expected = unit_item_count(&merged.writes, from_loaded(&stored)).expect("count");
        let mut compiler = UnitCompiler::new(&store, now(), &stored);
        for net in merged.writes {
            compiler.add(net).expect("compile");
        }
        assert_eq!(compiler.finish().ops.len(), expected);

        let coordinator = KvTransactionCoordinator::new(Arc::clone(&store));
        let saved = coordinator.execute(writes).expect("unit commits");
        assert_eq!(saved.len(), 5);
        assert_eq!(
            blueprints
                .find_by_supported_cloud_provider_id(aws)
                .expect("find")
                .len(),
            0
        );
    }

    #[test]
    fn delete_reads_dependents_committed_by_another_handle() {
        let engine: Arc<dyn KvClient> = Arc::new(MemoryKvStore::new());
        let first = Arc::new(KvStore::open(Arc::clone(&engine), "test_").expect("open first"));
        let second = Arc::new(KvStore::open(engine, "test_").expect("open second"));
        let teams = KvRepository::<Team>::new(Arc::clone(&first));
        let team_id = teams.save(Team::new("platform")).expect("team").id.expect("team id");

        let mut stack = Stack::new("svc-a", StackType::RestfulApi, "u1");
        stack.team_id = Some(team_id);
        KvRepository::<Stack>::new(second)
            .save(stack)
            .expect("stack through another handle");

        let err = teams.delete_by_id(team_id).expect_err("dependent exists");
        assert!(matches!(err, StoreError::Conflict { kind: EntityKind::Team, .. }), "{err:?}");
        assert!(teams.exists(team_id).expect("exists"));
    }
}
