mod common;

use common::{backends, seed_provider, seed_team};
use idp_store_core::model::{
    ApiKey, ApiKeyType, Blueprint, ModuleLocationType, ProgrammingLanguage, PropertyDataType,
    PropertySchema, ResourceCategory, ResourceType, ResourceTypeCloudMapping, Stack, StackType,
};
use idp_store_core::repo::{
    ApiKeyRepository, BlueprintRepository, CloudProviderRepository, PropertySchemaRepository,
    Repository, ResourceTypeRepository, StackRepository, TeamRepository,
};
use idp_store_core::{EntityKind, Storage, StoreError};
use serde_json::json;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

fn configured_stack(storage: &Storage) -> Stack {
    let team_id = seed_team(storage, "platform");
    let provider_id = seed_provider(storage, "AWS");
    let mut stack = Stack::new("svc-a", StackType::RestfulServerless, "u1");
    stack.description = Some("orders API".to_string());
    stack.repository_url = Some("https://git.example.com/orders".to_string());
    stack.programming_language = Some(ProgrammingLanguage::Quarkus);
    stack.is_public = true;
    stack.team_id = Some(team_id);
    stack.cloud_provider_id = Some(provider_id);
    let configuration = json!({
        "memory": 512,
        "tags": ["a", null, {"nested": null}],
        "vpc": {"subnets": [], "enabled": false, "ratio": 0.25},
        "owner": null
    });
    stack.configuration = configuration.as_object().cloned();
    stack
}

#[test]
fn saved_stack_reads_back_identically() {
    for backend in backends() {
        let storage = &backend.storage;
        let stack = configured_stack(storage);
        let saved = storage.stacks.save(stack.clone()).expect("save");

        let id = saved.id.expect("id assigned on first save");
        assert!(saved.created_at.is_some(), "{}", backend.label);
        assert_eq!(saved.created_at, saved.updated_at, "{}", backend.label);

        let loaded = storage
            .stacks
            .find_by_id(id)
            .expect("find")
            .expect("stack present");
        assert_eq!(loaded, saved, "{}", backend.label);
        assert_eq!(loaded.configuration, stack.configuration, "{}", backend.label);
    }
}

#[test]
fn second_save_keeps_created_at_and_content() {
    for backend in backends() {
        let storage = &backend.storage;
        let first = storage
            .stacks
            .save(configured_stack(storage))
            .expect("first save");
        thread::sleep(Duration::from_millis(2));
        let second = storage.stacks.save(first.clone()).expect("second save");

        assert_eq!(second.id, first.id, "{}", backend.label);
        assert_eq!(second.created_at, first.created_at, "{}", backend.label);
        assert!(second.updated_at > first.updated_at, "{}", backend.label);

        let stored = storage
            .stacks
            .find_by_id(first.id.expect("id"))
            .expect("find")
            .expect("present");
        assert_eq!(
            Stack {
                updated_at: first.updated_at,
                ..stored
            },
            first,
            "{}",
            backend.label
        );
    }
}

#[test]
fn caller_supplied_created_at_is_ignored_on_update() {
    for backend in backends() {
        let storage = &backend.storage;
        let saved = storage.teams.save(idp_store_core::model::Team::new("ops")).expect("save");
        let mut forged = saved.clone();
        forged.created_at = Some(chrono::Utc::now() - chrono::Duration::days(30));
        let updated = storage.teams.save(forged).expect("update");
        assert_eq!(updated.created_at, saved.created_at, "{}", backend.label);
    }
}

#[test]
fn deleted_record_is_gone_and_second_delete_is_a_no_op() {
    for backend in backends() {
        let storage = &backend.storage;
        let saved = storage
            .stacks
            .save(Stack::new("svc-a", StackType::Infrastructure, "u1"))
            .expect("save");
        let id = saved.id.expect("id");

        storage.stacks.delete(&saved).expect("delete");
        assert!(storage.stacks.find_by_id(id).expect("find").is_none());
        assert!(!storage.stacks.exists(id).expect("exists"));
        assert_eq!(storage.stacks.count().expect("count"), 0);
        storage.stacks.delete(&saved).expect("second delete");
        storage.stacks.delete_by_id(Uuid::new_v4()).expect("unknown id");
    }
}

#[test]
fn duplicate_owner_and_name_conflicts_until_deleted() {
    for backend in backends() {
        let repo = &backend.storage.stacks;
        let first = repo
            .save(Stack::new("svc-a", StackType::RestfulApi, "u1"))
            .expect("first save");

        let err = repo
            .save(Stack::new("svc-a", StackType::EventDrivenApi, "u1"))
            .expect_err("duplicate must conflict");
        assert!(
            matches!(err, StoreError::Conflict { kind: EntityKind::Stack, .. }),
            "{}: {err:?}",
            backend.label
        );
        assert_eq!(repo.count().expect("count"), 1);

        repo.delete(&first).expect("delete");
        repo.save(Stack::new("svc-a", StackType::RestfulApi, "u1"))
            .expect("name is free after delete");
    }
}

#[test]
fn unique_names_hold_for_every_catalog_entity() {
    for backend in backends() {
        let storage = &backend.storage;
        seed_provider(storage, "AWS");
        let err = storage
            .cloud_providers
            .save(idp_store_core::model::CloudProvider::new("AWS", "again"))
            .expect_err("provider name");
        assert!(matches!(err, StoreError::Conflict { .. }), "{}", backend.label);

        storage
            .api_keys
            .save(ApiKey::new("ci", "hash-1", "idp_ab", ApiKeyType::System, "a@x.io"))
            .expect("key");
        let err = storage
            .api_keys
            .save(ApiKey::new("ci-2", "hash-1", "idp_cd", ApiKeyType::User, "a@x.io"))
            .expect_err("key hash");
        assert!(matches!(err, StoreError::Conflict { .. }), "{}", backend.label);
    }
}

#[test]
fn saving_with_missing_reference_is_not_found() {
    for backend in backends() {
        let storage = &backend.storage;
        let missing = Uuid::new_v4();
        let mut stack = Stack::new("svc-a", StackType::RestfulApi, "u1");
        stack.team_id = Some(missing);

        let err = storage.stacks.save(stack).expect_err("dangling team");
        assert!(
            matches!(err, StoreError::NotFound { kind: EntityKind::Team, id } if id == missing),
            "{}: {err:?}",
            backend.label
        );
        assert_eq!(storage.stacks.count().expect("count"), 0);
    }
}

#[test]
fn deleting_a_referenced_record_conflicts() {
    for backend in backends() {
        let storage = &backend.storage;
        let team_id = seed_team(storage, "platform");
        let mut stack = Stack::new("svc-a", StackType::RestfulApi, "u1");
        stack.team_id = Some(team_id);
        storage.stacks.save(stack).expect("stack");

        let err = storage
            .teams
            .delete_by_id(team_id)
            .expect_err("team in use");
        assert!(matches!(err, StoreError::Conflict { .. }), "{}", backend.label);
        assert!(storage.teams.exists(team_id).expect("exists"));
    }
}

fn ids<T>(records: &[T], id: impl Fn(&T) -> Option<Uuid>) -> Vec<Uuid> {
    records.iter().filter_map(id).collect()
}

#[test]
fn finders_return_the_same_sequence_on_both_backends() {
    let mut outcomes = Vec::new();
    for backend in backends() {
        let storage = &backend.storage;
        let aws = seed_provider(storage, "AWS");
        let gcp = seed_provider(storage, "GCP");
        let team = seed_team(storage, "platform");

        let mut saved_names = Vec::new();
        for (index, name) in ["svc-c", "svc-a", "svc-b", "svc-d"].into_iter().enumerate() {
            let mut stack = Stack::new(name, StackType::RestfulApi, "u1");
            if index % 2 == 0 {
                stack.team_id = Some(team);
                stack.cloud_provider_id = Some(aws);
            }
            if index == 3 {
                stack.stack_type = StackType::Infrastructure;
                stack.created_by = "u2".to_string();
            }
            saved_names.push(storage.stacks.save(stack).expect("stack").name);
            thread::sleep(Duration::from_millis(1));
        }

        let mut blueprint = Blueprint::new("web");
        blueprint.supported_cloud_provider_ids.extend([aws, gcp]);
        storage.blueprints.save(blueprint).expect("blueprint");
        thread::sleep(Duration::from_millis(1));
        let mut inactive = Blueprint::new("batch");
        inactive.is_active = false;
        inactive.supported_cloud_provider_ids.insert(gcp);
        storage.blueprints.save(inactive).expect("blueprint");

        let names = |stacks: Vec<Stack>| stacks.into_iter().map(|s| s.name).collect::<Vec<_>>();
        let by_owner = names(storage.stacks.find_by_created_by("u1").expect("owner"));
        let by_team = names(storage.stacks.find_by_team_id(team).expect("team"));
        let by_provider = names(storage.stacks.find_by_cloud_provider_id(aws).expect("provider"));
        let by_type = names(
            storage
                .stacks
                .find_by_stack_type(StackType::Infrastructure)
                .expect("type"),
        );
        let blueprint_names = |items: Vec<Blueprint>| {
            items.into_iter().map(|b| b.name).collect::<Vec<_>>()
        };
        let for_gcp = blueprint_names(
            storage
                .blueprints
                .find_by_supported_cloud_provider_id(gcp)
                .expect("gcp"),
        );
        let active = blueprint_names(storage.blueprints.find_by_is_active(true).expect("active"));
        let enabled = storage
            .cloud_providers
            .find_by_enabled(true)
            .expect("enabled")
            .len();
        let all = names(storage.stacks.find_all().expect("all"));

        assert_eq!(all, saved_names, "{}: creation order", backend.label);
        outcomes.push((by_owner, by_team, by_provider, by_type, for_gcp, active, enabled));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    let (by_owner, by_team, _, by_type, for_gcp, active, enabled) = &outcomes[0];
    assert_eq!(by_owner, &["svc-c", "svc-a", "svc-b"]);
    assert_eq!(by_team, &["svc-c", "svc-b"]);
    assert_eq!(by_type, &["svc-d"]);
    assert_eq!(for_gcp, &["web", "batch"]);
    assert_eq!(active, &["web"]);
    assert_eq!(*enabled, 2);
}

#[test]
fn property_schema_finders_agree() {
    let mut outcomes = Vec::new();
    for backend in backends() {
        let storage = &backend.storage;
        let provider = seed_provider(storage, "AWS");
        let bucket = storage
            .resource_types
            .save(ResourceType::new("bucket", "Bucket", ResourceCategory::Shared))
            .expect("type");
        let mapping = storage
            .resource_type_cloud_mappings
            .save(ResourceTypeCloudMapping::new(
                bucket.id.expect("id"),
                provider,
                "registry://s3",
                ModuleLocationType::Registry,
            ))
            .expect("mapping");
        let mapping_id = mapping.id.expect("mapping id");

        for (name, order, required) in [
            ("zeta", None, true),
            ("alpha", Some(2), false),
            ("beta", Some(1), true),
            ("gamma", None, false),
        ] {
            let mut schema = PropertySchema::new(mapping_id, name, name, PropertyDataType::String);
            schema.display_order = order;
            schema.required = required;
            schema.default_value = Some(json!(null));
            storage.property_schemas.save(schema).expect("schema");
            thread::sleep(Duration::from_millis(1));
        }

        let names = |schemas: Vec<PropertySchema>| {
            schemas.into_iter().map(|s| s.property_name).collect::<Vec<_>>()
        };
        let ordered = names(
            storage
                .property_schemas
                .find_by_mapping_id_order_by_display_order(mapping_id)
                .expect("ordered"),
        );
        let required = names(
            storage
                .property_schemas
                .find_by_mapping_id_and_required(mapping_id, true)
                .expect("required"),
        );
        let shared = ids(
            &storage
                .resource_types
                .find_by_category(ResourceCategory::Shared)
                .expect("category"),
            |t| t.id,
        )
        .len();
        let stored_default = storage
            .property_schemas
            .find_by_mapping_id(mapping_id)
            .expect("schemas")
            .into_iter()
            .map(|s| s.default_value)
            .collect::<Vec<_>>();

        assert_eq!(ordered, ["beta", "alpha", "gamma", "zeta"], "{}", backend.label);
        assert_eq!(required, ["zeta", "beta"], "{}", backend.label);
        assert_eq!(shared, 1, "{}", backend.label);
        assert!(
            stored_default.iter().all(|value| value == &Some(json!(null))),
            "{}: explicit null default survives",
            backend.label
        );
        outcomes.push((ordered, required));
    }
    assert_eq!(outcomes[0], outcomes[1]);
}

#[test]
fn named_lookups_find_single_records() {
    for backend in backends() {
        let storage = &backend.storage;
        seed_provider(storage, "AWS");
        seed_team(storage, "platform");
        let mut key = ApiKey::new("ci", "hash-9", "idp_zz", ApiKeyType::User, "admin@x.io");
        key.user_email = Some("dev@x.io".to_string());
        storage.api_keys.save(key).expect("key");

        assert!(storage.cloud_providers.find_by_name("AWS").expect("p").is_some());
        assert!(storage.cloud_providers.find_by_name("aws").expect("p").is_none());
        assert!(storage.teams.find_by_name("platform").expect("t").is_some());
        assert!(storage.api_keys.find_by_key_hash("hash-9").expect("k").is_some());
        assert_eq!(storage.api_keys.find_by_user_email("dev@x.io").expect("k").len(), 1);
        assert_eq!(
            storage
                .api_keys
                .find_by_created_by_email("admin@x.io")
                .expect("k")
                .len(),
            1
        );
        assert!(storage
            .resource_types
            .find_by_name("missing")
            .expect("r")
            .is_none());
    }
}

#[test]
fn concurrent_updates_leave_one_complete_record() {
    for backend in backends() {
        let storage = &backend.storage;
        let saved = storage
            .stacks
            .save(Stack::new("svc-a", StackType::RestfulApi, "u1"))
            .expect("seed");

        let writers = (0..8)
            .map(|writer| {
                let repo = std::sync::Arc::clone(&storage.stacks);
                let mut copy = saved.clone();
                thread::spawn(move || {
                    copy.description = Some(format!("writer-{writer}"));
                    copy.repository_url = Some(format!("https://git.example.com/{writer}"));
                    repo.save(copy)
                })
            })
            .collect::<Vec<_>>();
        for writer in writers {
            writer
                .join()
                .expect("writer thread")
                .expect("last write wins, no conflict");
        }

        let stored = storage
            .stacks
            .find_by_id(saved.id.expect("id"))
            .expect("find")
            .expect("present");
        let description = stored.description.expect("description set");
        let writer = description.trim_start_matches("writer-");
        assert_eq!(
            stored.repository_url.as_deref(),
            Some(format!("https://git.example.com/{writer}").as_str()),
            "{}: fields from one writer only",
            backend.label
        );
        assert_eq!(stored.created_at, saved.created_at);
    }
}
