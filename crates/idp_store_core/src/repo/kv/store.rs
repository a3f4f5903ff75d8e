use super::plan::UnitCompiler;
use super::schema::{query_field, Lookup, TableNames, LINK_PROVIDER_INDEX};
use crate::error::{StoreError, StoreResult};
use crate::kv::{AttributeValue, Item, KvClient, KvError};
use crate::mapper::{attributes as attr, ItemMapper, MappingError};
use crate::model::record::with_entity;
use crate::model::{
    now, ApiKey, Blueprint, CloudProvider, EntityId, EntityKind, EntityRecord, EntityRef,
    EntityWrite, PropertySchema, ResourceType, ResourceTypeCloudMapping, Stack, Team,
};
use crate::repo::{FieldFilter, FieldValue};
use crate::tx::{
    assign_ids, from_loaded, merge_writes, unit_item_count, MergedUnit, MAX_TRANSACTION_ITEMS,
};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Key-value client plus table layout, shared by every repository of one
/// storage context.
pub struct KvStore {
    client: Arc<dyn KvClient>,
    tables: TableNames,
}

impl KvStore {
    /// Creates missing tables and returns the shared handle.
    pub fn open(client: Arc<dyn KvClient>, table_prefix: &str) -> StoreResult<Self> {
        let tables = TableNames::new(table_prefix);
        let schemas = tables.schemas();
        for schema in &schemas {
            client
                .create_table(schema)
                .map_err(|err| map_kv_error(EntityKind::Stack, err))?;
        }
        info!(
            "event=kv_open module=repo backend=dynamodb status=ok prefix={} tables={}",
            table_prefix,
            schemas.len()
        );
        Ok(Self { client, tables })
    }

    pub(crate) fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub(crate) fn get_item(&self, kind: EntityKind, id: EntityId) -> StoreResult<Option<Item>> {
        self.client
            .get_item(&self.tables.entity(kind), &id.to_string())
            .map_err(|err| map_kv_error(kind, err))
    }

    /// Full table read. Administrative path only.
    pub(crate) fn scan(&self, kind: EntityKind) -> StoreResult<Vec<Item>> {
        self.client
            .scan(&self.tables.entity(kind))
            .map_err(|err| map_kv_error(kind, err))
    }

    /// Items of `kind` matching every filter; the first one picks the index.
    pub(crate) fn find_items(
        &self,
        kind: EntityKind,
        filters: &[FieldFilter],
    ) -> StoreResult<Vec<Item>> {
        let Some((first, rest)) = filters.split_first() else {
            return self.scan(kind);
        };
        let entry = lookup_field(kind, first.field)?;
        let key = first.value.as_key();
        let table = self.tables.entity(kind);
        let mut items = match entry.lookup {
            Lookup::Index(index) | Lookup::SortedIndex(index) => self
                .client
                .query(&table, index, &key)
                .map_err(|err| map_kv_error(kind, err))?,
            Lookup::Link => self.linked_blueprints(&key)?,
            Lookup::Narrow => {
                return Err(StoreError::Validation(format!(
                    "{kind} has no index for `{}`; add an indexed filter first",
                    first.field
                )))
            }
        };

        for filter in rest {
            let entry = lookup_field(kind, filter.field)?;
            let expected = filter.value.as_key();
            items.retain(|item| attribute_matches(item, entry.attribute, &expected));
        }
        Ok(items)
    }

    fn linked_blueprints(&self, cloud_provider_id: &str) -> StoreResult<Vec<Item>> {
        let kind = EntityKind::Blueprint;
        let links = self
            .client
            .query(&self.tables.links(), LINK_PROVIDER_INDEX, cloud_provider_id)
            .map_err(|err| map_kv_error(kind, err))?;
        let table = self.tables.entity(kind);
        let mut items = Vec::with_capacity(links.len());
        for link in links {
            let Some(blueprint_id) = link.get(attr::BLUEPRINT_ID).and_then(AttributeValue::as_s)
            else {
                continue;
            };
            // A link can outlive a concurrently deleted blueprint for one read.
            if let Some(item) = self
                .client
                .get_item(&table, blueprint_id)
                .map_err(|err| map_kv_error(kind, err))?
            {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Record stored under `target`, decoded.
    pub(crate) fn load_record(&self, target: EntityRef) -> StoreResult<Option<EntityRecord>> {
        self.get_item(target.kind, target.id)?
            .map(|item| record_from_item(target.kind, &item))
            .transpose()
    }

    /// Folds `writes`, compiles them into one transaction and runs it.
    pub(crate) fn apply(&self, mut writes: Vec<EntityWrite>) -> StoreResult<Vec<EntityRecord>> {
        let Some(first_kind) = writes.first().map(EntityWrite::kind) else {
            return Ok(Vec::new());
        };
        assign_ids(&mut writes);
        let MergedUnit { writes: net, order } = merge_writes(&writes)?;

        let mut stored = HashMap::with_capacity(net.len());
        for write in &net {
            stored.insert(write.target, self.load_record(write.target)?);
        }
        let items = unit_item_count(&net, from_loaded(&stored))?;
        if items > MAX_TRANSACTION_ITEMS {
            return Err(StoreError::TransactionTooLarge {
                items,
                limit: MAX_TRANSACTION_ITEMS,
            });
        }

        let now = now();
        let mut compiler = UnitCompiler::new(self, now, &stored);
        for write in net {
            compiler.add(write)?;
        }
        let unit = compiler.finish();
        let stored_created_at = |target: EntityRef| {
            stored
                .get(&target)
                .and_then(Option::as_ref)
                .and_then(EntityRecord::created_at)
        };
        if unit.ops.is_empty() {
            return order.resolve(unit.saved, now, stored_created_at);
        }
        if unit.ops.len() > MAX_TRANSACTION_ITEMS {
            return Err(StoreError::TransactionTooLarge {
                items: unit.ops.len(),
                limit: MAX_TRANSACTION_ITEMS,
            });
        }

        let item_count = unit.ops.len();
        match self.client.transact_write(unit.ops) {
            Ok(()) => {
                debug!(
                    "event=kv_transact module=repo backend=dynamodb status=ok writes={} items={}",
                    writes.len(),
                    item_count
                );
                order.resolve(unit.saved, now, stored_created_at)
            }
            Err(KvError::TransactionCanceled { reasons }) => {
                Err(super::plan::map_cancellation(&unit.purposes, first_kind, &reasons))
            }
            Err(err) => Err(map_kv_error(first_kind, err)),
        }
    }
}

fn lookup_field(kind: EntityKind, field: &str) -> StoreResult<&'static super::schema::QueryField> {
    query_field(kind, field)
        .ok_or_else(|| StoreError::Validation(format!("{kind} cannot be queried by `{field}`")))
}

fn attribute_matches(item: &Item, attribute: &str, expected: &str) -> bool {
    match item.get(attribute) {
        Some(AttributeValue::S(value)) => value == expected,
        Some(AttributeValue::L(values)) => values
            .iter()
            .any(|value| value.as_s() == Some(expected)),
        _ => false,
    }
}

/// Identifier stored under `id`, when it parses.
pub(crate) fn item_uuid(item: &Item) -> Option<EntityId> {
    item.get(attr::ID)
        .and_then(AttributeValue::as_s)
        .and_then(|text| Uuid::parse_str(text).ok())
}

pub(crate) fn record_to_item(record: &EntityRecord) -> Item {
    with_entity!(record, entity => entity.to_item())
}

pub(crate) fn record_from_item(kind: EntityKind, item: &Item) -> StoreResult<EntityRecord> {
    fn wrap<E: ItemMapper + Into<EntityRecord>>(item: &Item) -> Result<EntityRecord, MappingError> {
        E::from_item(item).map(Into::into)
    }
    let record = match kind {
        EntityKind::CloudProvider => wrap::<CloudProvider>(item),
        EntityKind::ResourceType => wrap::<ResourceType>(item),
        EntityKind::ResourceTypeCloudMapping => wrap::<ResourceTypeCloudMapping>(item),
        EntityKind::PropertySchema => wrap::<PropertySchema>(item),
        EntityKind::Blueprint => wrap::<Blueprint>(item),
        EntityKind::Team => wrap::<Team>(item),
        EntityKind::Stack => wrap::<Stack>(item),
        EntityKind::ApiKey => wrap::<ApiKey>(item),
    }?;
    Ok(record)
}

/// Maps a key-value failure on `kind` onto the store error taxonomy.
pub(crate) fn map_kv_error(kind: EntityKind, err: KvError) -> StoreError {
    match err {
        KvError::Throttled(message) => StoreError::Capacity(format!("throttled: {message}")),
        KvError::RequestLimit { .. } => StoreError::Capacity(err.to_string()),
        KvError::Unavailable(message) => StoreError::Connectivity(message),
        KvError::ItemTooLarge { bytes, limit, .. } => StoreError::SizeLimit { kind, bytes, limit },
        KvError::ConditionalCheckFailed { .. } | KvError::TransactionCanceled { .. } => {
            StoreError::conflict(kind, err.to_string())
        }
        KvError::ResourceNotFound(_) | KvError::Validation(_) | KvError::Service(_) => {
            StoreError::backend(err)
        }
    }
}

/// Queries that find a stored record holding one of `record`'s unique
/// values.
pub(crate) fn unique_lookups(record: &EntityRecord) -> Vec<Vec<FieldFilter>> {
    use crate::repo::{eq_id, eq_text, fields};
    match record {
        EntityRecord::CloudProvider(CloudProvider { name, .. })
        | EntityRecord::ResourceType(ResourceType { name, .. })
        | EntityRecord::Blueprint(Blueprint { name, .. })
        | EntityRecord::Team(Team { name, .. }) => vec![vec![eq_text(fields::NAME, name)]],
        EntityRecord::ResourceTypeCloudMapping(mapping) => vec![vec![
            eq_id(fields::RESOURCE_TYPE_ID, mapping.resource_type_id),
            eq_id(fields::CLOUD_PROVIDER_ID, mapping.cloud_provider_id),
        ]],
        EntityRecord::PropertySchema(schema) => vec![vec![
            eq_id(fields::MAPPING_ID, schema.mapping_id),
            eq_text(fields::PROPERTY_NAME, &schema.property_name),
        ]],
        EntityRecord::Stack(stack) => vec![vec![
            eq_text(fields::CREATED_BY, &stack.created_by),
            eq_text(fields::NAME, &stack.name),
        ]],
        EntityRecord::ApiKey(key) => vec![vec![eq_text(fields::KEY_HASH, &key.key_hash)]],
    }
}

/// Filter on the record's own identifier, used by dependents lookups.
pub(crate) fn id_filter(field: &'static str, id: EntityId) -> FieldFilter {
    FieldFilter {
        field,
        value: FieldValue::Id(id),
    }
}
