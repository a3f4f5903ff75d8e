//! Compiles a unit of work into one key-value transaction.
//!
//! # Responsibility
//! - Emit entity puts/deletes, uniqueness guard items, blueprint link items
//!   and reference condition checks for each write.
//! - Resolve interactions between writes of the same unit before anything is
//!   sent.
//!
//! # Invariants
//! - Input is the folded unit: one net write per record.
//! - Each backend item is targeted at most once per transaction.
//! - References to entities saved earlier in the unit need no check;
//!   references to entities deleted earlier fail with `NotFound`.
//! - Dependents deleted earlier in the unit do not block a parent delete.
//! - Two writes claiming one unique value fail with `Conflict`.
//! - A guard released and then claimed in the same unit becomes one put
//!   conditioned on the previous owner.

use super::schema::{dependents, guard_id, link_id, OWNER_ID};
use super::store::{id_filter, item_uuid, record_to_item, unique_lookups, KvStore};
use crate::error::{StoreError, StoreResult};
use crate::kv::{
    AttributeValue, CancellationReason, Condition, Item, KvError, WriteOp, MAX_ITEM_BYTES,
};
use crate::kv::attribute::item_size;
use crate::mapper::attributes as attr;
use crate::model::record::with_entity;
use crate::model::{
    Entity, EntityId, EntityKind, EntityRecord, EntityRef, EntityWrite, UniqueKey,
};
use crate::tx::NetWrite;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Why an operation is part of the transaction; drives error mapping.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Purpose {
    Entity { kind: EntityKind },
    Guard { kind: EntityKind, constraint: &'static str },
    Release { kind: EntityKind, constraint: &'static str },
    Reference(EntityRef),
    Link,
}

impl Purpose {
    fn kind(&self) -> EntityKind {
        match self {
            Self::Entity { kind } | Self::Guard { kind, .. } | Self::Release { kind, .. } => *kind,
            Self::Reference(reference) => reference.kind,
            Self::Link => EntityKind::Blueprint,
        }
    }
}

struct Step {
    op: WriteOp,
    purpose: Purpose,
}

pub(crate) struct CompiledUnit {
    pub(crate) ops: Vec<WriteOp>,
    pub(crate) purposes: Vec<Purpose>,
    pub(crate) saved: Vec<EntityRecord>,
}

pub(crate) struct UnitCompiler<'store> {
    store: &'store KvStore,
    now: DateTime<Utc>,
    stored: &'store HashMap<EntityRef, Option<EntityRecord>>,
    steps: Vec<Option<Step>>,
    guard_steps: HashMap<String, usize>,
    check_steps: HashMap<EntityRef, usize>,
    written: HashSet<EntityRef>,
    saved: HashSet<EntityRef>,
    deleted: HashSet<EntityRef>,
    /// Target of a pending reference, mapped to the first record holding it.
    referenced: HashMap<EntityRef, EntityRef>,
    results: Vec<EntityRecord>,
}

impl<'store> UnitCompiler<'store> {
    /// `stored` holds every target of the unit as persisted before it runs.
    pub(crate) fn new(
        store: &'store KvStore,
        now: DateTime<Utc>,
        stored: &'store HashMap<EntityRef, Option<EntityRecord>>,
    ) -> Self {
        Self {
            store,
            now,
            stored,
            steps: Vec::new(),
            guard_steps: HashMap::new(),
            check_steps: HashMap::new(),
            written: HashSet::new(),
            saved: HashSet::new(),
            deleted: HashSet::new(),
            referenced: HashMap::new(),
            results: Vec::new(),
        }
    }

    fn push(&mut self, op: WriteOp, purpose: Purpose) -> usize {
        self.steps.push(Some(Step { op, purpose }));
        self.steps.len() - 1
    }

    fn previous(&self, target: EntityRef) -> Option<EntityRecord> {
        self.stored.get(&target).cloned().flatten()
    }

    pub(crate) fn add(&mut self, net: NetWrite) -> StoreResult<()> {
        self.written.insert(net.target);
        match net.write {
            EntityWrite::Save(record) => {
                self.add_save(record, &net.carried_references, net.recreates)
            }
            EntityWrite::Delete { kind, id } => {
                self.add_delete(kind, id, &net.carried_references)
            }
        }
    }

    /// Condition checks for `references`; `holder` keeps them pinned until
    /// the unit ends.
    fn check_references(
        &mut self,
        references: &[EntityRef],
        holder: Option<EntityRef>,
    ) -> StoreResult<()> {
        for &reference in references {
            if self.deleted.contains(&reference) {
                return Err(StoreError::not_found(reference.kind, reference.id));
            }
            if let Some(holder) = holder {
                self.referenced.entry(reference).or_insert(holder);
            }
            if self.saved.contains(&reference) || self.check_steps.contains_key(&reference) {
                continue;
            }
            let index = self.push(
                WriteOp::ConditionCheck {
                    table: self.store.tables().entity(reference.kind),
                    id: reference.id.to_string(),
                    condition: Condition::AttributeExists(attr::ID.to_string()),
                },
                Purpose::Reference(reference),
            );
            self.check_steps.insert(reference, index);
        }
        Ok(())
    }

    fn add_save(
        &mut self,
        mut record: EntityRecord,
        carried: &[EntityRef],
        recreates: bool,
    ) -> StoreResult<()> {
        let kind = record.kind();
        let id = record.id().unwrap_or_else(Uuid::new_v4);
        let target = EntityRef::new(kind, id);

        self.check_references(&record.references(), Some(target))?;
        self.check_references(carried, None)?;

        let previous = self.previous(target);
        if recreates && previous.is_some() {
            // The delete folded into this save must not orphan dependents.
            self.reject_dependents(kind, id)?;
        }

        for filters in unique_lookups(&record) {
            for hit in self.store.find_items(kind, &filters)? {
                let Some(hit_id) = item_uuid(&hit) else {
                    continue;
                };
                // Records written earlier in this unit are judged by their guards.
                if hit_id != id && !self.written.contains(&EntityRef::new(kind, hit_id)) {
                    return Err(StoreError::conflict(
                        kind,
                        format!("another {kind} ({hit_id}) already holds this unique value"),
                    ));
                }
            }
        }

        let updated_at = self.now;
        let created_at = match &previous {
            Some(stored) if !recreates => stored.created_at().unwrap_or(updated_at),
            _ => updated_at,
        };
        with_entity!(&mut record, entity => {
            entity.set_id(id);
            entity.set_timestamps(created_at, updated_at);
        });

        let item = record_to_item(&record);
        let bytes = item_size(&item);
        if bytes > MAX_ITEM_BYTES {
            return Err(StoreError::SizeLimit {
                kind,
                bytes,
                limit: MAX_ITEM_BYTES,
            });
        }

        // A record checked by an earlier write is created or replaced here.
        if let Some(index) = self.check_steps.remove(&target) {
            self.steps[index] = None;
        }
        let table = self.store.tables().entity(kind);
        self.push(
            WriteOp::Put {
                table: table.clone(),
                item,
                condition: None,
            },
            Purpose::Entity { kind },
        );

        let new_keys = record.unique_keys();
        let old_keys = previous
            .as_ref()
            .map(EntityRecord::unique_keys)
            .unwrap_or_default();
        for key in &new_keys {
            self.claim_guard(kind, &table, key, id)?;
        }
        for key in old_keys.iter().filter(|key| !new_keys.contains(key)) {
            self.release_guard(kind, &table, key, id);
        }

        if let EntityRecord::Blueprint(blueprint) = &record {
            let old_links = match &previous {
                Some(EntityRecord::Blueprint(stored)) => stored.supported_cloud_provider_ids.clone(),
                _ => BTreeSet::new(),
            };
            for provider_id in &blueprint.supported_cloud_provider_ids {
                self.put_link(id, *provider_id);
            }
            for provider_id in old_links.difference(&blueprint.supported_cloud_provider_ids) {
                self.delete_link(id, *provider_id);
            }
        }

        self.saved.insert(target);
        self.results.push(record);
        Ok(())
    }

    fn add_delete(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        carried: &[EntityRef],
    ) -> StoreResult<()> {
        let target = EntityRef::new(kind, id);
        if let Some(holder) = self.referenced.get(&target) {
            return Err(StoreError::conflict(
                kind,
                format!(
                    "{kind} {id} is referenced by {} {} in the same unit of work",
                    holder.kind, holder.id
                ),
            ));
        }
        self.check_references(carried, None)?;

        let Some(previous) = self.previous(target) else {
            self.deleted.insert(target);
            return Ok(());
        };
        // Dependents are read before the transaction and nothing in it
        // conditions on their absence: a dependent committed by another
        // writer between this read and the commit is not seen, and index
        // reads may lag the base table. Relational restricted deletes have
        // no such window.
        self.reject_dependents(kind, id)?;

        if let Some(index) = self.check_steps.remove(&target) {
            self.steps[index] = None;
        }
        let table = self.store.tables().entity(kind);
        self.push(
            WriteOp::Delete {
                table: table.clone(),
                id: id.to_string(),
                condition: None,
            },
            Purpose::Entity { kind },
        );
        for key in previous.unique_keys() {
            self.release_guard(kind, &table, &key, id);
        }
        if let EntityRecord::Blueprint(stored) = &previous {
            for provider_id in &stored.supported_cloud_provider_ids {
                self.delete_link(id, *provider_id);
            }
        }

        self.deleted.insert(target);
        Ok(())
    }

    /// Fails while a record outside this unit still points at `kind`/`id`.
    fn reject_dependents(&self, kind: EntityKind, id: EntityId) -> StoreResult<()> {
        for dependent in dependents(kind) {
            let hits = self
                .store
                .find_items(dependent.kind, &[id_filter(dependent.field, id)])?;
            for hit in hits {
                let Some(hit_id) = item_uuid(&hit) else {
                    continue;
                };
                if self
                    .written
                    .contains(&EntityRef::new(dependent.kind, hit_id))
                {
                    continue;
                }
                return Err(StoreError::conflict(
                    kind,
                    format!(
                        "{kind} {id} is still referenced by {} {hit_id}",
                        dependent.kind
                    ),
                ));
            }
        }
        Ok(())
    }

    fn claim_guard(
        &mut self,
        kind: EntityKind,
        table: &str,
        key: &UniqueKey,
        owner: EntityId,
    ) -> StoreResult<()> {
        let guard = guard_id(table, key);
        let owner_value = AttributeValue::S(owner.to_string());
        let condition = match self.guard_steps.get(&guard) {
            Some(&index) => match self.steps[index].take() {
                Some(Step {
                    op: WriteOp::Delete { condition, .. },
                    purpose: Purpose::Release { .. },
                }) => condition,
                other => {
                    self.steps[index] = other;
                    return Err(StoreError::conflict(
                        kind,
                        format!("two writes in one unit of work claim the same {} value", key.constraint),
                    ));
                }
            },
            None => Some(Condition::or(
                Condition::AttributeNotExists(attr::ID.to_string()),
                Condition::Equals(OWNER_ID.to_string(), owner_value.clone()),
            )),
        };

        let mut item = Item::new();
        item.insert(attr::ID.to_string(), AttributeValue::S(guard.clone()));
        item.insert(OWNER_ID.to_string(), owner_value);
        let step = Step {
            op: WriteOp::Put {
                table: self.store.tables().unique_keys(),
                item,
                condition,
            },
            purpose: Purpose::Guard {
                kind,
                constraint: key.constraint,
            },
        };
        match self.guard_steps.get(&guard) {
            Some(&index) => self.steps[index] = Some(step),
            None => {
                self.steps.push(Some(step));
                self.guard_steps.insert(guard, self.steps.len() - 1);
            }
        }
        Ok(())
    }

    fn release_guard(&mut self, kind: EntityKind, table: &str, key: &UniqueKey, owner: EntityId) {
        let guard = guard_id(table, key);
        // A claim earlier in the unit already conditions on the owner.
        if self.guard_steps.contains_key(&guard) {
            return;
        }
        let index = self.push(
            WriteOp::Delete {
                table: self.store.tables().unique_keys(),
                id: guard.clone(),
                condition: Some(Condition::Equals(
                    OWNER_ID.to_string(),
                    AttributeValue::S(owner.to_string()),
                )),
            },
            Purpose::Release {
                kind,
                constraint: key.constraint,
            },
        );
        self.guard_steps.insert(guard, index);
    }

    fn put_link(&mut self, blueprint_id: EntityId, cloud_provider_id: EntityId) {
        let mut item = Item::new();
        item.insert(
            attr::ID.to_string(),
            AttributeValue::S(link_id(blueprint_id, cloud_provider_id)),
        );
        item.insert(
            attr::BLUEPRINT_ID.to_string(),
            AttributeValue::S(blueprint_id.to_string()),
        );
        item.insert(
            attr::CLOUD_PROVIDER_ID.to_string(),
            AttributeValue::S(cloud_provider_id.to_string()),
        );
        self.push(
            WriteOp::Put {
                table: self.store.tables().links(),
                item,
                condition: None,
            },
            Purpose::Link,
        );
    }

    fn delete_link(&mut self, blueprint_id: EntityId, cloud_provider_id: EntityId) {
        self.push(
            WriteOp::Delete {
                table: self.store.tables().links(),
                id: link_id(blueprint_id, cloud_provider_id),
                condition: None,
            },
            Purpose::Link,
        );
    }

    pub(crate) fn finish(self) -> CompiledUnit {
        let (ops, purposes) = self
            .steps
            .into_iter()
            .flatten()
            .map(|step| (step.op, step.purpose))
            .unzip();
        CompiledUnit {
            ops,
            purposes,
            saved: self.results,
        }
    }
}

/// Maps a cancelled transaction onto the store error of its first failed
/// operation.
pub(crate) fn map_cancellation(
    purposes: &[Purpose],
    fallback: EntityKind,
    reasons: &[CancellationReason],
) -> StoreError {
    for (reason, purpose) in reasons.iter().zip(purposes) {
        match reason {
            CancellationReason::None => continue,
            CancellationReason::ConditionalCheckFailed => {
                return match purpose {
                    Purpose::Guard { kind, constraint } => StoreError::conflict(
                        *kind,
                        format!("another {kind} already holds this {constraint} value"),
                    ),
                    Purpose::Release { kind, constraint } => StoreError::conflict(
                        *kind,
                        format!("{constraint} value changed owner concurrently"),
                    ),
                    Purpose::Reference(reference) => {
                        StoreError::not_found(reference.kind, reference.id)
                    }
                    Purpose::Entity { kind } => {
                        StoreError::conflict(*kind, "conditional write failed")
                    }
                    Purpose::Link => {
                        StoreError::conflict(EntityKind::Blueprint, "conditional write failed")
                    }
                };
            }
            CancellationReason::TransactionConflict => {
                return StoreError::conflict(
                    purpose.kind(),
                    "concurrent transaction touched the same item",
                );
            }
            CancellationReason::Throttled => {
                return StoreError::Capacity("transaction throttled".to_string());
            }
            CancellationReason::Other(code) => {
                return StoreError::backend(KvError::Service(code.clone()));
            }
        }
    }
    StoreError::conflict(fallback, "transaction cancelled")
}

#[cfg(test)]
mod tests {
    use super::{map_cancellation, Purpose};
    use crate::error::StoreError;
    use crate::kv::CancellationReason;
    use crate::model::{EntityKind, EntityRef};
    use uuid::Uuid;

    #[test]
    fn failed_reference_check_is_not_found() {
        let team = EntityRef::new(EntityKind::Team, Uuid::new_v4());
        let err = map_cancellation(
            &[Purpose::Entity { kind: EntityKind::Stack }, Purpose::Reference(team)],
            EntityKind::Stack,
            &[
                CancellationReason::None,
                CancellationReason::ConditionalCheckFailed,
            ],
        );
        assert!(matches!(err, StoreError::NotFound { kind: EntityKind::Team, id } if id == team.id));
    }

    #[test]
    fn failed_guard_is_conflict() {
        let err = map_cancellation(
            &[
                Purpose::Entity { kind: EntityKind::Stack },
                Purpose::Guard {
                    kind: EntityKind::Stack,
                    constraint: "name_created_by",
                },
            ],
            EntityKind::Stack,
            &[
                CancellationReason::None,
                CancellationReason::ConditionalCheckFailed,
            ],
        );
        assert!(matches!(err, StoreError::Conflict { kind: EntityKind::Stack, .. }));
    }

    #[test]
    fn throttled_cancellation_is_capacity() {
        let err = map_cancellation(
            &[Purpose::Link],
            EntityKind::Blueprint,
            &[CancellationReason::Throttled],
        );
        assert!(matches!(err, StoreError::Capacity(_)));
    }
}
