//! Folds repeated writes to one record into the write that decides its final
//! state.
//!
//! # Invariants
//! - Each record keeps one net write, placed where its last write was
//!   submitted.
//! - References of superseded saves travel with the net write; they must
//!   still exist when the unit commits.
//! - A delete of a record still referenced by a live save of the unit fails
//!   with `Conflict`; a save referencing a record the unit deleted fails with
//!   `NotFound`.

use crate::error::{StoreError, StoreResult};
use crate::model::record::with_entity;
use crate::model::{Entity, EntityRecord, EntityRef, EntityWrite};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Gives every new record its identifier up front, so later writes of the
/// unit can address it.
pub(crate) fn assign_ids(writes: &mut [EntityWrite]) {
    for write in writes {
        if let EntityWrite::Save(record) = write {
            if record.id().is_none() {
                with_entity!(record, entity => entity.set_id(Uuid::new_v4()));
            }
        }
    }
}

/// Last write of one record within a unit.
#[derive(Debug, Clone)]
pub(crate) struct NetWrite {
    pub(crate) target: EntityRef,
    pub(crate) write: EntityWrite,
    /// The unit deleted the record before this save, which recreates it.
    pub(crate) recreates: bool,
    pub(crate) carried_references: Vec<EntityRef>,
}

enum Slot {
    Final(EntityRef),
    Superseded {
        record: EntityRecord,
        after_delete: bool,
    },
}

/// Where each submitted save finds its returned record.
pub(crate) struct SaveOrder {
    slots: Vec<Slot>,
}

pub(crate) struct MergedUnit {
    pub(crate) writes: Vec<NetWrite>,
    pub(crate) order: SaveOrder,
}

struct Chain {
    position: usize,
    net: NetWrite,
    slot: Option<usize>,
    deleted: bool,
    after_delete: bool,
}

fn target_of(write: &EntityWrite) -> StoreResult<EntityRef> {
    match write {
        EntityWrite::Save(record) => record
            .id()
            .map(|id| EntityRef::new(record.kind(), id))
            .ok_or_else(|| StoreError::Validation(format!("{} save has no id", record.kind()))),
        EntityWrite::Delete { kind, id } => Ok(EntityRef::new(*kind, *id)),
    }
}

/// Folds `writes` per record. Saves must already carry their ids.
pub(crate) fn merge_writes(writes: &[EntityWrite]) -> StoreResult<MergedUnit> {
    let mut chains: HashMap<EntityRef, Chain> = HashMap::new();
    let mut slots = Vec::new();
    // Records saved and not deleted since, with the references they hold.
    let mut holders: HashMap<EntityRef, Vec<EntityRef>> = HashMap::new();
    let mut removed: HashSet<EntityRef> = HashSet::new();

    for (position, write) in writes.iter().enumerate() {
        let target = target_of(write)?;
        match write {
            EntityWrite::Delete { kind, id } => {
                let holder = holders
                    .iter()
                    .find(|(holder, references)| **holder != target && references.contains(&target));
                if let Some((holder, _)) = holder {
                    return Err(StoreError::conflict(
                        *kind,
                        format!(
                            "{kind} {id} is referenced by {} {} in the same unit of work",
                            holder.kind, holder.id
                        ),
                    ));
                }
                holders.remove(&target);
                removed.insert(target);
            }
            EntityWrite::Save(record) => {
                let references = record.references();
                if let Some(gone) = references.iter().find(|reference| removed.contains(reference)) {
                    return Err(StoreError::not_found(gone.kind, gone.id));
                }
                removed.remove(&target);
                holders.insert(target, references);
            }
        }

        let chain = chains.entry(target).or_insert_with(|| Chain {
            position,
            net: NetWrite {
                target,
                write: write.clone(),
                recreates: false,
                carried_references: Vec::new(),
            },
            slot: None,
            deleted: false,
            after_delete: false,
        });
        if chain.position != position {
            if let (EntityWrite::Save(previous), Some(slot)) = (&chain.net.write, chain.slot) {
                for reference in previous.references() {
                    if reference != target && !chain.net.carried_references.contains(&reference) {
                        chain.net.carried_references.push(reference);
                    }
                }
                slots[slot] = Slot::Superseded {
                    record: previous.clone(),
                    after_delete: chain.after_delete,
                };
            }
            chain.position = position;
            chain.net.write = write.clone();
            chain.slot = None;
            debug!(
                "event=unit_merge module=tx kind={} write={} status=folded",
                target.kind, position
            );
        }
        match write {
            EntityWrite::Save(_) => {
                chain.after_delete = chain.deleted;
                chain.net.recreates = chain.deleted;
                chain.slot = Some(slots.len());
                slots.push(Slot::Final(target));
            }
            EntityWrite::Delete { .. } => {
                chain.deleted = true;
                chain.net.recreates = false;
            }
        }
    }

    let mut chains = chains.into_values().collect::<Vec<_>>();
    chains.sort_by_key(|chain| chain.position);
    Ok(MergedUnit {
        writes: chains.into_iter().map(|chain| chain.net).collect(),
        order: SaveOrder { slots },
    })
}

impl SaveOrder {
    /// Returned records in submission order. `persisted` holds the net saves
    /// as written; superseded saves get the timestamps they would have had if
    /// every write had been applied in turn.
    pub(crate) fn resolve<F>(
        self,
        persisted: Vec<EntityRecord>,
        now: DateTime<Utc>,
        mut stored_created_at: F,
    ) -> StoreResult<Vec<EntityRecord>>
    where
        F: FnMut(EntityRef) -> Option<DateTime<Utc>>,
    {
        let mut persisted = persisted
            .into_iter()
            .filter_map(|record| {
                record
                    .id()
                    .map(|id| (EntityRef::new(record.kind(), id), record))
            })
            .collect::<HashMap<_, _>>();
        self.slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Final(target) => persisted.remove(&target).ok_or_else(|| {
                    StoreError::Validation(format!(
                        "{} {} was not part of the written unit",
                        target.kind, target.id
                    ))
                }),
                Slot::Superseded {
                    mut record,
                    after_delete,
                } => {
                    let created_at = match (after_delete, record.id()) {
                        (false, Some(id)) => {
                            stored_created_at(EntityRef::new(record.kind(), id)).unwrap_or(now)
                        }
                        _ => now,
                    };
                    with_entity!(&mut record, entity => entity.set_timestamps(created_at, now));
                    Ok(record)
                }
            })
            .collect()
    }
}
