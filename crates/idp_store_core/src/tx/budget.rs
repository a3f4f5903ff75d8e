//! Backend item accounting for a unit of work.
//!
//! The count follows what the key-value compiler emits for the same net
//! writes, so both backends accept and reject the same units.

use super::merge::NetWrite;
use crate::error::StoreResult;
use crate::model::{EntityId, EntityKind, EntityRecord, EntityRef, EntityWrite, UniqueKey};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Items `writes` occupy. `stored` returns a record as persisted before the
/// unit runs.
pub(crate) fn unit_item_count<F>(writes: &[NetWrite], mut stored: F) -> StoreResult<usize>
where
    F: FnMut(EntityRef) -> StoreResult<Option<EntityRecord>>,
{
    let mut items = 0;
    let mut saved = HashSet::new();
    let mut checked = HashSet::new();
    // Guard items already in the unit; a release followed by a claim shares one.
    let mut guards: HashSet<(EntityKind, UniqueKey)> = HashSet::new();

    for net in writes {
        let target = net.target;
        let own = match &net.write {
            EntityWrite::Save(record) => record.references(),
            EntityWrite::Delete { .. } => Vec::new(),
        };
        for reference in own.into_iter().chain(net.carried_references.iter().copied()) {
            if !saved.contains(&reference) && checked.insert(reference) {
                items += 1;
            }
        }

        let previous = stored(target)?;
        match &net.write {
            EntityWrite::Save(record) => {
                if checked.remove(&target) {
                    items -= 1;
                }
                items += 1;
                let new_keys = record.unique_keys();
                for key in &new_keys {
                    if guards.insert((target.kind, key.clone())) {
                        items += 1;
                    }
                }
                let old_keys = previous
                    .as_ref()
                    .map(EntityRecord::unique_keys)
                    .unwrap_or_default();
                for key in old_keys.into_iter().filter(|key| !new_keys.contains(key)) {
                    if guards.insert((target.kind, key)) {
                        items += 1;
                    }
                }
                if matches!(record, EntityRecord::Blueprint(_)) {
                    let new_links = linked_providers(Some(record));
                    let old_links = linked_providers(previous.as_ref());
                    items += new_links.len() + old_links.difference(&new_links).count();
                }
                saved.insert(target);
            }
            EntityWrite::Delete { .. } => {
                let Some(previous) = previous else {
                    continue;
                };
                if checked.remove(&target) {
                    items -= 1;
                }
                items += 1;
                for key in previous.unique_keys() {
                    if guards.insert((target.kind, key)) {
                        items += 1;
                    }
                }
                items += linked_providers(Some(&previous)).len();
            }
        }
    }
    Ok(items)
}

fn linked_providers(record: Option<&EntityRecord>) -> BTreeSet<EntityId> {
    match record {
        Some(EntityRecord::Blueprint(blueprint)) => blueprint.supported_cloud_provider_ids.clone(),
        _ => BTreeSet::new(),
    }
}

/// Stored records by target, for counting against already loaded state.
pub(crate) fn from_loaded(
    loaded: &HashMap<EntityRef, Option<EntityRecord>>,
) -> impl FnMut(EntityRef) -> StoreResult<Option<EntityRecord>> + '_ {
    move |target| Ok(loaded.get(&target).cloned().flatten())
}
