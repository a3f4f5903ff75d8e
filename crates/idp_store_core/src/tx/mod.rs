//! Unit-of-work contract.
//!
//! # Invariants
//! - Either every write in a unit is persisted or none is.
//! - Writes apply in submission order; a later write sees earlier ones.
//! - Several writes to one record behave as if applied one by one: a later
//!   save replaces an earlier one, a delete after a save removes the record
//!   and a save after a delete recreates it.
//! - Every backend measures a unit with the same item count against
//!   [`MAX_TRANSACTION_ITEMS`]; oversize units fail up front with
//!   `TransactionTooLarge`. Key-value units are never split.
//!
//! # See also
//! - `merge` for how repeated writes to one record fold together.
//! - `budget` for how backend items are counted.

mod budget;
mod merge;

pub(crate) use budget::{from_loaded, unit_item_count};
pub(crate) use merge::{assign_ids, merge_writes, MergedUnit, NetWrite};

use crate::error::StoreResult;
use crate::model::{EntityRecord, EntityWrite};

/// Ceiling on the backend items one unit of work may occupy.
///
/// Items are counted the way the key-value layout stores the unit, on every
/// backend alike, after repeated writes to one record are folded together:
/// one per entity written, one per unique value claimed or released, one per
/// reference to a record the unit does not save itself, and one per blueprint
/// provider link added or removed. Sixty new teams need 120 items and are
/// rejected by both backends.
pub const MAX_TRANSACTION_ITEMS: usize = 100;

pub trait TransactionCoordinator: Send + Sync {
    /// Applies `writes` atomically and returns the saved records, one per
    /// `Save` write, in submission order.
    fn execute(&self, writes: Vec<EntityWrite>) -> StoreResult<Vec<EntityRecord>>;
}
