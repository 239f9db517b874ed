//! # Storage
//!
//! Reference [`DataChannel`](crate::channel::DataChannel) implementations.
//!
//! - [`MemoryStore`]: in-process tables, copy-on-write per unit of work
//! - [`RedbStore`]: disk-backed tables in a redb database
//!
//! Both apply a unit of work all-or-nothing and report a lost optimistic
//! lock by failing the whole unit with `OptimisticLockFailure`.

pub mod memory;
pub mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::{ObjectId, TesseraError, Value};
use std::collections::BTreeMap;

/// Column name -> value for one stored row.
pub type Columns = BTreeMap<String, Value>;

/// Whether every qualifier entry equals the row's value. Missing columns
/// compare as `Null`.
pub(crate) fn qualifies(row: &Columns, qualifier: &Columns) -> bool {
    qualifier
        .iter()
        .all(|(column, expected)| row.get(column).unwrap_or(&Value::Null) == expected)
}

/// Outcome for an update or delete that matched no row.
///
/// A qualifier with columns beyond the primary key came from an entity with
/// optimistic locking; missing that row aborts the unit of work.
pub(crate) fn unmatched(id: &ObjectId, qualifier: &Columns) -> Result<u64, TesseraError> {
    let key_len = id.key_values().map_or(0, BTreeMap::len);
    if qualifier.len() > key_len {
        return Err(TesseraError::OptimisticLockFailure(id.clone()));
    }
    Ok(0)
}

/// Sequence name for a generated key column.
pub(crate) fn sequence_name(entity: &str, column: &str) -> String {
    format!("{entity}.{column}")
}
