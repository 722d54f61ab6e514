//! Persistence layer collaborators consumed by the migration engine
//!
//! The engine only ever talks to the `RecordStore`, `RecordCursor`, and
//! `SideEffectSuspension` traits defined at the crate root. This module holds
//! the record type they exchange and an in-memory store implementation.

mod memory;

pub use memory::InMemoryRecordStore;

use std::collections::HashMap;

/// Identifier of a record within its entity type.
pub type RecordId = u64;

/// Field values of one record, keyed by field name. `None` is a null value.
pub type FieldValues = HashMap<String, Option<String>>;

/// A single record streamed from the store, carrying decoded field values.
#[derive(Debug, Clone)]
pub struct Record {
    id: RecordId,
    values: FieldValues,
}

impl Record {
    /// Creates a record from decoded field values.
    pub fn new(id: RecordId, values: FieldValues) -> Self {
        Self { id, values }
    }

    /// Returns the record id.
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Returns the decoded value of a field, or `None` when the field is null
    /// or not present on this record.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(|value| value.as_deref())
    }
}
