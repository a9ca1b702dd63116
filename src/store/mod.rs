/// Destination document stores.
///
/// A store holds one collection of `NormalizedRecord` documents, unique on
/// the natural key `(source, latitude, longitude, timestamp)`. Writes are
/// always upserts that merge metrics into an existing document.
///
/// - `pg`     - PostgreSQL table with a JSONB `metrics` document
/// - `memory` - in-process map with identical semantics (dry runs, tests)

pub mod memory;
pub mod pg;

use std::collections::BTreeMap;

use crate::error::PersistenceError;
use crate::model::{NaturalKey, NormalizedRecord};

pub use memory::MemoryStore;
pub use pg::PostgresStore;

/// Result of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

pub trait DocumentStore {
    /// Name of the destination collection.
    fn collection(&self) -> &str;

    /// Creates the collection and its unique index on the natural key if
    /// they do not exist yet. Idempotent.
    fn ensure_unique_index(&mut self) -> Result<(), PersistenceError>;

    /// Inserts `record`, or merges it into the document with the same
    /// natural key (see [`merge_metrics`]) and refreshes its provenance.
    fn upsert(&mut self, record: &NormalizedRecord) -> Result<UpsertOutcome, PersistenceError>;

    fn find(&mut self, key: &NaturalKey) -> Result<Option<NormalizedRecord>, PersistenceError>;

    /// Number of documents stored for `source`.
    fn count(&mut self, source: &str) -> Result<u64, PersistenceError>;
}

impl<S: DocumentStore + ?Sized> DocumentStore for &mut S {
    fn collection(&self) -> &str {
        (**self).collection()
    }

    fn ensure_unique_index(&mut self) -> Result<(), PersistenceError> {
        (**self).ensure_unique_index()
    }

    fn upsert(&mut self, record: &NormalizedRecord) -> Result<UpsertOutcome, PersistenceError> {
        (**self).upsert(record)
    }

    fn find(&mut self, key: &NaturalKey) -> Result<Option<NormalizedRecord>, PersistenceError> {
        (**self).find(key)
    }

    fn count(&mut self, source: &str) -> Result<u64, PersistenceError> {
        (**self).count(source)
    }
}

/// Merge rule applied when a document already exists:
/// non-null incoming values overwrite, null incoming values never erase a
/// stored value, metrics the incoming record does not mention are kept, and
/// metrics never seen before are added (even when null).
///
/// The PostgreSQL store expresses the same rule in SQL as
/// `(new || old) || jsonb_strip_nulls(new)`.
pub fn merge_metrics(
    stored: &mut BTreeMap<String, Option<f64>>,
    incoming: &BTreeMap<String, Option<f64>>,
) {
    for (name, value) in incoming {
        match value {
            Some(v) => {
                stored.insert(name.clone(), Some(*v));
            }
            None => {
                stored.entry(name.clone()).or_insert(None);
            }
        }
    }
}
