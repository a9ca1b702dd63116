/// In-process document store.
///
/// Same contract as the PostgreSQL store, including the rule that the unique
/// index must be ensured before the first write. Backs `--dry-run` and the
/// test suite.

use std::collections::BTreeMap;

use super::{DocumentStore, UpsertOutcome, merge_metrics};
use crate::error::PersistenceError;
use crate::model::{NaturalKey, NormalizedRecord};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collection: String,
    index_ensured: bool,
    documents: BTreeMap<NaturalKey, NormalizedRecord>,
}

impl MemoryStore {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            index_ensured: false,
            documents: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, key: &NaturalKey) -> Option<&NormalizedRecord> {
        self.documents.get(key)
    }

    /// Documents in natural-key order.
    pub fn documents(&self) -> impl Iterator<Item = &NormalizedRecord> {
        self.documents.values()
    }

    pub fn index_ensured(&self) -> bool {
        self.index_ensured
    }
}

impl DocumentStore for MemoryStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn ensure_unique_index(&mut self) -> Result<(), PersistenceError> {
        self.index_ensured = true;
        Ok(())
    }

    fn upsert(&mut self, record: &NormalizedRecord) -> Result<UpsertOutcome, PersistenceError> {
        if !self.index_ensured {
            return Err(PersistenceError::Unavailable(format!(
                "unique index on '{}' has not been ensured",
                self.collection
            )));
        }

        match self.documents.get_mut(&record.natural_key()) {
            Some(stored) => {
                merge_metrics(&mut stored.metrics, &record.metrics);
                stored.ingested_at = record.ingested_at;
                stored.run_id = record.run_id.clone();
                Ok(UpsertOutcome::Updated)
            }
            None => {
                self.documents.insert(record.natural_key(), record.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    fn find(&mut self, key: &NaturalKey) -> Result<Option<NormalizedRecord>, PersistenceError> {
        Ok(self.documents.get(key).cloned())
    }

    fn count(&mut self, source: &str) -> Result<u64, PersistenceError> {
        Ok(self.documents.keys().filter(|k| k.source == source).count() as u64)
    }
}
