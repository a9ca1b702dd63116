/// Loader: stamps provenance onto normalized records and upserts them one at
/// a time into a `DocumentStore`.
///
/// The unique index is ensured before the first write of the loader's
/// lifetime. A record that still fails after its retries ends the load;
/// nothing after it is attempted, and the `LoadFailure` says exactly where
/// the run stopped.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{LoadFailure, PersistenceError};
use crate::model::{NormalizedRecord, RunId};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{DocumentStore, UpsertOutcome};

/// Counts for one `Loader::load` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub inserted: usize,
    pub updated: usize,
}

impl LoadSummary {
    /// Records successfully written (`inserted + updated`).
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }
}

pub struct Loader<S> {
    store: S,
    retry: RetryPolicy,
    run_id: RunId,
    index_ready: bool,
}

impl<S: DocumentStore> Loader<S> {
    pub fn new(store: S, retry: RetryPolicy, run_id: RunId) -> Self {
        Self {
            store,
            retry,
            run_id,
            index_ready: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Ensures the collection's unique index exists. Runs at most once per
    /// loader; later calls are no-ops.
    pub fn prepare(&mut self) -> Result<(), PersistenceError> {
        if self.index_ready {
            return Ok(());
        }
        let store = &mut self.store;
        self.retry
            .run(|_| store.ensure_unique_index(), classify)
            .map_err(|e| e.into_inner())?;
        self.index_ready = true;
        Ok(())
    }

    /// Upserts `records` in order, setting `ingested_at` to now and the
    /// loader's run id on each one.
    ///
    /// An empty batch performs no writes. On failure, the returned
    /// `LoadFailure` carries the counts for records `0..failed_index`, all
    /// of which were persisted.
    pub fn load(&mut self, records: Vec<NormalizedRecord>) -> Result<LoadSummary, LoadFailure> {
        let mut summary = LoadSummary::default();

        if let Err(source) = self.prepare() {
            return Err(LoadFailure {
                summary,
                failed_index: 0,
                source,
            });
        }

        let ingested_at = Utc::now();
        let total = records.len();

        for (index, mut record) in records.into_iter().enumerate() {
            record.ingested_at = Some(ingested_at);
            record.run_id = Some(self.run_id.as_str().to_string());

            let store = &mut self.store;
            let result = self.retry.run(|_| store.upsert(&record), classify);

            match result {
                Ok(outcome) => {
                    debug!(key = %record.natural_key(), ?outcome, "upserted");
                    summary.record(outcome);
                }
                Err(e) => {
                    let attempts = e.attempts();
                    let source = e.into_inner();
                    error!(
                        failed_index = index,
                        key = %record.natural_key(),
                        attempts,
                        persisted = summary.written(),
                        not_persisted = total - index,
                        error = %source,
                        "load aborted"
                    );
                    return Err(LoadFailure {
                        summary,
                        failed_index: index,
                        source,
                    });
                }
            }
        }

        info!(
            collection = self.store.collection(),
            inserted = summary.inserted,
            updated = summary.updated,
            "load complete"
        );
        Ok(summary)
    }
}

fn classify(error: &PersistenceError) -> RetryDecision {
    if error.is_transient() {
        RetryDecision::Retry
    } else {
        RetryDecision::Abort
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
