/// One ETL run: fetch → normalize → load, plus the run summary.
///
/// The pipeline never panics on a stage failure. Whatever happens, `run`
/// returns a `RunReport` whose summary says how far the run got and which
/// record indices were left behind at which stage.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Stage};
use crate::ingest::open_meteo::OpenMeteoClient;
use crate::load::Loader;
use crate::model::{FetchRequest, RunId, SOURCE_OPEN_METEO};
use crate::store::DocumentStore;
use crate::transform::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Half-open range of record indices, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    /// `None` for an empty range.
    pub fn new(start: usize, end: usize) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Machine-readable outcome of one run, printed as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub run_id: RunId,
    pub source: String,
    pub collection: String,
    pub request: Option<FetchRequest>,
    /// Hourly timestamps in the upstream payload.
    pub fetched: usize,
    pub normalized: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Documents stored for the source after the run, when the store could
    /// be queried.
    pub stored_total: Option<u64>,
    pub failed_stage: Option<Stage>,
    /// Fetched but not normalized.
    pub not_normalized: Option<IndexRange>,
    /// Normalized but not persisted.
    pub not_persisted: Option<IndexRange>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn start(run_id: RunId, collection: &str, request: Option<FetchRequest>) -> Self {
        let now = Utc::now();
        Self {
            status: RunStatus::Succeeded,
            run_id,
            source: SOURCE_OPEN_METEO.to_string(),
            collection: collection.to_string(),
            request,
            fetched: 0,
            normalized: 0,
            inserted: 0,
            updated: 0,
            stored_total: None,
            failed_stage: None,
            not_normalized: None,
            not_persisted: None,
            error: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    /// Marks the run failed at `err`'s stage.
    pub fn fail(&mut self, err: &PipelineError) {
        self.status = RunStatus::Failed;
        self.failed_stage = Some(err.stage());
        self.error = Some(err.report());
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Summary plus the error that ended the run, if any.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub error: Option<PipelineError>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, PipelineError::exit_code)
    }
}

pub struct Pipeline<S> {
    client: OpenMeteoClient,
    loader: Loader<S>,
}

impl<S: DocumentStore> Pipeline<S> {
    pub fn new(client: OpenMeteoClient, loader: Loader<S>) -> Self {
        Self { client, loader }
    }

    /// Executes one run for `request`.
    pub fn run(&mut self, request: &FetchRequest) -> RunReport {
        let clock = Instant::now();
        let mut summary = RunSummary::start(
            self.loader.run_id().clone(),
            self.loader.store().collection(),
            Some(request.clone()),
        );

        info!(
            run_id = %summary.run_id,
            collection = %summary.collection,
            "starting run"
        );

        let error = self.execute(request, &mut summary).err();
        if let Some(err) = &error {
            summary.fail(err);
        }

        match self.loader.store_mut().count(SOURCE_OPEN_METEO) {
            Ok(total) => summary.stored_total = Some(total),
            Err(e) => warn!(error = %e, "could not count stored documents"),
        }

        summary.finish();

        match &error {
            None => info!(
                run_id = %summary.run_id,
                fetched = summary.fetched,
                inserted = summary.inserted,
                updated = summary.updated,
                stored_total = ?summary.stored_total,
                elapsed_ms = clock.elapsed().as_millis() as u64,
                "run succeeded"
            ),
            Some(err) => error!(
                run_id = %summary.run_id,
                stage = ?err.stage(),
                not_normalized = ?summary.not_normalized,
                not_persisted = ?summary.not_persisted,
                error = %err.report(),
                "run failed"
            ),
        }

        RunReport { summary, error }
    }

    fn execute(
        &mut self,
        request: &FetchRequest,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let payload = self.client.fetch(request)?;
        summary.fetched = payload.timestamp_count();

        let records = match normalize(request, &payload) {
            Ok(records) => records,
            Err(e) => {
                summary.not_normalized = IndexRange::new(0, summary.fetched);
                return Err(e.into());
            }
        };
        summary.normalized = records.len();

        match self.loader.load(records) {
            Ok(loaded) => {
                summary.inserted = loaded.inserted;
                summary.updated = loaded.updated;
                Ok(())
            }
            Err(failure) => {
                summary.inserted = failure.summary.inserted;
                summary.updated = failure.summary.updated;
                summary.not_persisted = IndexRange::new(failure.failed_index, summary.normalized);
                Err(failure.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
