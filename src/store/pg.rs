/// PostgreSQL-backed document store.
///
/// Each collection is a table holding the natural-key columns plus a JSONB
/// `metrics` document:
///
/// ```text
/// source TEXT | latitude FLOAT8 | longitude FLOAT8 | "timestamp" TIMESTAMP
///   | metrics JSONB | ingested_at TIMESTAMPTZ | ingestion_run_id TEXT
/// ```
///
/// with a unique index `<collection>_uniq_source_lat_lon_ts` on the first
/// four columns. Upserts use `INSERT .. ON CONFLICT DO UPDATE`, so two runs
/// over overlapping ranges never need external locking.
///
/// The connection lives as long as the store; dropping it closes the session.

use chrono::{DateTime, NaiveDateTime, Utc};
use postgres::error::SqlState;
use postgres::{Client, Config, NoTls, Statement};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{DocumentStore, UpsertOutcome};
use crate::config::{StoreConfig, is_valid_collection_name};
use crate::error::PersistenceError;
use crate::model::{NaturalKey, NormalizedRecord};

pub struct PostgresStore {
    client: Client,
    collection: String,
    upsert_stmt: Option<Statement>,
}

impl PostgresStore {
    /// Connects to `database_url` with the configured connect timeout and
    /// applies the per-session statement timeout.
    pub fn connect(database_url: &str, config: &StoreConfig) -> Result<Self, PersistenceError> {
        if !is_valid_collection_name(&config.collection) {
            return Err(PersistenceError::InvalidCollection(config.collection.clone()));
        }

        let mut pg_config = Config::from_str(database_url).map_err(PersistenceError::Connect)?;
        pg_config
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .application_name("meteo_etl");

        let mut client = pg_config.connect(NoTls).map_err(PersistenceError::Connect)?;

        let timeout_ms = config.statement_timeout_secs.saturating_mul(1_000);
        client
            .batch_execute(&format!("SET statement_timeout = {}", timeout_ms))
            .map_err(PersistenceError::Connect)?;

        info!(collection = %config.collection, "connected to document store");

        Ok(Self {
            client,
            collection: config.collection.clone(),
            upsert_stmt: None,
        })
    }

    fn index_name(&self) -> String {
        format!("{}_uniq_source_lat_lon_ts", self.collection)
    }

    fn query_error(&self, source: postgres::Error) -> PersistenceError {
        PersistenceError::Query {
            collection: self.collection.clone(),
            source,
        }
    }

    fn upsert_statement(&mut self) -> Result<Statement, postgres::Error> {
        if let Some(stmt) = &self.upsert_stmt {
            return Ok(stmt.clone());
        }

        // xmax = 0 only for rows created by this statement
        let sql = format!(
            "INSERT INTO {c} AS doc \
             (source, latitude, longitude, \"timestamp\", metrics, ingested_at, ingestion_run_id) \
             VALUES ($1, $2, $3, $4, $5, COALESCE($6, now()), $7) \
             ON CONFLICT (source, latitude, longitude, \"timestamp\") DO UPDATE SET \
                metrics = (EXCLUDED.metrics || doc.metrics) || jsonb_strip_nulls(EXCLUDED.metrics), \
                ingested_at = EXCLUDED.ingested_at, \
                ingestion_run_id = EXCLUDED.ingestion_run_id \
             RETURNING (xmax = 0) AS inserted",
            c = self.collection
        );
        let stmt = self.client.prepare(&sql)?;
        self.upsert_stmt = Some(stmt.clone());
        Ok(stmt)
    }
}

impl DocumentStore for PostgresStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn ensure_unique_index(&mut self) -> Result<(), PersistenceError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {c} (
                source            TEXT NOT NULL,
                latitude          DOUBLE PRECISION NOT NULL,
                longitude         DOUBLE PRECISION NOT NULL,
                \"timestamp\"       TIMESTAMP NOT NULL,
                metrics           JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                ingested_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
                ingestion_run_id  TEXT
             );
             CREATE UNIQUE INDEX IF NOT EXISTS {idx}
                ON {c} (source, latitude, longitude, \"timestamp\");",
            c = self.collection,
            idx = self.index_name()
        );

        let collection = self.collection.clone();
        let setup_error = |source: postgres::Error| {
            match contention(&collection, "collection setup", &source, true) {
                Some(err) => err,
                None => PersistenceError::EnsureIndex {
                    collection: collection.clone(),
                    source,
                },
            }
        };

        // first runs racing on a new collection take turns
        let mut tx = self.client.transaction().map_err(setup_error)?;
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&collection])
            .map_err(setup_error)?;
        tx.batch_execute(&sql).map_err(setup_error)?;
        tx.commit().map_err(setup_error)?;

        debug!(collection = %self.collection, index = %self.index_name(), "unique index ensured");
        Ok(())
    }

    fn upsert(&mut self, record: &NormalizedRecord) -> Result<UpsertOutcome, PersistenceError> {
        let upsert_error = |collection: &str, source: postgres::Error| {
            match contention(collection, "upsert", &source, false) {
                Some(err) => err,
                None => PersistenceError::Upsert {
                    collection: collection.to_string(),
                    key: record.natural_key().to_string(),
                    source,
                },
            }
        };

        let stmt = self
            .upsert_statement()
            .map_err(|e| upsert_error(&self.collection, e))?;

        let metrics = serde_json::to_value(&record.metrics).map_err(|e| {
            PersistenceError::CorruptDocument {
                key: record.natural_key().to_string(),
                reason: e.to_string(),
            }
        })?;

        let row = self
            .client
            .query_one(
                &stmt,
                &[
                    &record.source,
                    &record.latitude,
                    &record.longitude,
                    &record.timestamp,
                    &metrics,
                    &record.ingested_at,
                    &record.run_id,
                ],
            )
            .map_err(|e| upsert_error(&self.collection, e))?;

        let inserted: bool = row.get("inserted");
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    fn find(&mut self, key: &NaturalKey) -> Result<Option<NormalizedRecord>, PersistenceError> {
        let sql = format!(
            "SELECT source, latitude, longitude, \"timestamp\", metrics, ingested_at, ingestion_run_id \
             FROM {} \
             WHERE source = $1 AND latitude = $2 AND longitude = $3 AND \"timestamp\" = $4",
            self.collection
        );

        let rows = self
            .client
            .query(
                &sql,
                &[&key.source, &key.latitude.0, &key.longitude.0, &key.timestamp],
            )
            .map_err(|e| self.query_error(e))?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let metrics_json: serde_json::Value = row.get("metrics");
        let metrics: BTreeMap<String, Option<f64>> = serde_json::from_value(metrics_json)
            .map_err(|e| PersistenceError::CorruptDocument {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let timestamp: NaiveDateTime = row.get("timestamp");
        let ingested_at: DateTime<Utc> = row.get("ingested_at");

        Ok(Some(NormalizedRecord {
            source: row.get("source"),
            latitude: row.get("latitude"),
            longitude: row.get("longitude"),
            timestamp,
            metrics,
            ingested_at: Some(ingested_at),
            run_id: row.get("ingestion_run_id"),
        }))
    }

    fn count(&mut self, source: &str) -> Result<u64, PersistenceError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE source = $1", self.collection);
        let row = self
            .client
            .query_one(&sql, &[&source])
            .map_err(|e| self.query_error(e))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }
}

/// SQLSTATEs meaning a concurrent run got there first. During setup that
/// includes both runs creating the same table or index at once.
fn is_contention(code: &SqlState, during_setup: bool) -> bool {
    code == &SqlState::T_R_SERIALIZATION_FAILURE
        || code == &SqlState::T_R_DEADLOCK_DETECTED
        || (during_setup
            && (code == &SqlState::UNIQUE_VIOLATION || code == &SqlState::DUPLICATE_TABLE))
}

fn contention(
    collection: &str,
    operation: &'static str,
    err: &postgres::Error,
    during_setup: bool,
) -> Option<PersistenceError> {
    if err.is_closed() {
        return None;
    }
    let code = err.code()?;
    is_contention(code, during_setup).then(|| PersistenceError::Contention {
        collection: collection.to_string(),
        operation,
        reason: err.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
