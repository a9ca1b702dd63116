/// meteo_etl: Open-Meteo hourly weather → document store ETL.
///
/// # Module structure
///
/// ```text
/// meteo_etl
/// ├── model      - shared data types (FetchRequest, NormalizedRecord, NaturalKey, RunId)
/// ├── error      - error taxonomy per stage, exit codes
/// ├── config     - etl.toml + environment configuration loader
/// ├── retry      - bounded exponential backoff with jitter, used by fetch and load
/// ├── ingest
/// │   ├── open_meteo - Open-Meteo API: URL construction, retrying GET, JSON parsing
/// │   └── fixtures (test only) - representative API response payloads
/// ├── transform  - parallel hourly arrays → one record per timestamp
/// ├── store
/// │   ├── pg     - PostgreSQL JSONB document collection with merge upserts
/// │   └── memory - in-process collection with the same semantics (dry runs)
/// ├── load       - provenance stamping + per-record upserts
/// └── pipeline   - fetch → normalize → load, run summary
/// ```

/// Public modules
pub mod config;
pub mod error;
pub mod ingest;
pub mod load;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod transform;
