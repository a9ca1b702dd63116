//! Open-Meteo ETL - single-run command line entry point.
//!
//! Fetches hourly weather for one coordinate and date range, flattens it into
//! one record per hour, and upserts the records into the document store.
//! Re-running over the same range is safe: documents are keyed by
//! (source, latitude, longitude, timestamp) and merged, never duplicated.
//!
//! Usage:
//!   meteo_etl                                        # Chennai, trailing 7 days
//!   meteo_etl --lat 51.5 --lon -0.12 --start 2025-08-01 --end 2025-08-02
//!   meteo_etl --hourly temperature_2m,rain --dry-run # in-memory store
//!
//! Environment:
//!   DATABASE_URL      - PostgreSQL connection string (required unless --dry-run)
//!   COLLECTION_NAME   - destination collection (default open_meteo_raw)
//!   UPSTREAM_BASE_URL - override the forecast endpoint
//!   UPSTREAM_API_KEY  - optional bearer credential
//!   RUST_LOG / LOG_LEVEL - log filter (default info)
//!
//! Logs go to stderr; stdout carries only the JSON run summary.

use chrono::{NaiveDate, Utc};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use meteo_etl::config::{DefaultsConfig, EtlConfig, StoreConfig};
use meteo_etl::error::{PipelineError, RequestError};
use meteo_etl::ingest::open_meteo::OpenMeteoClient;
use meteo_etl::load::Loader;
use meteo_etl::model::{FetchRequest, RunId, parse_metric_list};
use meteo_etl::pipeline::{Pipeline, RunSummary};
use meteo_etl::retry::RetryPolicy;
use meteo_etl::store::{DocumentStore, MemoryStore, PostgresStore};

/// Open-Meteo hourly weather → document store ETL
#[derive(Parser, Debug)]
#[command(name = "meteo_etl", version)]
#[command(about = "Fetch hourly weather from Open-Meteo and upsert it into a document store")]
struct Args {
    /// Latitude in decimal degrees [-90, 90]
    #[arg(long, allow_hyphen_values = true)]
    lat: Option<f64>,

    /// Longitude in decimal degrees [-180, 180]
    #[arg(long, allow_hyphen_values = true)]
    lon: Option<f64>,

    /// First day of the range (YYYY-MM-DD, inclusive)
    #[arg(long)]
    start: Option<String>,

    /// Last day of the range (YYYY-MM-DD, inclusive)
    #[arg(long)]
    end: Option<String>,

    /// Comma-separated hourly metrics, e.g. temperature_2m,relative_humidity_2m
    #[arg(long)]
    hourly: Option<String>,

    /// Configuration file (default: ./etl.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Load into an in-memory store instead of PostgreSQL
    #[arg(long)]
    dry_run: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    std::process::exit(run(&args));
}

/// Runs the ETL once and returns the process exit code.
fn run(args: &Args) -> i32 {
    let run_id = RunId::new();

    let config = match EtlConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let collection = StoreConfig::default().collection;
            return abort(RunSummary::start(run_id, &collection, None), e.into());
        }
    };
    let collection = config.store.collection.clone();

    let request = match build_request(args, &config.defaults, Utc::now().date_naive()) {
        Ok(request) => request,
        Err(e) => return abort(RunSummary::start(run_id, &collection, None), e.into()),
    };
    let summary = || RunSummary::start(run_id.clone(), &collection, Some(request.clone()));

    let retry = RetryPolicy::from(&config.retry);
    let client = match OpenMeteoClient::new(config.upstream.clone(), retry.clone()) {
        Ok(client) => client,
        Err(e) => return abort(summary(), e.into()),
    };

    if args.dry_run {
        info!(%collection, "dry run: loading into an in-memory store");
        let loader = Loader::new(MemoryStore::new(&collection), retry, run_id.clone());
        return execute(Pipeline::new(client, loader), &request);
    }

    let database_url = match config.store.database_url() {
        Ok(url) => url,
        Err(e) => return abort(summary(), e.into()),
    };
    let store = match PostgresStore::connect(database_url, &config.store) {
        Ok(store) => store,
        Err(e) => return abort(summary(), e.into()),
    };

    let loader = Loader::new(store, retry, run_id.clone());
    execute(Pipeline::new(client, loader), &request)
}

fn execute<S: DocumentStore>(mut pipeline: Pipeline<S>, request: &FetchRequest) -> i32 {
    let report = pipeline.run(request);
    print_summary(&report.summary);
    report.exit_code()
}

/// Reports a failure that happened before the pipeline could start.
fn abort(mut summary: RunSummary, err: PipelineError) -> i32 {
    error!(stage = ?err.stage(), error = %err.report(), "run aborted during setup");
    summary.fail(&err);
    summary.finish();
    print_summary(&summary);
    err.exit_code()
}

fn print_summary(summary: &RunSummary) {
    match serde_json::to_string_pretty(summary) {
        Ok(json) => println!("{}", json),
        Err(e) => error!(error = %e, "failed to serialize run summary"),
    }
}

/// Resolves CLI arguments against configured defaults.
///
/// Without `--start`/`--end` the range is the trailing `window_days` ending
/// `today`. A lone `--end` gets a start `window_days` before it; a lone
/// `--start` runs through `today`.
fn build_request(
    args: &Args,
    defaults: &DefaultsConfig,
    today: NaiveDate,
) -> Result<FetchRequest, RequestError> {
    let latitude = args.lat.unwrap_or(defaults.latitude);
    let longitude = args.lon.unwrap_or(defaults.longitude);
    let metrics = match &args.hourly {
        Some(list) => parse_metric_list(list),
        None => defaults.metrics.clone(),
    };

    let end = args.end.as_deref().map(parse_date).transpose()?;
    let start = args.start.as_deref().map(parse_date).transpose()?;

    match (start, end) {
        (None, None) => {
            FetchRequest::trailing_window(latitude, longitude, today, defaults.window_days, metrics)
        }
        (None, Some(end)) => {
            FetchRequest::trailing_window(latitude, longitude, end, defaults.window_days, metrics)
        }
        (Some(start), end) => {
            FetchRequest::new(latitude, longitude, start, end.unwrap_or(today), metrics)
        }
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, RequestError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| RequestError::InvalidDate(raw.to_string()))
}
