/// Shared data types for the Open-Meteo ingestion pipeline.
///
/// Everything that crosses a component boundary lives here: the request a
/// run is parameterized by, the normalized per-hour record, its natural key,
/// and the per-run identifier stamped onto every write.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::RequestError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Source tag stamped on every record produced by this connector.
pub const SOURCE_OPEN_METEO: &str = "open-meteo";

/// Default location: Chennai, India.
pub const DEFAULT_LATITUDE: f64 = 13.0827;
pub const DEFAULT_LONGITUDE: f64 = 80.2707;

/// Hourly variables requested when the caller does not name any.
pub const DEFAULT_METRICS: &[&str] = &["temperature_2m", "relative_humidity_2m"];

/// Length of the trailing window (in days) used when no dates are given.
pub const DEFAULT_WINDOW_DAYS: i64 = 7;

/// Wire format of record timestamps: ISO-8601, minute precision, no offset.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M";

// ---------------------------------------------------------------------------
// FetchRequest
// ---------------------------------------------------------------------------

/// Parameters of a single pipeline run. Validated on construction and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchRequest {
    latitude: f64,
    longitude: f64,
    start: NaiveDate,
    end: NaiveDate,
    metrics: Vec<String>,
}

impl FetchRequest {
    /// Builds a request, enforcing coordinate bounds, `start <= end`, and a
    /// non-empty metric list. Duplicate metric names are dropped, keeping the
    /// first occurrence so the caller's ordering survives.
    pub fn new<I, S>(
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
        metrics: I,
    ) -> Result<Self, RequestError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(RequestError::LatitudeOutOfRange(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(RequestError::LongitudeOutOfRange(longitude));
        }
        if start > end {
            return Err(RequestError::InvertedDateRange { start, end });
        }

        let mut names: Vec<String> = Vec::new();
        for raw in metrics {
            let name = raw.as_ref().trim();
            if !is_valid_metric_name(name) {
                return Err(RequestError::InvalidMetricName(name.to_string()));
            }
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        if names.is_empty() {
            return Err(RequestError::NoMetrics);
        }

        Ok(Self {
            latitude,
            longitude,
            start,
            end,
            metrics: names,
        })
    }

    /// Request for the trailing `window_days` ending on `today` (inclusive).
    pub fn trailing_window<I, S>(
        latitude: f64,
        longitude: f64,
        today: NaiveDate,
        window_days: i64,
        metrics: I,
    ) -> Result<Self, RequestError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let start = chrono::Duration::try_days(window_days.max(0))
            .and_then(|window| today.checked_sub_signed(window))
            .ok_or(RequestError::WindowTooLarge(window_days))?;
        Self::new(latitude, longitude, start, today, metrics)
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }
}

/// Metric names travel into URLs and JSON keys, so only `[A-Za-z0-9_]` is
/// accepted.
fn is_valid_metric_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits a comma-separated metric list (`"temperature_2m, rain"`), ignoring
/// empty entries.
pub fn parse_metric_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Normalized records
// ---------------------------------------------------------------------------

/// One hourly observation, flattened out of the upstream's parallel arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    /// Requested metric name → value at this hour. `None` means "no reading".
    pub metrics: BTreeMap<String, Option<f64>>,
    /// Set by the loader immediately before the upsert.
    pub ingested_at: Option<DateTime<Utc>>,
    /// Set by the loader; audit grouping only, never part of identity.
    pub run_id: Option<String>,
}

impl NormalizedRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.source, self.latitude, self.longitude, self.timestamp)
    }

    /// Timestamp rendered the way it is stored (`2025-08-01T13:00`).
    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Identity of a record in the destination collection:
/// `(source, latitude, longitude, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub source: String,
    pub latitude: OrderedFloat<f64>,
    pub longitude: OrderedFloat<f64>,
    pub timestamp: NaiveDateTime,
}

impl NaturalKey {
    pub fn new(source: &str, latitude: f64, longitude: f64, timestamp: NaiveDateTime) -> Self {
        Self {
            source: source.to_string(),
            latitude: OrderedFloat(latitude),
            longitude: OrderedFloat(longitude),
            timestamp,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@({}, {})/{}",
            self.source,
            self.latitude,
            self.longitude,
            self.timestamp.format(TIMESTAMP_FORMAT)
        )
    }
}

/// Parses an upstream hourly timestamp. Open-Meteo sends minute precision
/// (`2025-08-01T13:00`); an explicit `:00` seconds field is tolerated, any
/// other seconds value is rejected since it could not be stored as written.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .filter(|ts| ts.second() == 0)
}

mod timestamp_format {
    use super::{TIMESTAMP_FORMAT, parse_timestamp};
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).ok_or_else(|| de::Error::custom(format!("bad timestamp '{}'", raw)))
    }
}

// ---------------------------------------------------------------------------
// Run identifier
// ---------------------------------------------------------------------------

/// Opaque per-execution identifier, e.g. `run_20250801T061500Z_9f3a2c1d`.
///
/// The UTC prefix keeps runs sortable in the collection; the random suffix
/// keeps two runs started in the same second apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!("run_{}_{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
