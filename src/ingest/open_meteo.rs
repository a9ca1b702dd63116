/// Open-Meteo hourly forecast/archive API client.
///
/// Handles URL construction, the retrying GET, and JSON deserialization for
/// the forecast endpoint:
///   https://api.open-meteo.com/v1/forecast
///
/// The response carries hourly data as parallel arrays: one `time` array and
/// one array per requested variable. See `fixtures.rs` for annotated examples.
/// This module only checks that the body is the JSON document we expect; the
/// shape invariants (array lengths etc.) belong to `transform`.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::UpstreamConfig;
use crate::error::FetchError;
use crate::model::FetchRequest;
use crate::retry::{RetryDecision, RetryError, RetryPolicy};

/// HTTP statuses treated as transient.
pub const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Longest slice of an error body kept in logs and error messages.
const ERROR_BODY_PREVIEW: usize = 500;

// ---------------------------------------------------------------------------
// Serde structures for the forecast response
// ---------------------------------------------------------------------------

/// The subset of the forecast response the pipeline uses.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawPayload {
    /// Grid point the upstream actually used (may differ from the request).
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    #[serde(default)]
    pub hourly: Option<HourlySeries>,
}

/// `hourly` block: a `time` array plus one value array per variable.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct HourlySeries {
    #[serde(default)]
    pub time: Option<Vec<String>>,
    #[serde(flatten)]
    pub values: BTreeMap<String, Vec<Option<f64>>>,
}

impl RawPayload {
    /// Number of hourly timestamps in the payload (0 when absent).
    pub fn timestamp_count(&self) -> usize {
        self.hourly
            .as_ref()
            .and_then(|h| h.time.as_ref())
            .map_or(0, Vec::len)
    }
}

/// Parses a response body. Anything that is not the expected JSON object is
/// a `MalformedResponse`.
pub fn parse_forecast_response(body: &str) -> Result<RawPayload, FetchError> {
    serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("JSON deserialization failed: {}", e)))
}

// ---------------------------------------------------------------------------
// URL construction
// ---------------------------------------------------------------------------

/// Builds the forecast URL for a request: coordinates, comma-separated
/// hourly variables, inclusive `start_date`/`end_date`, and the timezone.
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use meteo_etl::ingest::open_meteo::build_forecast_url;
/// use meteo_etl::model::FetchRequest;
///
/// let day = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
/// let request = FetchRequest::new(13.0827, 80.2707, day, day, ["temperature_2m"]).unwrap();
/// let url = build_forecast_url("https://api.open-meteo.com/v1/forecast", &request, "auto");
/// assert!(url.contains("start_date=2025-08-01"));
/// ```
pub fn build_forecast_url(base_url: &str, request: &FetchRequest, timezone: &str) -> String {
    format!(
        "{}?latitude={}&longitude={}&hourly={}&start_date={}&end_date={}&timezone={}",
        base_url,
        request.latitude(),
        request.longitude(),
        urlencoding::encode(&request.metrics().join(",")),
        request.start().format("%Y-%m-%d"),
        request.end().format("%Y-%m-%d"),
        urlencoding::encode(timezone)
    )
}

// ---------------------------------------------------------------------------
// Retry classification
// ---------------------------------------------------------------------------

/// Failure of a single HTTP attempt, before retry classification.
#[derive(Debug)]
enum AttemptError {
    Status {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    Transport(reqwest::Error),
    Malformed(String),
}

impl AttemptError {
    fn decision(&self) -> RetryDecision {
        match self {
            AttemptError::Status {
                status,
                retry_after,
                ..
            } if RETRYABLE_STATUSES.contains(&status.as_u16()) => match retry_after {
                Some(delay) => RetryDecision::RetryAfter(*delay),
                None => RetryDecision::Retry,
            },
            AttemptError::Transport(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                RetryDecision::Retry
            }
            _ => RetryDecision::Abort,
        }
    }
}

/// Reads a `Retry-After` header given either as delta-seconds or as an
/// HTTP-date. Dates in the past yield a zero delay.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn preview(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_PREVIEW) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Fetches hourly observations from Open-Meteo with bounded retry.
pub struct OpenMeteoClient {
    http: Client,
    config: UpstreamConfig,
    retry: RetryPolicy,
}

impl OpenMeteoClient {
    pub fn new(config: UpstreamConfig, retry: RetryPolicy) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            http,
            config,
            retry,
        })
    }

    /// Fetches the hourly payload for `request`.
    ///
    /// # Errors
    /// - `FetchError::Upstream { exhausted: true, .. }` - retryable failures
    ///   (429/5xx/transport) on every attempt.
    /// - `FetchError::Upstream { exhausted: false, .. }` - any other non-2xx,
    ///   returned after the first attempt.
    /// - `FetchError::MalformedResponse` - 2xx with an unparseable body.
    #[instrument(skip_all, fields(lat = request.latitude(), lon = request.longitude()))]
    pub fn fetch(&self, request: &FetchRequest) -> Result<RawPayload, FetchError> {
        let url = build_forecast_url(&self.config.base_url, request, &self.config.timezone);
        info!(
            %url,
            start = %request.start(),
            end = %request.end(),
            metrics = %request.metrics().join(","),
            "extracting from Open-Meteo"
        );

        let result = self.retry.run(
            |attempt| {
                debug!(attempt, "sending request");
                self.attempt(&url)
            },
            AttemptError::decision,
        );

        match result {
            Ok(payload) => {
                debug!(
                    grid_lat = ?payload.latitude,
                    grid_lon = ?payload.longitude,
                    timezone = ?payload.timezone,
                    timestamps = payload.timestamp_count(),
                    "received payload"
                );
                Ok(payload)
            }
            Err(err) => {
                let fetch_error = into_fetch_error(err);
                error!(error = %fetch_error, "fetch failed");
                Err(fetch_error)
            }
        }
    }

    fn attempt(&self, url: &str) -> Result<RawPayload, AttemptError> {
        let mut builder = self.http.get(url).header(ACCEPT, "application/json");
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().map_err(AttemptError::Transport)?;
        let status = response.status();

        if !status.is_success() {
            return Err(status_error(response));
        }

        let body = response.text().map_err(AttemptError::Transport)?;
        parse_forecast_response(&body).map_err(|e| match e {
            FetchError::MalformedResponse(msg) => AttemptError::Malformed(msg),
            other => AttemptError::Malformed(other.to_string()),
        })
    }
}

fn status_error(response: Response) -> AttemptError {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers(), Utc::now());
    let body = response.text().unwrap_or_default();

    warn!(
        status = status.as_u16(),
        body = preview(&body),
        "upstream returned an error status"
    );

    AttemptError::Status {
        status,
        body,
        retry_after,
    }
}

fn into_fetch_error(err: RetryError<AttemptError>) -> FetchError {
    let exhausted = err.is_exhausted();
    let attempts = err.attempts();

    match err.into_inner() {
        AttemptError::Malformed(msg) => FetchError::MalformedResponse(msg),
        AttemptError::Status { status, body, .. } => FetchError::Upstream {
            status: Some(status.as_u16()),
            message: match preview(&body) {
                "" => status.canonical_reason().unwrap_or("error status").to_string(),
                text => text.to_string(),
            },
            attempts,
            exhausted,
        },
        AttemptError::Transport(e) => FetchError::Upstream {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
            attempts,
            exhausted,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
