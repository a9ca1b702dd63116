/// Normalizer: flattens Open-Meteo's parallel hourly arrays into one
/// `NormalizedRecord` per timestamp.
///
/// All shape checks run before the first record is built, so a payload either
/// normalizes completely or not at all.

use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::ValidationError;
use crate::ingest::open_meteo::RawPayload;
use crate::model::{FetchRequest, NormalizedRecord, SOURCE_OPEN_METEO, parse_timestamp};

/// Validates `payload` against `request` and flattens it.
///
/// - `hourly.time` must be present, non-empty, parseable, strictly increasing.
/// - A requested metric whose array length differs from `time` is rejected.
/// - A requested metric missing from the payload altogether is emitted as
///   null at every timestamp (logged at WARN).
/// - Output order is upstream order. Coordinates and source come from the
///   request, not from the upstream's snapped grid point.
pub fn normalize(
    request: &FetchRequest,
    payload: &RawPayload,
) -> Result<Vec<NormalizedRecord>, ValidationError> {
    let hourly = payload.hourly.as_ref().ok_or(ValidationError::MissingHourly)?;
    let times = hourly.time.as_ref().ok_or(ValidationError::MissingTimestamps)?;
    if times.is_empty() {
        return Err(ValidationError::EmptyTimestamps);
    }

    let mut timestamps = Vec::with_capacity(times.len());
    for (index, raw) in times.iter().enumerate() {
        let ts = parse_timestamp(raw).ok_or_else(|| ValidationError::BadTimestamp {
            index,
            value: raw.clone(),
        })?;
        if timestamps.last().is_some_and(|prev| ts <= *prev) {
            return Err(ValidationError::NonIncreasingTimestamp {
                index,
                value: raw.clone(),
            });
        }
        timestamps.push(ts);
    }

    let mut columns: Vec<(&str, Option<&Vec<Option<f64>>>)> = Vec::new();
    for metric in request.metrics() {
        match hourly.values.get(metric) {
            Some(values) if values.len() != times.len() => {
                return Err(ValidationError::LengthMismatch {
                    metric: metric.clone(),
                    expected: times.len(),
                    found: values.len(),
                });
            }
            Some(values) => columns.push((metric.as_str(), Some(values))),
            None => {
                warn!(metric = %metric, "requested metric missing in response; filling with null");
                columns.push((metric.as_str(), None));
            }
        }
    }

    let records: Vec<NormalizedRecord> = timestamps
        .into_iter()
        .enumerate()
        .map(|(i, timestamp)| {
            let metrics: BTreeMap<String, Option<f64>> = columns
                .iter()
                .map(|(name, values)| (name.to_string(), values.and_then(|v| v[i])))
                .collect();

            NormalizedRecord {
                source: SOURCE_OPEN_METEO.to_string(),
                latitude: request.latitude(),
                longitude: request.longitude(),
                timestamp,
                metrics,
                ingested_at: None,
                run_id: None,
            }
        })
        .collect();

    info!(records = records.len(), "transformed hourly records");
    Ok(records)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
