/// Test fixtures: representative JSON payloads from the Open-Meteo API.
///
/// These fixtures mirror the real response envelope returned by:
///   https://api.open-meteo.com/v1/forecast?latitude=..&hourly=..
///
/// Open-Meteo response shape:
///   latitude, longitude          - grid point actually used (snapped)
///   timezone, utc_offset_seconds - local time zone when `timezone=auto`
///   hourly_units.{var}           - unit per variable (ignored by the pipeline)
///   hourly.time[]                - local timestamps, `YYYY-MM-DDTHH:MM`
///   hourly.{var}[]               - numbers or null, parallel to `time`

use serde_json::{Value, json};

/// Hourly temperature for the Chennai fixture day: a smooth diurnal cycle.
pub(crate) fn chennai_temperature(hour: usize) -> f64 {
    let cycle = [
        27.9, 27.6, 27.3, 27.1, 26.9, 26.8, 27.2, 28.3, 29.6, 30.9, 32.0, 32.8, 33.4, 33.7, 33.5,
        33.0, 32.2, 31.1, 30.2, 29.5, 29.0, 28.7, 28.4, 28.1,
    ];
    cycle[hour % cycle.len()]
}

/// Chennai (13.0827, 80.2707) on 2025-08-01: 24 hourly entries for
/// `temperature_2m` and `relative_humidity_2m`.
pub(crate) fn chennai_day_payload() -> Value {
    let time: Vec<String> = (0..24).map(|h| format!("2025-08-01T{:02}:00", h)).collect();
    let temperature: Vec<f64> = (0..24).map(chennai_temperature).collect();
    let humidity: Vec<u32> = (0..24).map(|h| 60 + (h as u32 * 7) % 25).collect();

    json!({
        "latitude": 13.125,
        "longitude": 80.25,
        "generationtime_ms": 0.0510215759277344,
        "utc_offset_seconds": 19800,
        "timezone": "Asia/Kolkata",
        "timezone_abbreviation": "GMT+5:30",
        "elevation": 8.0,
        "hourly_units": {
            "time": "iso8601",
            "temperature_2m": "°C",
            "relative_humidity_2m": "%"
        },
        "hourly": {
            "time": time,
            "temperature_2m": temperature,
            "relative_humidity_2m": humidity
        }
    })
}

pub(crate) fn fixture_chennai_day_json() -> String {
    chennai_day_payload().to_string()
}

/// Three hours with a missing reading in the middle.
pub(crate) fn fixture_with_nulls_json() -> &'static str {
    r#"{
      "latitude": 13.125,
      "longitude": 80.25,
      "timezone": "Asia/Kolkata",
      "hourly_units": { "time": "iso8601", "temperature_2m": "°C" },
      "hourly": {
        "time": ["2025-08-01T00:00", "2025-08-01T01:00", "2025-08-01T02:00"],
        "temperature_2m": [28.4, null, 27.9]
      }
    }"#
}

/// `temperature_2m` has one value fewer than `time` - a shape violation.
pub(crate) fn fixture_short_series_json() -> &'static str {
    r#"{
      "latitude": 13.125,
      "longitude": 80.25,
      "hourly": {
        "time": ["2025-08-01T00:00", "2025-08-01T01:00", "2025-08-01T02:00"],
        "temperature_2m": [28.4, 28.1]
      }
    }"#
}

/// `rain` was requested but the upstream left it out entirely.
pub(crate) fn fixture_missing_metric_json() -> &'static str {
    r#"{
      "hourly": {
        "time": ["2025-08-01T00:00", "2025-08-01T01:00"],
        "temperature_2m": [28.4, 28.1]
      }
    }"#
}

/// `hourly` present but `time` empty.
pub(crate) fn fixture_empty_time_json() -> &'static str {
    r#"{ "hourly": { "time": [], "temperature_2m": [] } }"#
}
