//! Shared helpers for integration tests: a scripted mock of the Open-Meteo
//! endpoint and payload builders.
//!
//! The mock answers requests in order from a script; once the script is used
//! up, the last entry repeats. Every request's URL and Authorization header
//! is recorded so tests can count attempts and inspect what was sent.

#![allow(dead_code)]

use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use meteo_etl::config::UpstreamConfig;
use meteo_etl::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Scripted {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl Scripted {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub authorization: Option<String>,
}

pub struct MockUpstream {
    server: Arc<tiny_http::Server>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    base_url: String,
}

impl MockUpstream {
    pub fn start(script: Vec<Scripted>) -> Self {
        assert!(!script.is_empty(), "script needs at least one response");

        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").expect("bind mock upstream"));
        let addr = server.server_addr().to_ip().expect("mock upstream listens on TCP");
        let recorded = Arc::new(Mutex::new(Vec::new()));

        let worker_server = Arc::clone(&server);
        let worker_recorded = Arc::clone(&recorded);
        thread::spawn(move || {
            for (index, request) in worker_server.incoming_requests().enumerate() {
                let authorization = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_string());
                worker_recorded.lock().unwrap().push(RecordedRequest {
                    url: request.url().to_string(),
                    authorization,
                });

                let entry = &script[index.min(script.len() - 1)];
                let mut response = tiny_http::Response::from_string(entry.body.clone())
                    .with_status_code(tiny_http::StatusCode(entry.status));
                for (name, value) in &entry.headers {
                    let header = tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes())
                        .expect("valid header");
                    response = response.with_header(header);
                }
                let _ = request.respond(response);
            }
        });

        Self {
            server,
            recorded,
            base_url: format!("http://{}/v1/forecast", addr),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.recorded.lock().unwrap().len()
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.base_url.clone(),
            timeout_secs: 5,
            ..UpstreamConfig::default()
        }
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

/// Retry policy with millisecond delays so tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: Duration::ZERO,
        max_retry_after: Duration::from_millis(50),
    }
}

/// Open-Meteo style payload for Chennai on 2025-08-01: 24 hourly entries.
pub fn chennai_payload(metrics: &[&str]) -> Value {
    let time: Vec<String> = (0..24).map(|h| format!("2025-08-01T{:02}:00", h)).collect();

    let mut hourly = serde_json::Map::new();
    hourly.insert("time".to_string(), json!(time));
    for (offset, metric) in metrics.iter().enumerate() {
        let values: Vec<f64> = (0..24)
            .map(|h| 26.0 + offset as f64 * 40.0 + (h as f64 / 3.0).round())
            .collect();
        hourly.insert(metric.to_string(), json!(values));
    }

    json!({
        "latitude": 13.125,
        "longitude": 80.25,
        "utc_offset_seconds": 19800,
        "timezone": "Asia/Kolkata",
        "hourly": hourly
    })
}

/// Same envelope, but `temperature_2m` is one value short of `time`.
pub fn short_series_payload() -> Value {
    json!({
        "latitude": 13.125,
        "longitude": 80.25,
        "hourly": {
            "time": ["2025-08-01T00:00", "2025-08-01T01:00", "2025-08-01T02:00"],
            "temperature_2m": [28.4, 28.1]
        }
    })
}
