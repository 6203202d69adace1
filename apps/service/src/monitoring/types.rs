use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kind-specific parameter bag attached to a check definition
pub type Params = Map<String, Value>;

/// Kind-specific diagnostic data attached to an outcome
pub type Details = Map<String, Value>;

/// Health classification of a single check execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Degraded,
    Down,
}

impl Status {
    /// Up and degraded both count as available.
    pub fn is_available(self) -> bool {
        !matches!(self, Status::Down)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Degraded => "degraded",
            Status::Down => "down",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct ParseStatusError(String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Status::Up),
            "degraded" => Ok(Status::Degraded),
            "down" => Ok(Status::Down),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Result of one check execution. Never mutated once handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: Status,
    /// Dispatch-to-response time in milliseconds, when a response arrived
    pub latency_ms: Option<f64>,
    pub details: Details,
}

impl Outcome {
    /// Mark the check as successful with latency
    pub fn up(latency_ms: Option<f64>, details: Details) -> Self {
        Self { status: Status::Up, latency_ms, details }
    }

    /// Mark the check as degraded (slow or partially failing response)
    pub fn degraded(latency_ms: Option<f64>, details: Details) -> Self {
        Self { status: Status::Degraded, latency_ms, details }
    }

    /// Mark the check as failed; the description lands in `details.error`
    pub fn down(error: impl Into<String>) -> Self {
        let mut details = Details::new();
        details.insert("error".into(), Value::String(error.into()));
        Self { status: Status::Down, latency_ms: None, details }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn error(&self) -> Option<&str> {
        self.details.get("error").and_then(Value::as_str)
    }
}

/// One monitoring task as handed to the scheduler for a run generation
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSpec {
    pub check_id: i64,
    pub device_id: i64,
    pub device_name: String,
    /// IP address or DNS name probed by the check
    pub host: String,
    pub site: String,
    pub kind: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub params: Params,
}

/// Result record handed to the result sink once per poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub check_id: i64,
    pub ts: DateTime<Utc>,
    pub status: Status,
    pub latency_ms: Option<f64>,
    pub details: Details,
}

impl CheckRecord {
    pub fn from_outcome(check_id: i64, ts: DateTime<Utc>, outcome: &Outcome) -> Self {
        Self {
            check_id,
            ts,
            status: outcome.status,
            latency_ms: outcome.latency_ms,
            details: outcome.details.clone(),
        }
    }
}

/// Integer parameter that may also be written as a numeric string
pub fn int_param(params: &Params, key: &str) -> Option<i64> {
    match params.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Elapsed time in fractional milliseconds
pub fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [Status::Up, Status::Degraded, Status::Down] {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
        assert!("unknown".parse::<Status>().is_err());
    }

    #[test]
    fn down_outcome_carries_error_without_latency() {
        let outcome = Outcome::down("connection refused");
        assert_eq!(outcome.status, Status::Down);
        assert_eq!(outcome.latency_ms, None);
        assert_eq!(outcome.error(), Some("connection refused"));
    }

    #[test]
    fn int_params_accept_numeric_strings() {
        let serde_json::Value::Object(p) = serde_json::json!({"a": 5, "b": " 7 ", "c": "x", "d": 1.5}) else {
            unreachable!()
        };
        assert_eq!(int_param(&p, "a"), Some(5));
        assert_eq!(int_param(&p, "b"), Some(7));
        assert_eq!(int_param(&p, "c"), None);
        assert_eq!(int_param(&p, "d"), None);
        assert_eq!(int_param(&p, "missing"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Degraded).unwrap(), "\"degraded\"");
    }
}
