use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::monitoring::types::{CheckSpec, Params};

pub const DEFAULT_SITE: &str = "default";
pub const DEFAULT_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 2.0;

/// Device model - a host that owns one or more checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Option<i64>,
    pub name: String,
    /// IP address or DNS name
    pub host: String,
    pub site: String,
    /// Comma-separated free-form labels
    pub tags: String,
    pub enabled: bool,
}

impl Device {
    /// Create a new enabled device on the default site
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            host: host.into(),
            site: DEFAULT_SITE.to_string(),
            tags: String::new(),
            enabled: true,
        }
    }
}

/// Check model - one monitoring task configured on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: Option<i64>,
    pub device_id: i64,
    pub kind: String,
    pub interval_seconds: u64,
    pub timeout_seconds: f64,
    pub params: Params,
}

impl Check {
    /// Create a new check with default cadence
    pub fn new(device_id: i64, kind: impl Into<String>) -> Self {
        Self {
            id: None,
            device_id,
            kind: kind.into(),
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            params: Params::new(),
        }
    }

    /// Build the scheduler view of this check. `None` until both rows are persisted.
    pub fn spec(&self, device: &Device) -> Option<CheckSpec> {
        Some(CheckSpec {
            check_id: self.id?,
            device_id: device.id?,
            device_name: device.name.clone(),
            host: device.host.clone(),
            site: device.site.clone(),
            kind: self.kind.clone(),
            interval: Duration::from_secs(self.interval_seconds.max(1)),
            timeout: seconds_to_duration(self.timeout_seconds),
            params: self.params.clone(),
        })
    }
}

/// Negative, NaN or absurd timeouts fall back to the default.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_TIMEOUT_SECONDS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    Open,
    Closed,
}

impl IncidentState {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentState::Open => "open",
            IncidentState::Closed => "closed",
        }
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IncidentState::Open),
            "closed" => Ok(IncidentState::Closed),
            other => Err(anyhow::anyhow!("unknown incident state '{other}'")),
        }
    }
}

/// Incident model - one continuous unhealthy period of a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub device_id: i64,
    pub check_id: i64,
    pub state: IncidentState,
    pub opened_ts: DateTime<Utc>,
    pub closed_ts: Option<DateTime<Utc>>,
    pub open_reason: String,
    pub close_reason: Option<String>,
    /// Threshold values that triggered the open and close transitions
    pub meta: Map<String, serde_json::Value>,
}

/// Which incidents a listing should return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum IncidentFilter {
    #[default]
    Open,
    Closed,
    All,
}

impl IncidentFilter {
    pub fn matches(self, state: IncidentState) -> bool {
        match self {
            IncidentFilter::Open => state == IncidentState::Open,
            IncidentFilter::Closed => state == IncidentState::Closed,
            IncidentFilter::All => true,
        }
    }
}

/// Convert a timestamp to unix milliseconds for storage
pub fn timestamp_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert stored unix milliseconds back to a timestamp
pub fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
