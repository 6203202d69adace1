pub mod hub;

pub use hub::{EventHub, Subscription, SubscriberId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitoring::streak::StreakState;
use crate::monitoring::types::{CheckSpec, Details, Outcome, Status};

/// Events published by the scheduler and fanned out by the hub.
///
/// Every event serializes to a JSON object with a `type` discriminator:
/// `result`, `incident_opened`, `incident_closed` or `scheduler_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Result(ResultEvent),
    IncidentOpened(IncidentEvent),
    IncidentClosed(IncidentEvent),
    SchedulerError(SchedulerErrorEvent),
}

/// One poll of one check, with the streaks after the poll was folded in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub device_id: i64,
    pub device_name: String,
    pub host: String,
    pub site: String,
    pub check_id: i64,
    pub kind: String,
    pub ts: DateTime<Utc>,
    pub status: Status,
    pub latency_ms: Option<f64>,
    pub details: Details,
    pub down_streak: u32,
    pub up_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub incident_id: i64,
    pub device_id: i64,
    pub check_id: i64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerErrorEvent {
    pub device_id: i64,
    pub check_id: i64,
    pub kind: String,
    pub error: String,
}

impl Event {
    pub fn result(spec: &CheckSpec, ts: DateTime<Utc>, outcome: &Outcome, streak: StreakState) -> Self {
        Event::Result(ResultEvent {
            device_id: spec.device_id,
            device_name: spec.device_name.clone(),
            host: spec.host.clone(),
            site: spec.site.clone(),
            check_id: spec.check_id,
            kind: spec.kind.clone(),
            ts,
            status: outcome.status,
            latency_ms: outcome.latency_ms,
            details: outcome.details.clone(),
            down_streak: streak.down,
            up_streak: streak.up,
        })
    }

    pub fn scheduler_error(spec: &CheckSpec, error: impl ToString) -> Self {
        Event::SchedulerError(SchedulerErrorEvent {
            device_id: spec.device_id,
            check_id: spec.check_id,
            kind: spec.kind.clone(),
            error: error.to_string(),
        })
    }

    /// The `type` discriminator
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Result(_) => "result",
            Event::IncidentOpened(_) => "incident_opened",
            Event::IncidentClosed(_) => "incident_closed",
            Event::SchedulerError(_) => "scheduler_error",
        }
    }

    pub fn check_id(&self) -> i64 {
        match self {
            Event::Result(e) => e.check_id,
            Event::IncidentOpened(e) | Event::IncidentClosed(e) => e.check_id,
            Event::SchedulerError(e) => e.check_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn result_event_has_wire_shape() {
        let event = Event::Result(ResultEvent {
            device_id: 1,
            device_name: "Localhost".into(),
            host: "127.0.0.1".into(),
            site: "Lab".into(),
            check_id: 3,
            kind: "ping".into(),
            ts: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            status: Status::Up,
            latency_ms: Some(0.4),
            details: Details::new(),
            down_streak: 0,
            up_streak: 4,
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "result",
                "device_id": 1,
                "device_name": "Localhost",
                "host": "127.0.0.1",
                "site": "Lab",
                "check_id": 3,
                "kind": "ping",
                "ts": "2023-11-14T22:13:20Z",
                "status": "up",
                "latency_ms": 0.4,
                "details": {},
                "down_streak": 0,
                "up_streak": 4
            })
        );
    }

    #[test]
    fn incident_and_error_events_are_tagged() {
        let ts = DateTime::from_timestamp(0, 0).unwrap();
        let opened = Event::IncidentOpened(IncidentEvent { incident_id: 9, device_id: 1, check_id: 2, ts });
        let value = serde_json::to_value(&opened).unwrap();
        assert_eq!(value["type"], "incident_opened");
        assert_eq!(value["incident_id"], 9);

        let error = Event::SchedulerError(SchedulerErrorEvent {
            device_id: 1,
            check_id: 2,
            kind: "snmp".into(),
            error: "no checker registered for kind 'snmp'".into(),
        });
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "scheduler_error");
        assert_eq!(value["kind"], Value::from("snmp"));

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, error);
        assert_eq!(parsed.type_name(), "scheduler_error");
    }
}
