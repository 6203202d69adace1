use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::info;

use super::streak::StreakState;
use super::types::{Params, Status, int_param};
use crate::database::IncidentStore;
use crate::events::{Event, IncidentEvent};

pub const DEFAULT_OPEN_AFTER_DOWNS: u32 = 3;
pub const DEFAULT_CLOSE_AFTER_UPS: u32 = 2;

pub const OPEN_REASON: &str = "down_streak";
pub const CLOSE_REASON: &str = "up_streak";

/// Streak lengths that trigger incident transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub open_after_downs: u32,
    pub close_after_ups: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { open_after_downs: DEFAULT_OPEN_AFTER_DOWNS, close_after_ups: DEFAULT_CLOSE_AFTER_UPS }
    }
}

impl Thresholds {
    /// Both thresholds are at least 1
    pub fn new(open_after_downs: u32, close_after_ups: u32) -> Self {
        Self { open_after_downs: open_after_downs.max(1), close_after_ups: close_after_ups.max(1) }
    }

    /// Apply the per-check `open_after_downs` / `close_after_ups` overrides
    pub fn with_overrides(self, params: &Params) -> Self {
        let read = |key: &str, fallback: u32| {
            int_param(params, key).map_or(fallback, |v| u32::try_from(v.max(1)).unwrap_or(u32::MAX))
        };
        Self::new(
            read("open_after_downs", self.open_after_downs),
            read("close_after_ups", self.close_after_ups),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Open,
    Close,
    Hold,
}

/// Transition rule for one poll, given whether the check has an open incident
pub fn decide(status: Status, streak: StreakState, thresholds: Thresholds, has_open: bool) -> Transition {
    match (status.is_available(), has_open) {
        (false, false) if streak.down >= thresholds.open_after_downs => Transition::Open,
        (true, true) if streak.up >= thresholds.close_after_ups => Transition::Close,
        _ => Transition::Hold,
    }
}

/// Everything the engine needs to know about one poll
#[derive(Debug, Clone, Copy)]
pub struct Evaluation {
    pub device_id: i64,
    pub check_id: i64,
    pub ts: DateTime<Utc>,
    pub status: Status,
    pub streak: StreakState,
    pub thresholds: Thresholds,
}

/// Incident state machine driven by consecutive-result streaks.
///
/// A check is either without an open incident or with exactly one. Enough
/// consecutive `down` polls open an incident; enough consecutive available
/// polls close it. Everything else leaves the state alone.
pub struct IncidentEngine {
    store: Arc<dyn IncidentStore>,
}

impl IncidentEngine {
    pub fn new(store: Arc<dyn IncidentStore>) -> Self {
        Self { store }
    }

    /// Apply one poll to the persisted incident state.
    ///
    /// The open incident is looked up on every call, so state survives loop
    /// restarts. Returns the transition event, if any.
    pub async fn evaluate(&self, eval: &Evaluation) -> Result<Option<Event>> {
        let open = self.store.find_open_incident(eval.check_id).await?;

        match (decide(eval.status, eval.streak, eval.thresholds, open.is_some()), open) {
            (Transition::Open, _) => {
                let mut meta = Map::new();
                meta.insert("open_after_downs".into(), Value::from(eval.thresholds.open_after_downs));
                meta.insert("down_streak".into(), Value::from(eval.streak.down));

                let incident =
                    self.store.open_incident(eval.device_id, eval.check_id, eval.ts, OPEN_REASON, meta).await?;
                info!(
                    incident_id = incident.id,
                    device_id = eval.device_id,
                    check_id = eval.check_id,
                    down_streak = eval.streak.down,
                    "Incident opened"
                );

                Ok(Some(Event::IncidentOpened(IncidentEvent {
                    incident_id: incident.id,
                    device_id: eval.device_id,
                    check_id: eval.check_id,
                    ts: eval.ts,
                })))
            }
            (Transition::Close, Some(incident)) => {
                let mut meta = Map::new();
                meta.insert("close_after_ups".into(), Value::from(eval.thresholds.close_after_ups));
                meta.insert("up_streak".into(), Value::from(eval.streak.up));

                self.store.close_incident(incident.id, eval.ts, CLOSE_REASON, meta).await?;
                info!(
                    incident_id = incident.id,
                    device_id = eval.device_id,
                    check_id = eval.check_id,
                    up_streak = eval.streak.up,
                    "Incident closed"
                );

                Ok(Some(Event::IncidentClosed(IncidentEvent {
                    incident_id: incident.id,
                    device_id: eval.device_id,
                    check_id: eval.check_id,
                    ts: eval.ts,
                })))
            }
            _ => Ok(None),
        }
    }
}
