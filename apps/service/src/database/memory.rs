use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::models::{Check, Device, Incident, IncidentFilter, IncidentState};
use super::{CheckSource, Database, IncidentStore, ResultSink};
use crate::monitoring::types::{CheckRecord, CheckSpec};

#[derive(Debug, Default)]
struct MemoryState {
    devices: BTreeMap<i64, Device>,
    checks: BTreeMap<i64, Check>,
    results: Vec<CheckRecord>,
    incidents: BTreeMap<i64, Incident>,
    last_device_id: i64,
    last_check_id: i64,
    last_incident_id: i64,
}

/// In-process implementation of the persistence contracts.
///
/// Used by tests and by embedders that do not need history to survive a
/// restart. Enforces the same invariants as the libsql schema: checks belong
/// to an existing device, and a check has at most one open incident.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[async_trait]
impl CheckSource for MemoryStore {
    async fn list_active_checks(&self) -> Result<Vec<CheckSpec>> {
        let state = self.state.read().await;
        // BTreeMap iteration keeps the check-id order
        Ok(state
            .checks
            .values()
            .filter_map(|check| {
                let device = state.devices.get(&check.device_id)?;
                if !device.enabled {
                    return None;
                }
                check.spec(device)
            })
            .collect())
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn store(&self, record: &CheckRecord) -> Result<()> {
        self.state.write().await.results.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn find_open_incident(&self, check_id: i64) -> Result<Option<Incident>> {
        let state = self.state.read().await;
        Ok(state
            .incidents
            .values()
            .rev()
            .find(|i| i.check_id == check_id && i.state == IncidentState::Open)
            .cloned())
    }

    async fn open_incident(
        &self,
        device_id: i64,
        check_id: i64,
        ts: DateTime<Utc>,
        reason: &str,
        meta: Map<String, Value>,
    ) -> Result<Incident> {
        let mut state = self.state.write().await;
        if state
            .incidents
            .values()
            .any(|i| i.check_id == check_id && i.state == IncidentState::Open)
        {
            bail!("check {check_id} already has an open incident");
        }

        let id = next_id(&mut state.last_incident_id);
        let incident = Incident {
            id,
            device_id,
            check_id,
            state: IncidentState::Open,
            opened_ts: ts,
            closed_ts: None,
            open_reason: reason.to_string(),
            close_reason: None,
            meta,
        };
        state.incidents.insert(id, incident.clone());
        Ok(incident)
    }

    async fn close_incident(
        &self,
        incident_id: i64,
        ts: DateTime<Utc>,
        reason: &str,
        meta_update: Map<String, Value>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(incident) = state.incidents.get_mut(&incident_id) {
            if incident.state == IncidentState::Closed {
                return Ok(());
            }
            incident.state = IncidentState::Closed;
            incident.closed_ts = Some(ts);
            incident.close_reason = Some(reason.to_string());
            incident.meta.extend(meta_update);
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn save_device(&self, device: &Device) -> Result<i64> {
        let mut state = self.state.write().await;
        let id = match device.id {
            Some(id) => id,
            None => next_id(&mut state.last_device_id),
        };
        state.last_device_id = state.last_device_id.max(id);
        state.devices.insert(id, Device { id: Some(id), ..device.clone() });
        Ok(id)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.state.read().await.devices.values().cloned().collect())
    }

    async fn set_device_enabled(&self, device_id: i64, enabled: bool) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(match state.devices.get_mut(&device_id) {
            Some(device) => {
                device.enabled = enabled;
                true
            }
            None => false,
        })
    }

    async fn save_check(&self, check: &Check) -> Result<i64> {
        let mut state = self.state.write().await;
        if !state.devices.contains_key(&check.device_id) {
            return Err(anyhow!("device {} not found", check.device_id));
        }
        let id = match check.id {
            Some(id) => id,
            None => next_id(&mut state.last_check_id),
        };
        state.last_check_id = state.last_check_id.max(id);
        state.checks.insert(id, Check { id: Some(id), ..check.clone() });
        Ok(id)
    }

    async fn delete_check(&self, check_id: i64) -> Result<bool> {
        Ok(self.state.write().await.checks.remove(&check_id).is_some())
    }

    async fn list_checks(&self, device_id: Option<i64>) -> Result<Vec<Check>> {
        let state = self.state.read().await;
        Ok(state
            .checks
            .values()
            .filter(|c| device_id.is_none_or(|id| c.device_id == id))
            .cloned()
            .collect())
    }

    async fn recent_results(&self, limit: usize) -> Result<Vec<CheckRecord>> {
        let state = self.state.read().await;
        Ok(state.results.iter().rev().take(limit).cloned().collect())
    }

    async fn list_incidents(&self, filter: IncidentFilter, limit: usize) -> Result<Vec<Incident>> {
        let state = self.state.read().await;
        let mut incidents: Vec<Incident> =
            state.incidents.values().filter(|i| filter.matches(i.state)).cloned().collect();
        incidents.sort_by(|a, b| b.opened_ts.cmp(&a.opened_ts).then(b.id.cmp(&a.id)));
        incidents.truncate(limit);
        Ok(incidents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn active_checks_skip_disabled_devices() -> Result<()> {
        let store = MemoryStore::new();
        let lab = store.save_device(&Device::new("lab", "127.0.0.1")).await?;
        let wan = store.save_device(&Device::new("wan", "8.8.8.8")).await?;
        let first = store.save_check(&Check::new(lab, "ping")).await?;
        store.save_check(&Check::new(wan, "ping")).await?;

        assert_eq!(store.list_active_checks().await?.len(), 2);

        store.set_device_enabled(wan, false).await?;
        let active = store.list_active_checks().await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].check_id, first);
        assert_eq!(active[0].host, "127.0.0.1");
        Ok(())
    }

    #[tokio::test]
    async fn checks_require_an_existing_device() {
        let store = MemoryStore::new();
        assert!(store.save_check(&Check::new(42, "ping")).await.is_err());
    }

    #[tokio::test]
    async fn second_open_incident_is_rejected() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store.open_incident(1, 9, now, "down_streak", Map::new()).await?;
        assert!(store.open_incident(1, 9, now, "down_streak", Map::new()).await.is_err());

        let mut update = Map::new();
        update.insert("up_streak".into(), 2.into());
        store.close_incident(first.id, now, "up_streak", update).await?;
        assert!(store.find_open_incident(9).await?.is_none());

        let closed = store.list_incidents(IncidentFilter::Closed, 10).await?;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason.as_deref(), Some("up_streak"));
        assert_eq!(closed[0].meta.get("up_streak"), Some(&Value::from(2)));

        store.open_incident(1, 9, now, "down_streak", Map::new()).await?;
        Ok(())
    }
}
