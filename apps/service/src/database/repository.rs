use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde_json::{Map, Value};
use std::time::Duration;

use super::models::{
    Check, Device, Incident, IncidentFilter, IncidentState, millis_to_timestamp,
    seconds_to_duration, timestamp_to_millis,
};
use super::{CheckSource, Database, IncidentStore, ResultSink};
use crate::monitoring::types::{CheckRecord, CheckSpec};
use crate::pool::{LibsqlManager, LibsqlPool};

const INCIDENT_COLUMNS: &str =
    "id, device_id, check_id, state, opened_ts, closed_ts, open_reason, close_reason, meta";

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }
}

fn json_object(raw: &str) -> Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(raw).with_context(|| format!("invalid JSON object column: {raw}"))
}

fn device_from_row(row: &Row) -> Result<Device> {
    Ok(Device {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        host: row.get(2)?,
        site: row.get(3)?,
        tags: row.get(4)?,
        enabled: row.get::<i64>(5)? != 0,
    })
}

fn check_from_row(row: &Row) -> Result<Check> {
    let params: String = row.get(5)?;
    Ok(Check {
        id: Some(row.get(0)?),
        device_id: row.get(1)?,
        kind: row.get(2)?,
        interval_seconds: row.get::<i64>(3)?.max(1) as u64,
        timeout_seconds: row.get(4)?,
        params: json_object(&params)?,
    })
}

fn incident_from_row(row: &Row) -> Result<Incident> {
    let state: String = row.get(3)?;
    let meta: String = row.get(8)?;
    Ok(Incident {
        id: row.get(0)?,
        device_id: row.get(1)?,
        check_id: row.get(2)?,
        state: state.parse()?,
        opened_ts: millis_to_timestamp(row.get(4)?),
        closed_ts: row.get::<Option<i64>>(5)?.map(millis_to_timestamp),
        open_reason: row.get(6)?,
        close_reason: row.get(7)?,
        meta: json_object(&meta)?,
    })
}

#[async_trait]
impl CheckSource for DatabaseImpl {
    async fn list_active_checks(&self) -> Result<Vec<CheckSpec>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT c.id, c.device_id, d.name, d.host, d.site, c.kind, c.interval_seconds, c.timeout_seconds, c.params
                 FROM checks c JOIN devices d ON d.id = c.device_id
                 WHERE d.enabled = 1
                 ORDER BY c.id",
                (),
            )
            .await?;

        let mut checks = Vec::new();
        while let Some(row) = rows.next().await? {
            let params: String = row.get(8)?;
            checks.push(CheckSpec {
                check_id: row.get(0)?,
                device_id: row.get(1)?,
                device_name: row.get(2)?,
                host: row.get(3)?,
                site: row.get(4)?,
                kind: row.get(5)?,
                interval: Duration::from_secs(row.get::<i64>(6)?.max(1) as u64),
                timeout: seconds_to_duration(row.get(7)?),
                params: json_object(&params)?,
            });
        }

        Ok(checks)
    }
}

#[async_trait]
impl ResultSink for DatabaseImpl {
    async fn store(&self, record: &CheckRecord) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO results (check_id, ts, status, latency_ms, details) VALUES (?, ?, ?, ?, ?)",
            params![
                record.check_id,
                timestamp_to_millis(record.ts),
                record.status.as_str(),
                record.latency_ms,
                serde_json::to_string(&record.details)?
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IncidentStore for DatabaseImpl {
    async fn find_open_incident(&self, check_id: i64) -> Result<Option<Incident>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents
                     WHERE check_id = ? AND state = 'open'
                     ORDER BY opened_ts DESC LIMIT 1"
                ),
                params![check_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(incident_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn open_incident(
        &self,
        device_id: i64,
        check_id: i64,
        ts: DateTime<Utc>,
        reason: &str,
        meta: Map<String, Value>,
    ) -> Result<Incident> {
        let conn = self.get_conn().await?;
        // idx_incidents_one_open rejects a second open row for the same check
        conn.execute(
            "INSERT INTO incidents (device_id, check_id, state, opened_ts, open_reason, meta) VALUES (?, ?, 'open', ?, ?, ?)",
            params![
                device_id,
                check_id,
                timestamp_to_millis(ts),
                reason,
                serde_json::to_string(&meta)?
            ],
        )
        .await
        .with_context(|| format!("failed to open incident for check {check_id}"))?;

        Ok(Incident {
            id: conn.last_insert_rowid(),
            device_id,
            check_id,
            state: IncidentState::Open,
            opened_ts: ts,
            closed_ts: None,
            open_reason: reason.to_string(),
            close_reason: None,
            meta,
        })
    }

    async fn close_incident(
        &self,
        incident_id: i64,
        ts: DateTime<Utc>,
        reason: &str,
        meta_update: Map<String, Value>,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT meta FROM incidents WHERE id = ? AND state = 'open'",
                params![incident_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(());
        };
        let raw: String = row.get(0)?;
        drop(rows);
        let mut meta = json_object(&raw)?;
        meta.extend(meta_update);

        conn.execute(
            "UPDATE incidents SET state = 'closed', closed_ts = ?, close_reason = ?, meta = ? WHERE id = ? AND state = 'open'",
            params![timestamp_to_millis(ts), reason, serde_json::to_string(&meta)?, incident_id],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Database for DatabaseImpl {
    async fn save_device(&self, device: &Device) -> Result<i64> {
        let conn = self.get_conn().await?;

        if let Some(id) = device.id {
            conn.execute(
                "UPDATE devices SET name = ?, host = ?, site = ?, tags = ?, enabled = ? WHERE id = ?",
                params![
                    device.name.clone(),
                    device.host.clone(),
                    device.site.clone(),
                    device.tags.clone(),
                    i64::from(device.enabled),
                    id
                ],
            )
            .await?;
            Ok(id)
        } else {
            conn.execute(
                "INSERT INTO devices (name, host, site, tags, enabled) VALUES (?, ?, ?, ?, ?)",
                params![
                    device.name.clone(),
                    device.host.clone(),
                    device.site.clone(),
                    device.tags.clone(),
                    i64::from(device.enabled)
                ],
            )
            .await?;
            Ok(conn.last_insert_rowid())
        }
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT id, name, host, site, tags, enabled FROM devices ORDER BY id", ())
            .await?;

        let mut devices = Vec::new();
        while let Some(row) = rows.next().await? {
            devices.push(device_from_row(&row)?);
        }
        Ok(devices)
    }

    async fn set_device_enabled(&self, device_id: i64, enabled: bool) -> Result<bool> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE devices SET enabled = ? WHERE id = ?",
                params![i64::from(enabled), device_id],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn save_check(&self, check: &Check) -> Result<i64> {
        let conn = self.get_conn().await?;

        let mut rows =
            conn.query("SELECT 1 FROM devices WHERE id = ?", params![check.device_id]).await?;
        if rows.next().await?.is_none() {
            bail!("device {} not found", check.device_id);
        }
        drop(rows);

        let params_json = serde_json::to_string(&check.params)?;
        if let Some(id) = check.id {
            conn.execute(
                "UPDATE checks SET device_id = ?, kind = ?, interval_seconds = ?, timeout_seconds = ?, params = ? WHERE id = ?",
                params![
                    check.device_id,
                    check.kind.clone(),
                    check.interval_seconds as i64,
                    check.timeout_seconds,
                    params_json,
                    id
                ],
            )
            .await?;
            Ok(id)
        } else {
            conn.execute(
                "INSERT INTO checks (device_id, kind, interval_seconds, timeout_seconds, params) VALUES (?, ?, ?, ?, ?)",
                params![
                    check.device_id,
                    check.kind.clone(),
                    check.interval_seconds as i64,
                    check.timeout_seconds,
                    params_json
                ],
            )
            .await?;
            Ok(conn.last_insert_rowid())
        }
    }

    async fn delete_check(&self, check_id: i64) -> Result<bool> {
        let conn = self.get_conn().await?;
        let changed = conn.execute("DELETE FROM checks WHERE id = ?", params![check_id]).await?;
        Ok(changed > 0)
    }

    async fn list_checks(&self, device_id: Option<i64>) -> Result<Vec<Check>> {
        let conn = self.get_conn().await?;
        let mut rows = match device_id {
            Some(id) => {
                conn.query(
                    "SELECT id, device_id, kind, interval_seconds, timeout_seconds, params FROM checks WHERE device_id = ? ORDER BY id",
                    params![id],
                )
                .await?
            }
            None => {
                conn.query(
                    "SELECT id, device_id, kind, interval_seconds, timeout_seconds, params FROM checks ORDER BY id",
                    (),
                )
                .await?
            }
        };

        let mut checks = Vec::new();
        while let Some(row) = rows.next().await? {
            checks.push(check_from_row(&row)?);
        }
        Ok(checks)
    }

    async fn recent_results(&self, limit: usize) -> Result<Vec<CheckRecord>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT check_id, ts, status, latency_ms, details FROM results ORDER BY ts DESC, id DESC LIMIT ?",
                params![limit as i64],
            )
            .await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(2)?;
            let details: String = row.get(4)?;
            results.push(CheckRecord {
                check_id: row.get(0)?,
                ts: millis_to_timestamp(row.get(1)?),
                status: status.parse()?,
                latency_ms: row.get(3)?,
                details: json_object(&details)?,
            });
        }
        Ok(results)
    }

    async fn list_incidents(&self, filter: IncidentFilter, limit: usize) -> Result<Vec<Incident>> {
        let conn = self.get_conn().await?;
        let mut rows = match filter {
            IncidentFilter::All => {
                conn.query(
                    &format!(
                        "SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY opened_ts DESC, id DESC LIMIT ?"
                    ),
                    params![limit as i64],
                )
                .await?
            }
            IncidentFilter::Open | IncidentFilter::Closed => {
                let state = if filter == IncidentFilter::Open {
                    IncidentState::Open
                } else {
                    IncidentState::Closed
                };
                conn.query(
                    &format!(
                        "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE state = ? ORDER BY opened_ts DESC, id DESC LIMIT ?"
                    ),
                    params![state.as_str(), limit as i64],
                )
                .await?
            }
        };

        let mut incidents = Vec::new();
        while let Some(row) = rows.next().await? {
            incidents.push(incident_from_row(&row)?);
        }
        Ok(incidents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{initialize_database, open_database};
    use crate::monitoring::types::Status;
    use tempfile::TempDir;

    /// Helper to create a migrated test database; the TempDir must outlive the pool
    async fn create_test_database() -> Result<(DatabaseImpl, TempDir)> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("test.db");
        drop(open_database(&path, 2).await?);

        // Reopening runs the migrations again; they must be idempotent
        let pool = crate::pool::open_pool(&path, 4).await?;
        let conn = pool.get().await?;
        initialize_database(&conn).await?;
        drop(conn);

        Ok((DatabaseImpl::new_from_pool(pool), temp_dir))
    }

    #[tokio::test]
    async fn active_checks_follow_device_enablement() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let lab = db.save_device(&Device { site: "Lab".into(), ..Device::new("Localhost", "127.0.0.1") }).await?;
        let wan = db.save_device(&Device::new("Google DNS", "8.8.8.8")).await?;

        let mut ping = Check::new(lab, "ping");
        ping.interval_seconds = 10;
        ping.params.insert("count".into(), 1.into());
        ping.params.insert("open_after_downs".into(), 5.into());
        let ping_id = db.save_check(&ping).await?;
        db.save_check(&Check::new(wan, "ping")).await?;

        let active = db.list_active_checks().await?;
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].check_id, ping_id);
        assert_eq!(active[0].site, "Lab");
        assert_eq!(active[0].interval, Duration::from_secs(10));
        assert_eq!(active[0].params.get("open_after_downs"), Some(&Value::from(5)));

        assert!(db.set_device_enabled(wan, false).await?);
        assert!(!db.set_device_enabled(999, false).await?);
        assert_eq!(db.list_active_checks().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn check_for_missing_device_is_rejected() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        assert!(db.save_check(&Check::new(77, "tcp")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn results_are_listed_newest_first() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let base = Utc::now();
        for (offset, status) in [(0, Status::Up), (1, Status::Down), (2, Status::Degraded)] {
            let mut details = Map::new();
            details.insert("seq".into(), offset.into());
            db.store(&CheckRecord {
                check_id: 1,
                ts: base + chrono::Duration::seconds(offset),
                status,
                latency_ms: (status != Status::Down).then_some(12.5),
                details,
            })
            .await?;
        }

        let recent = db.recent_results(2).await?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, Status::Degraded);
        assert_eq!(recent[1].status, Status::Down);
        assert_eq!(recent[1].latency_ms, None);
        assert_eq!(recent[0].details.get("seq"), Some(&Value::from(2)));
        Ok(())
    }

    #[tokio::test]
    async fn incident_lifecycle_enforces_single_open() -> Result<()> {
        let (db, _dir) = create_test_database().await?;
        let now = Utc::now();
        let mut meta = Map::new();
        meta.insert("open_after_downs".into(), 3.into());

        let incident = db.open_incident(1, 5, now, "down_streak", meta).await?;
        assert_eq!(db.find_open_incident(5).await?.map(|i| i.id), Some(incident.id));
        assert!(db.open_incident(1, 5, now, "down_streak", Map::new()).await.is_err());

        let mut update = Map::new();
        update.insert("up_streak".into(), 2.into());
        db.close_incident(incident.id, now, "up_streak", update).await?;
        // Closing twice is harmless
        db.close_incident(incident.id, now, "up_streak", Map::new()).await?;

        assert!(db.find_open_incident(5).await?.is_none());
        let closed = db.list_incidents(IncidentFilter::Closed, 10).await?;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].state, IncidentState::Closed);
        assert_eq!(closed[0].meta.get("open_after_downs"), Some(&Value::from(3)));
        assert_eq!(closed[0].meta.get("up_streak"), Some(&Value::from(2)));
        assert!(db.list_incidents(IncidentFilter::Open, 10).await?.is_empty());

        db.open_incident(1, 5, now, "down_streak", Map::new()).await?;
        assert_eq!(db.list_incidents(IncidentFilter::All, 10).await?.len(), 2);
        Ok(())
    }
}
