/// Persistence layer
///
/// The scheduler only sees the three collaborator contracts below. Both the
/// libsql repository and the in-memory store implement all of them plus the
/// administrative [`Database`] operations used by the command line.
pub mod memory;
pub mod migrations;
pub mod models;
pub mod repository;

pub use memory::MemoryStore;
pub use repository::DatabaseImpl;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::monitoring::types::{CheckRecord, CheckSpec};
use models::{Check, Device, Incident, IncidentFilter};

/// Source of the checks the scheduler should run
#[async_trait]
pub trait CheckSource: Send + Sync {
    /// Checks whose owning device is enabled, ordered by check id
    async fn list_active_checks(&self) -> Result<Vec<CheckSpec>>;
}

/// Destination of per-poll result records
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(&self, record: &CheckRecord) -> Result<()>;
}

/// Incident persistence used by the incident engine
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// The currently open incident of a check, if any
    async fn find_open_incident(&self, check_id: i64) -> Result<Option<Incident>>;

    /// Create an open incident. Fails if the check already has one.
    async fn open_incident(
        &self,
        device_id: i64,
        check_id: i64,
        ts: DateTime<Utc>,
        reason: &str,
        meta: Map<String, Value>,
    ) -> Result<Incident>;

    /// Close an incident, merging `meta_update` into its metadata.
    /// Closing an unknown or already closed incident is a no-op.
    async fn close_incident(
        &self,
        incident_id: i64,
        ts: DateTime<Utc>,
        reason: &str,
        meta_update: Map<String, Value>,
    ) -> Result<()>;
}

/// Administrative operations on devices, checks and history
#[async_trait]
pub trait Database: CheckSource + ResultSink + IncidentStore {
    /// Insert a device (no id) or update it (with id); returns its id
    async fn save_device(&self, device: &Device) -> Result<i64>;

    async fn list_devices(&self) -> Result<Vec<Device>>;

    /// Returns false when the device does not exist
    async fn set_device_enabled(&self, device_id: i64, enabled: bool) -> Result<bool>;

    /// Insert a check (no id) or update it (with id); the device must exist
    async fn save_check(&self, check: &Check) -> Result<i64>;

    /// Returns false when the check does not exist
    async fn delete_check(&self, check_id: i64) -> Result<bool>;

    async fn list_checks(&self, device_id: Option<i64>) -> Result<Vec<Check>>;

    /// Most recent result records, newest first
    async fn recent_results(&self, limit: usize) -> Result<Vec<CheckRecord>>;

    /// Incidents matching the filter, most recently opened first
    async fn list_incidents(&self, filter: IncidentFilter, limit: usize) -> Result<Vec<Incident>>;
}

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}

/// Open the database file behind a connection pool and bring its schema up to date
pub async fn open_database(path: &std::path::Path, pool_size: usize) -> Result<DatabaseImpl> {
    let pool = crate::pool::open_pool(path, pool_size).await?;
    {
        let conn = pool.get().await?;
        initialize_database(&conn).await?;
    }
    tracing::debug!(path = %path.display(), "Database ready");
    Ok(DatabaseImpl::new_from_pool(pool))
}
