use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use crate::database::Database;
use crate::database::models::{
    Check, DEFAULT_INTERVAL_SECONDS, DEFAULT_SITE, DEFAULT_TIMEOUT_SECONDS, Device, IncidentFilter,
    seconds_to_duration,
};
use crate::monitoring::types::{Outcome, Params};
use crate::monitoring::{MonitoringExecutor, validation};

#[derive(Debug, Parser)]
#[command(name = "netdash", version, about = "Poll network endpoints and track incidents")]
pub struct Cli {
    /// Configuration file [default: $XDG_CONFIG_HOME/netdash/config.toml]
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Database file, overriding `database.path` from the configuration
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or migrate the database
    InitDb,
    /// Manage monitored devices
    #[command(subcommand)]
    Device(DeviceCommand),
    /// Manage checks
    #[command(subcommand)]
    Check(CheckCommand),
    /// Run one check now and print its outcome (exit status 2 when down)
    Probe(ProbeArgs),
    /// Show the most recent check results
    Status {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List incidents
    Incidents {
        #[arg(long, value_enum, default_value_t = IncidentFilter::Open)]
        state: IncidentFilter,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Start the scheduler and the HTTP event stream (SIGHUP reloads, Ctrl-C stops)
    Run,
}

#[derive(Debug, Subcommand)]
pub enum DeviceCommand {
    /// Register a device
    Add(DeviceAddArgs),
    /// List devices
    List,
    /// Resume polling a device's checks (takes effect on reload)
    Enable { id: i64 },
    /// Stop polling a device's checks (takes effect on reload)
    Disable { id: i64 },
}

#[derive(Debug, Clone, Args)]
pub struct DeviceAddArgs {
    #[arg(long)]
    pub name: String,
    /// IP address or DNS name
    #[arg(long)]
    pub host: String,
    #[arg(long, default_value = DEFAULT_SITE)]
    pub site: String,
    /// Comma-separated labels
    #[arg(long, default_value = "")]
    pub tags: String,
    /// Register the device without polling it
    #[arg(long)]
    pub disabled: bool,
}

#[derive(Debug, Subcommand)]
pub enum CheckCommand {
    /// Add a check to a device
    Add(CheckAddArgs),
    /// List checks
    List {
        /// Only checks of this device
        #[arg(long)]
        device: Option<i64>,
    },
    /// Delete a check
    Remove { id: i64 },
}

#[derive(Debug, Clone, Args)]
pub struct CheckAddArgs {
    #[arg(long)]
    pub device: i64,
    /// Check kind (ping, tcp, http, snmpv3_get)
    #[arg(long)]
    pub kind: String,
    /// Seconds between polls
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECONDS)]
    pub interval: u64,
    /// Seconds before a poll counts as down
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECONDS)]
    pub timeout: f64,
    /// Kind-specific parameter; values that parse as JSON keep their type
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Check kind (ping, tcp, http, snmpv3_get)
    pub kind: String,
    /// IP address or DNS name
    pub target: String,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECONDS)]
    pub timeout: f64,
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,
}

/// Parse `key=value` pairs into a parameter bag.
///
/// `port=443` becomes a number and `headers={"X-Key":"env:KEY"}` an object;
/// anything that is not valid JSON, such as `env:TOKEN`, stays a string.
pub fn parse_params(pairs: &[String]) -> Result<Params> {
    let mut params = Params::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').ok_or_else(|| anyhow!("Parameter '{}' is not KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Parameter '{}' has an empty key", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

pub async fn add_device(db: &dyn Database, args: DeviceAddArgs) -> Result<i64> {
    validation::validate_host(&args.host)?;
    let device = Device {
        site: args.site,
        tags: args.tags,
        enabled: !args.disabled,
        ..Device::new(args.name, args.host.trim())
    };
    let id = db.save_device(&device).await?;
    println!("Added device {id}");
    Ok(id)
}

pub async fn list_devices(db: &dyn Database) -> Result<()> {
    let devices = db.list_devices().await?;
    if devices.is_empty() {
        println!("No devices registered");
        return Ok(());
    }

    println!("{:<6} {:<24} {:<28} {:<12} {:<8} TAGS", "ID", "NAME", "HOST", "SITE", "ENABLED");
    for device in devices {
        println!(
            "{:<6} {:<24} {:<28} {:<12} {:<8} {}",
            device.id.unwrap_or_default(),
            device.name,
            device.host,
            device.site,
            if device.enabled { "yes" } else { "no" },
            device.tags
        );
    }
    Ok(())
}

pub async fn set_device_enabled(db: &dyn Database, id: i64, enabled: bool) -> Result<()> {
    if !db.set_device_enabled(id, enabled).await? {
        bail!("Device {} does not exist", id);
    }
    println!("Device {id} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

pub async fn add_check(db: &dyn Database, args: CheckAddArgs, known_kinds: &[&str]) -> Result<i64> {
    let check = Check {
        interval_seconds: args.interval,
        timeout_seconds: args.timeout,
        params: parse_params(&args.params)?,
        ..Check::new(args.device, args.kind)
    };
    validation::validate_check(&check, known_kinds)?;

    let id = db.save_check(&check).await?;
    println!("Added {} check {id} to device {}", check.kind, check.device_id);
    Ok(id)
}

pub async fn list_checks(db: &dyn Database, device: Option<i64>) -> Result<()> {
    let checks = db.list_checks(device).await?;
    if checks.is_empty() {
        println!("No checks configured");
        return Ok(());
    }

    println!("{:<6} {:<8} {:<8} {:<10} {:<10} PARAMS", "ID", "DEVICE", "KIND", "INTERVAL", "TIMEOUT");
    for check in checks {
        println!(
            "{:<6} {:<8} {:<8} {:<10} {:<10} {}",
            check.id.unwrap_or_default(),
            check.device_id,
            check.kind,
            format!("{}s", check.interval_seconds),
            format!("{}s", check.timeout_seconds),
            Value::Object(check.params)
        );
    }
    Ok(())
}

pub async fn remove_check(db: &dyn Database, id: i64) -> Result<()> {
    if !db.delete_check(id).await? {
        bail!("Check {} does not exist", id);
    }
    println!("Removed check {id}");
    Ok(())
}

/// Run a single check outside the scheduler
pub async fn probe(executor: &MonitoringExecutor, args: ProbeArgs) -> Result<Outcome> {
    validation::validate_host(&args.target)?;
    validation::validate_timeout(args.timeout)?;
    let params = parse_params(&args.params)?;
    validation::validate_params(&args.kind, &params, args.timeout)?;

    let timeout: Duration = seconds_to_duration(args.timeout);
    let outcome = executor.execute(&args.kind, args.target.trim(), timeout, &params).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome)
}

pub async fn show_status(db: &dyn Database, limit: usize) -> Result<()> {
    let results = db.recent_results(limit).await?;
    if results.is_empty() {
        println!("No results recorded yet");
        return Ok(());
    }

    println!("{:<25} {:<6} {:<9} {:<10} ERROR", "TIME", "CHECK", "STATUS", "LATENCY");
    for record in results {
        let latency = record.latency_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms:.1}ms"));
        let error = record.details.get("error").and_then(Value::as_str).unwrap_or("");
        println!(
            "{:<25} {:<6} {:<9} {:<10} {}",
            record.ts.format("%Y-%m-%d %H:%M:%S UTC"),
            record.check_id,
            record.status.as_str(),
            latency,
            error
        );
    }
    Ok(())
}

pub async fn show_incidents(db: &dyn Database, filter: IncidentFilter, limit: usize) -> Result<()> {
    let incidents = db.list_incidents(filter, limit).await?;
    if incidents.is_empty() {
        println!("No matching incidents");
        return Ok(());
    }

    println!("{:<6} {:<6} {:<6} {:<7} {:<20} {:<20} REASON", "ID", "DEVICE", "CHECK", "STATE", "OPENED", "CLOSED");
    for incident in incidents {
        let closed = incident
            .closed_ts
            .map_or_else(|| "-".to_string(), |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string());
        let reason = match &incident.close_reason {
            Some(close) => format!("{} / {}", incident.open_reason, close),
            None => incident.open_reason.clone(),
        };
        println!(
            "{:<6} {:<6} {:<6} {:<7} {:<20} {:<20} {}",
            incident.id,
            incident.device_id,
            incident.check_id,
            incident.state.as_str(),
            incident.opened_ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            closed,
            reason
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{CheckSource, MemoryStore};
    use serde_json::json;

    const KINDS: &[&str] = &["http", "ping", "tcp"];

    fn pairs(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn params_keep_json_types() {
        let params = parse_params(&pairs(&[
            "port=443",
            "secure=true",
            "bearer_token=env:API_TOKEN",
            "path=/status",
            r#"headers={"X-Key":"env:KEY"}"#,
            "quoted=\"22\"",
            "url=http://host/?a=b",
        ]))
        .unwrap();

        assert_eq!(params["port"], json!(443));
        assert_eq!(params["secure"], json!(true));
        assert_eq!(params["bearer_token"], json!("env:API_TOKEN"));
        assert_eq!(params["path"], json!("/status"));
        assert_eq!(params["headers"], json!({"X-Key": "env:KEY"}));
        assert_eq!(params["quoted"], json!("22"));
        assert_eq!(params["url"], json!("http://host/?a=b"));
    }

    #[test]
    fn malformed_params_are_rejected() {
        assert!(parse_params(&pairs(&["port"])).is_err());
        assert!(parse_params(&pairs(&["=443"])).is_err());
        assert!(parse_params(&pairs(&[])).unwrap().is_empty());
    }

    #[test]
    fn command_line_parses() {
        let cli = Cli::try_parse_from([
            "netdash", "--db", "/tmp/x.db", "check", "add", "--device", "1", "--kind", "tcp", "--param", "port=22",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        let Command::Check(CheckCommand::Add(args)) = cli.command else { panic!("expected check add") };
        assert_eq!(args.interval, DEFAULT_INTERVAL_SECONDS);
        assert_eq!(args.params, vec!["port=22".to_string()]);

        let cli = Cli::try_parse_from(["netdash", "incidents", "--state", "all"]).unwrap();
        assert!(matches!(cli.command, Command::Incidents { state: IncidentFilter::All, limit: 50 }));
    }

    #[tokio::test]
    async fn device_and_check_management() -> Result<()> {
        let store = MemoryStore::new();
        let args = DeviceAddArgs {
            name: "gateway".into(),
            host: " 192.168.1.1 ".into(),
            site: "home".into(),
            tags: "core".into(),
            disabled: false,
        };
        let device = add_device(&store, args).await?;

        let check = CheckAddArgs {
            device,
            kind: "tcp".into(),
            interval: 15,
            timeout: 1.0,
            params: pairs(&["port=443", "open_after_downs=5"]),
        };
        let id = add_check(&store, check.clone(), KINDS).await?;

        let active = store.list_active_checks().await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].host, "192.168.1.1");
        assert_eq!(active[0].interval, Duration::from_secs(15));
        assert_eq!(active[0].params["open_after_downs"], json!(5));

        let invalid = CheckAddArgs { params: pairs(&[]), ..check.clone() };
        assert!(add_check(&store, invalid, KINDS).await.is_err());
        let orphan = CheckAddArgs { device: 99, ..check };
        assert!(add_check(&store, orphan, KINDS).await.is_err());

        set_device_enabled(&store, device, false).await?;
        assert!(store.list_active_checks().await?.is_empty());
        assert!(set_device_enabled(&store, 42, true).await.is_err());

        remove_check(&store, id).await?;
        assert!(remove_check(&store, id).await.is_err());
        Ok(())
    }
}
