use std::time::Duration;
use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitoring::incident::Thresholds;
use crate::monitoring::scheduler::SchedulerSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to write config {}: {source}", .path.display())]
    WriteFailed { path: path::PathBuf, source: std::io::Error },
    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed { path: path::PathBuf, source: toml::de::Error },
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config path available: neither XDG_CONFIG_HOME nor HOME is set")]
    ConfigPathUnavailable,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub scheduler: SchedulerConfig,
    pub hub: HubConfig,
    pub checks: ChecksConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: path::PathBuf,
    pub pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub open_after_downs: u32,
    pub close_after_ups: u32,
    pub max_jitter_ms: u64,
    pub executor_grace_ms: u64,
    pub max_loop_restarts: u32,
    pub restart_backoff_base_ms: u64,
    pub restart_backoff_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub subscriber_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub degraded_threshold_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `compact` or `json`; `RUST_LOG_FORMAT` takes precedence
    pub format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: path::PathBuf::from("data/netdash.db"), pool_size: 8 }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0".into(), port: 8000 }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            open_after_downs: 3,
            close_after_ups: 2,
            max_jitter_ms: 1500,
            executor_grace_ms: 500,
            max_loop_restarts: 0,
            restart_backoff_base_ms: 1000,
            restart_backoff_max_ms: 60_000,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { subscriber_capacity: 64 }
    }
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self { degraded_threshold_ms: 1000 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { format: "compact".into() }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            thresholds: Thresholds::new(self.open_after_downs, self.close_after_ups),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
            max_loop_restarts: self.max_loop_restarts,
            restart_backoff_base: Duration::from_millis(self.restart_backoff_base_ms),
            restart_backoff_max: Duration::from_millis(self.restart_backoff_max_ms),
        }
    }

    pub fn executor_grace(&self) -> Duration {
        Duration::from_millis(self.executor_grace_ms)
    }
}

impl ChecksConfig {
    pub fn degraded_threshold(&self) -> Duration {
        Duration::from_millis(self.degraded_threshold_ms)
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/netdash/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("netdash/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path.display())?;
        write_1(f, "Pool Size", &self.database.pool_size)?;

        write_title_1(f, "HTTP")?;
        write_1(f, "Enabled", &self.http.enabled)?;
        write_1(f, "Bind Address", &self.http.bind)?;
        write_1(f, "Port", &self.http.port)?;

        write_title_1(f, "Scheduler")?;
        write_1(f, "Open After Downs", &self.scheduler.open_after_downs)?;
        write_1(f, "Close After Ups", &self.scheduler.close_after_ups)?;
        write_1(f, "Max Jitter (ms)", &self.scheduler.max_jitter_ms)?;
        write_1(f, "Executor Grace (ms)", &self.scheduler.executor_grace_ms)?;
        write_1(f, "Max Loop Restarts", &self.scheduler.max_loop_restarts)?;

        write_title_1(f, "Event Hub")?;
        write_1(f, "Subscriber Capacity", &self.hub.subscriber_capacity)?;

        write_title_1(f, "Checks")?;
        write_1(f, "Degraded Threshold (ms)", &self.checks.degraded_threshold_ms)?;

        write_title_1(f, "Log")?;
        write_1(f, "Format", &self.log.format)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/netdash/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())
                .map_err(|source| ConfigError::ParseFailed { path: config_path, source })
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })?;
        }

        fs::write(path, config_str).map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/netdash");

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("nested/netdash.toml").exists());

        // Second load reads the file back
        assert_eq!(Config::from_config(Some(&path)).unwrap(), config);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: Config = toml::from_str(
            "[scheduler]\nopen_after_downs = 5\n\n[http]\nenabled = false\n",
        )
        .unwrap();
        assert_eq!(config.scheduler.open_after_downs, 5);
        assert_eq!(config.scheduler.close_after_ups, 2);
        assert!(!config.http.enabled);
        assert_eq!(config.http.port, 8000);
        assert_eq!(config.hub.subscriber_capacity, 64);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[scheduler\n").unwrap();

        let err = Config::from_config(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn scheduler_settings_clamp_thresholds() {
        let config = SchedulerConfig { open_after_downs: 0, max_jitter_ms: 250, ..SchedulerConfig::default() };
        let settings = config.settings();
        assert_eq!(settings.thresholds, Thresholds::new(1, 2));
        assert_eq!(settings.max_jitter, Duration::from_millis(250));
    }
}
