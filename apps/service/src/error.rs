use std::any::Any;
use std::io::Error as IoError;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0:#}")]
    Io(#[from] IoError),
    #[error("Address parsing error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

/// Lifecycle errors returned by the scheduler's control operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running, use reload instead")]
    AlreadyRunning,
    #[error("failed to load active checks: {0:#}")]
    Source(anyhow::Error),
}

/// Unexpected failure inside one polling loop. Terminates that loop.
#[derive(Debug, Error)]
pub enum LoopFault {
    #[error("no checker registered for kind '{0}'")]
    UnknownKind(String),
    #[error("incident store failure: {0:#}")]
    Incident(anyhow::Error),
    #[error("polling loop panicked: {0}")]
    Panicked(String),
}

impl LoopFault {
    /// Wrap a panic payload caught with `catch_unwind`
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        LoopFault::Panicked(message)
    }
}
