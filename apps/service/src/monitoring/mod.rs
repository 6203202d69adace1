/// Monitoring engine module - schedules checks and derives incidents
///
/// This module is responsible for:
/// - Executing ping/TCP/HTTP/SNMPv3 checks through a kind registry
/// - Running one polling loop per active check
/// - Folding outcomes into streaks and streaks into incident transitions
/// - Validating check definitions before they are stored
pub mod checker;
pub mod executor;
pub mod incident;
pub mod scheduler;
pub mod secrets;
pub mod snmp;
pub mod streak;
pub mod types;
pub mod validation;


pub use checker::{Checker, CheckerRegistry};
pub use executor::MonitoringExecutor;
pub use incident::{IncidentEngine, Thresholds};
pub use scheduler::{MonitoringScheduler, SchedulerSettings};
pub use types::{CheckSpec, Outcome, Status};
