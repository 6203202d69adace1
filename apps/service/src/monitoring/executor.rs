use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::timeout;

use super::checker::CheckerRegistry;
use super::types::{Outcome, Params};
use crate::error::LoopFault;

pub const DEFAULT_GRACE: Duration = Duration::from_millis(500);

/// Monitoring executor - dispatches a check to the checker for its kind and
/// enforces the execution deadline
pub struct MonitoringExecutor {
    registry: CheckerRegistry,
    grace: Duration,
}

impl MonitoringExecutor {
    pub fn new(registry: CheckerRegistry, grace: Duration) -> Self {
        Self { registry, grace }
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.registry.contains(kind)
    }

    pub fn registry(&self) -> &CheckerRegistry {
        &self.registry
    }

    /// Run one check.
    ///
    /// Returns within `timeout + grace`. Probe failures and overruns come back
    /// as `down` outcomes; only an unknown kind or a panicking checker is a fault.
    pub async fn execute(
        &self,
        kind: &str,
        target: &str,
        check_timeout: Duration,
        params: &Params,
    ) -> Result<Outcome, LoopFault> {
        let checker = self.registry.get(kind).ok_or_else(|| LoopFault::UnknownKind(kind.to_string()))?;

        let run = AssertUnwindSafe(checker.run(target, check_timeout, params)).catch_unwind();
        match timeout(check_timeout + self.grace, run).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(payload)) => Err(LoopFault::from_panic(payload)),
            Err(_) => {
                tracing::debug!(kind, target, "Checker overran its deadline");
                Ok(Outcome::down(format!(
                    "check did not finish within {:.1}s",
                    check_timeout.as_secs_f64()
                )))
            }
        }
    }
}
