use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::MonitoringExecutor;
use super::incident::{Evaluation, IncidentEngine, Thresholds};
use super::streak::StreakState;
use super::types::{CheckRecord, CheckSpec};
use crate::database::{CheckSource, IncidentStore, ResultSink};
use crate::error::{LoopFault, SchedulerError};
use crate::events::{Event, EventHub};

pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(1500);

/// Tunables shared by every polling loop
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Global defaults; per-check params may override them
    pub thresholds: Thresholds,
    /// Cap on the initial delay before a loop's first poll
    pub max_jitter: Duration,
    /// Restarts allowed after a loop fault; 0 means the loop stays down
    pub max_loop_restarts: u32,
    pub restart_backoff_base: Duration,
    pub restart_backoff_max: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            max_jitter: DEFAULT_MAX_JITTER,
            max_loop_restarts: 0,
            restart_backoff_base: Duration::from_secs(1),
            restart_backoff_max: Duration::from_secs(60),
        }
    }
}

impl SchedulerSettings {
    /// Delay before the n-th restart (1-based), doubling up to the cap
    pub fn restart_backoff(&self, restart: u32) -> Duration {
        let factor = 2u32.saturating_pow(restart.saturating_sub(1));
        self.restart_backoff_base.saturating_mul(factor).min(self.restart_backoff_max)
    }
}

/// Spread loop start-up: min(cap, interval / 10)
pub fn initial_jitter(interval: Duration, cap: Duration) -> Duration {
    (interval / 10).min(cap)
}

/// Everything a polling loop touches besides its own streak
struct LoopContext {
    executor: Arc<MonitoringExecutor>,
    results: Arc<dyn ResultSink>,
    engine: IncidentEngine,
    hub: EventHub,
    settings: SchedulerSettings,
}

#[derive(Default)]
struct RunState {
    started: bool,
    /// Cancels every loop of the current generation
    shutdown: CancellationToken,
    loops: HashMap<i64, JoinHandle<()>>,
}

/// Monitoring scheduler - runs one polling loop per active check.
///
/// `start`, `reload` and `stop` are serialized on the run state lock, so a
/// check never has two live loops.
pub struct MonitoringScheduler {
    checks: Arc<dyn CheckSource>,
    context: Arc<LoopContext>,
    state: Mutex<RunState>,
}

impl MonitoringScheduler {
    pub fn new(
        checks: Arc<dyn CheckSource>,
        results: Arc<dyn ResultSink>,
        incidents: Arc<dyn IncidentStore>,
        executor: Arc<MonitoringExecutor>,
        hub: EventHub,
        settings: SchedulerSettings,
    ) -> Self {
        let context =
            LoopContext { executor, results, engine: IncidentEngine::new(incidents), hub, settings };
        Self { checks, context: Arc::new(context), state: Mutex::new(RunState::default()) }
    }

    /// Spawn a loop for every active check; returns how many were spawned
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        let mut state = self.state.lock().await;
        if state.started {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.spawn_generation(&mut state).await
    }

    /// Cancel and join every loop, then start fresh ones from the current check set
    pub async fn reload(&self) -> Result<usize, SchedulerError> {
        let mut state = self.state.lock().await;
        let stopped = Self::shutdown_generation(&mut state).await;
        debug!(stopped, "Reloading monitoring scheduler");
        self.spawn_generation(&mut state).await
    }

    /// Cancel and join every loop. No-op when nothing is running.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let stopped = Self::shutdown_generation(&mut state).await;
        if stopped > 0 {
            info!(stopped, "Monitoring scheduler stopped");
        }
    }

    /// Ids of checks whose loop is still alive, sorted
    pub async fn running_checks(&self) -> Vec<i64> {
        let state = self.state.lock().await;
        let mut ids: Vec<i64> =
            state.loops.iter().filter(|(_, handle)| !handle.is_finished()).map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }

    async fn spawn_generation(&self, state: &mut RunState) -> Result<usize, SchedulerError> {
        let specs = self.checks.list_active_checks().await.map_err(SchedulerError::Source)?;

        let shutdown = CancellationToken::new();
        let mut loops = HashMap::with_capacity(specs.len());
        for spec in specs {
            let check_id = spec.check_id;
            let handle = tokio::spawn(supervise(Arc::clone(&self.context), spec, shutdown.child_token()));
            if let Some(previous) = loops.insert(check_id, handle) {
                warn!(check_id, "Check listed twice, keeping the last definition");
                previous.abort();
            }
        }

        let count = loops.len();
        *state = RunState { started: true, shutdown, loops };
        info!(checks = count, "Monitoring scheduler started");
        Ok(count)
    }

    async fn shutdown_generation(state: &mut RunState) -> usize {
        let RunState { shutdown, loops, .. } = std::mem::take(state);
        shutdown.cancel();

        let count = loops.len();
        for (check_id, handle) in loops {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(check_id, error = %e, "Polling loop ended abnormally");
                }
            }
        }
        count
    }
}

/// Run a check's polling loop, restarting it after faults while the policy allows
async fn supervise(ctx: Arc<LoopContext>, spec: CheckSpec, shutdown: CancellationToken) {
    let mut restarts = 0;

    loop {
        // A panic in a collaborator or in event building is a fault like any other
        let fault = match AssertUnwindSafe(poll_loop(&ctx, &spec, &shutdown)).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(fault)) => fault,
            Err(payload) => LoopFault::from_panic(payload),
        };

        error!(
            check_id = spec.check_id,
            device_id = spec.device_id,
            kind = %spec.kind,
            error = %fault,
            "Polling loop failed"
        );
        ctx.hub.broadcast(Event::scheduler_error(&spec, &fault));

        // Nothing changes for an unknown kind until the next reload
        let permanent = matches!(fault, LoopFault::UnknownKind(_));
        if permanent || restarts >= ctx.settings.max_loop_restarts {
            return;
        }
        restarts += 1;

        let backoff = ctx.settings.restart_backoff(restarts);
        warn!(check_id = spec.check_id, restarts, backoff_ms = backoff.as_millis() as u64, "Restarting polling loop");
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = sleep(backoff) => {}
        }
    }
}

/// Poll until cancelled. Cancellation at any await point ends the loop quietly.
async fn poll_loop(ctx: &LoopContext, spec: &CheckSpec, shutdown: &CancellationToken) -> Result<(), LoopFault> {
    if !ctx.executor.supports(&spec.kind) {
        return Err(LoopFault::UnknownKind(spec.kind.clone()));
    }

    let thresholds = ctx.settings.thresholds.with_overrides(&spec.params);
    let mut streak = StreakState::default();

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Ok(()),
        _ = sleep(initial_jitter(spec.interval, ctx.settings.max_jitter)) => {}
    }

    loop {
        let poll_started = Instant::now();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            polled = poll_once(ctx, spec, thresholds, streak) => streak = polled?,
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            _ = sleep_until(poll_started + spec.interval) => {}
        }
    }
}

/// One poll: execute, record, fold the streak, evaluate incidents, publish
async fn poll_once(
    ctx: &LoopContext,
    spec: &CheckSpec,
    thresholds: Thresholds,
    streak: StreakState,
) -> Result<StreakState, LoopFault> {
    let outcome = ctx.executor.execute(&spec.kind, &spec.host, spec.timeout, &spec.params).await?;
    let ts = Utc::now();

    let record = CheckRecord::from_outcome(spec.check_id, ts, &outcome);
    if let Err(e) = ctx.results.store(&record).await {
        warn!(check_id = spec.check_id, error = %e, "Failed to store check result");
    }

    let streak = streak.advance(outcome.status);
    debug!(
        check_id = spec.check_id,
        status = %outcome.status,
        latency_ms = ?outcome.latency_ms,
        down_streak = streak.down,
        up_streak = streak.up,
        "Check polled"
    );

    let evaluation = Evaluation {
        device_id: spec.device_id,
        check_id: spec.check_id,
        ts,
        status: outcome.status,
        streak,
        thresholds,
    };
    let transition = ctx.engine.evaluate(&evaluation).await.map_err(LoopFault::Incident)?;

    ctx.hub.broadcast(Event::result(spec, ts, &outcome, streak));
    if let Some(event) = transition {
        ctx.hub.broadcast(event);
    }

    Ok(streak)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_a_tenth_of_the_interval_capped() {
        let cap = DEFAULT_MAX_JITTER;
        assert_eq!(initial_jitter(Duration::from_secs(5), cap), Duration::from_millis(500));
        assert_eq!(initial_jitter(Duration::from_secs(30), cap), cap);
        assert_eq!(initial_jitter(Duration::from_secs(15), cap), cap);
    }

    #[test]
    fn restart_backoff_doubles_up_to_the_cap() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.restart_backoff(1), Duration::from_secs(1));
        assert_eq!(settings.restart_backoff(2), Duration::from_secs(2));
        assert_eq!(settings.restart_backoff(3), Duration::from_secs(4));
        assert_eq!(settings.restart_backoff(7), Duration::from_secs(60));
        assert_eq!(settings.restart_backoff(u32::MAX), Duration::from_secs(60));
    }
}
