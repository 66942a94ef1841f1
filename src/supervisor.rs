//! Keeps one Dolt server alive and writable.
//!
//! [`Supervisor::ensure_running`] is called on every heartbeat. All state
//! lives behind one mutex, and the only wait that releases it is the
//! backoff sleep: heartbeats arriving during that sleep see `restarting`
//! and return at once instead of queueing behind it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::error::ExitError;
use crate::retry::RetryPolicy;
use crate::server::ServerControl;
use crate::signal::{SignalReason, UnhealthySignal};
use crate::sql::{ProbeOutcome, ReadOnlyRecovery};

/// Out-of-band notifications. Implementations must not block for long:
/// they run with the supervisor lock held.
pub trait Alerts: Send + Sync {
    /// Restart cap hit. Called once per incident.
    fn escalate(&self, restarts: usize, window: Duration);
    fn read_only(&self, error: &str);
    fn unhealthy(&self, error: &str);
}

/// Alerts that only log.
#[derive(Debug, Default)]
pub struct LogAlerts;

impl Alerts for LogAlerts {
    fn escalate(&self, restarts: usize, window: Duration) {
        tracing::error!(
            restarts,
            window_secs = window.as_secs(),
            "dolt server restart cap exceeded, manual intervention required"
        );
    }

    fn read_only(&self, error: &str) {
        tracing::error!(error, "dolt server is read-only");
    }

    fn unhealthy(&self, error: &str) {
        tracing::error!(error, "dolt server failed health check");
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, d: Duration) {
        thread::sleep(d);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub window: Duration,
    pub max_restarts: usize,
    pub healthy_reset: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            base: config.restart_delay,
            max: config.max_restart_delay,
            window: config.restart_window,
            max_restarts: config.max_restarts_in_window,
            healthy_reset: config.healthy_reset_interval,
        }
    }
}

/// Restart bookkeeping. `current_delay` is zero ("use base") or within
/// `[base, max]`.
#[derive(Debug, Default, Clone)]
pub struct BackoffState {
    pub current_delay: Duration,
    pub restart_times: Vec<Instant>,
    pub escalated: bool,
    /// Start of the current healthy streak. Not refreshed per heartbeat.
    pub last_healthy: Option<Instant>,
    pub restarting: bool,
}

impl BackoffState {
    pub fn delay(&self, policy: &BackoffPolicy) -> Duration {
        if self.current_delay.is_zero() {
            policy.base
        } else {
            self.current_delay
        }
    }

    pub fn advance(&mut self, policy: &BackoffPolicy) {
        let next = self.delay(policy).saturating_mul(2);
        self.current_delay = next.min(policy.max);
    }

    pub fn prune(&mut self, now: Instant, window: Duration) {
        self.restart_times
            .retain(|t| now.saturating_duration_since(*t) < window);
    }

    /// Record the start of a healthy streak, or reset everything once the
    /// streak has lasted `policy.healthy_reset`.
    pub fn maybe_reset(&mut self, now: Instant, policy: &BackoffPolicy) {
        match self.last_healthy {
            None => self.last_healthy = Some(now),
            Some(since) if now.saturating_duration_since(since) >= policy.healthy_reset => {
                let backed_off = !self.current_delay.is_zero()
                    || !self.restart_times.is_empty()
                    || self.escalated;
                if backed_off {
                    tracing::info!(
                        healthy_secs = now.saturating_duration_since(since).as_secs(),
                        "sustained health, resetting restart backoff"
                    );
                }
                self.current_delay = Duration::ZERO;
                self.restart_times.clear();
                self.escalated = false;
                self.last_healthy = Some(now);
            }
            Some(_) => {}
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(
        "restart cap exceeded: {count} restarts within {}s, manual intervention required",
        window.as_secs()
    )]
    RestartCapExceeded { count: usize, window: Duration },
    #[error("starting dolt server: {0:#}")]
    Start(anyhow::Error),
    #[error("dolt server still read-only after restart: {0}")]
    StillReadOnly(String),
}

impl SupervisorError {
    /// Convert for the CLI, mapping the restart cap to its exit code.
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            Self::RestartCapExceeded { count, window } => ExitError::RestartCapExceeded {
                count,
                window_secs: window.as_secs(),
            }
            .into(),
            other => other.into(),
        }
    }
}

pub struct Supervisor {
    policy: BackoffPolicy,
    server: Arc<dyn ServerControl>,
    alerts: Arc<dyn Alerts>,
    clock: Arc<dyn Clock>,
    signal: UnhealthySignal,
    verify: RetryPolicy,
    state: Mutex<BackoffState>,
}

impl Supervisor {
    pub fn new(config: &ServerConfig, server: Arc<dyn ServerControl>) -> Self {
        Self {
            policy: BackoffPolicy::from_config(config),
            server,
            alerts: Arc::new(LogAlerts),
            clock: Arc::new(SystemClock),
            signal: UnhealthySignal::new(&config.paths),
            verify: RetryPolicy::RECOVERY,
            state: Mutex::new(BackoffState::default()),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn Alerts>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_verify_policy(mut self, verify: RetryPolicy) -> Self {
        self.verify = verify;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Copy of the current backoff bookkeeping.
    pub fn snapshot(&self) -> BackoffState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, BackoffState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One heartbeat: verify the server is up, answering and writable,
    /// restarting it with backoff if not.
    pub fn ensure_running(&self) -> Result<(), SupervisorError> {
        let mut state = self.lock_state();
        if state.restarting {
            tracing::debug!("restart already in progress");
            return Ok(());
        }

        if !self.server.is_running() {
            tracing::warn!("dolt server not running, restarting");
            let _ = self
                .signal
                .write(SignalReason::ServerDead, "dolt server process is not running");
            return self.restart_with_backoff(state);
        }

        if let Err(e) = self.server.health_check() {
            let msg = format!("{e:#}");
            tracing::warn!(error = %msg, "dolt server unhealthy, restarting");
            let _ = self.signal.write(SignalReason::Unhealthy, &msg);
            self.alerts.unhealthy(&msg);
            self.stop_logged();
            return self.restart_with_backoff(state);
        }

        match self.server.write_probe() {
            ProbeOutcome::ReadOnly(msg) => {
                tracing::error!(error = %msg, "dolt server is read-only, restarting");
                let _ = self.signal.write(SignalReason::ReadOnly, &msg);
                self.alerts.read_only(&msg);
                self.stop_logged();
                return self.restart_with_backoff(state);
            }
            ProbeOutcome::Failed(msg) => {
                // Inconclusive; leave the signal and healthy streak alone.
                tracing::warn!(error = %msg, "write probe failed without a read-only signature");
                return Ok(());
            }
            ProbeOutcome::NoDatabase => tracing::debug!("no databases to probe"),
            ProbeOutcome::Writable => {}
        }

        let now = self.clock.now();
        state.maybe_reset(now, &self.policy);
        let _ = self.signal.clear();
        Ok(())
    }

    fn stop_logged(&self) {
        if let Err(e) = self.server.stop() {
            tracing::warn!(error = %format!("{e:#}"), "stopping dolt server before restart failed");
        }
    }

    fn restart_with_backoff(
        &self,
        mut state: MutexGuard<'_, BackoffState>,
    ) -> Result<(), SupervisorError> {
        state.restarting = true;
        state.last_healthy = None;

        state.prune(self.clock.now(), self.policy.window);
        let count = state.restart_times.len();
        if count >= self.policy.max_restarts {
            if !state.escalated {
                state.escalated = true;
                self.alerts.escalate(count, self.policy.window);
            }
            state.restarting = false;
            return Err(SupervisorError::RestartCapExceeded {
                count,
                window: self.policy.window,
            });
        }

        let delay = state.delay(&self.policy);
        drop(state);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(delay_ms, "waiting before restart");
        self.clock.sleep(delay);

        let mut state = self.lock_state();
        state.advance(&self.policy);

        if self.server.is_running() {
            tracing::info!("dolt server came up during backoff, skipping start");
            state.restarting = false;
            return Ok(());
        }

        let result = self.server.start();
        state.restart_times.push(self.clock.now());
        state.restarting = false;
        match result {
            Ok(()) => {
                tracing::info!(
                    restarts_in_window = state.restart_times.len(),
                    "dolt server restarted"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "dolt server restart failed");
                Err(SupervisorError::Start(e))
            }
        }
    }

    /// Probe; if read-only, restart through the backoff path and wait until
    /// the server accepts writes again.
    pub fn recover_from_read_only(&self) -> Result<(), SupervisorError> {
        let msg = match self.server.write_probe() {
            ProbeOutcome::ReadOnly(msg) => msg,
            ProbeOutcome::Failed(msg) => {
                tracing::warn!(error = %msg, "write probe failed, but not read-only; no restart");
                return Ok(());
            }
            ProbeOutcome::Writable | ProbeOutcome::NoDatabase => return Ok(()),
        };

        tracing::warn!(error = %msg, "read-only server, recovering");
        let _ = self.signal.write(SignalReason::ReadOnly, &msg);
        self.alerts.read_only(&msg);

        let state = self.lock_state();
        if state.restarting {
            drop(state);
            tracing::info!("restart already in progress, waiting for writability");
        } else {
            self.stop_logged();
            self.restart_with_backoff(state)?;
        }

        let mut last = msg;
        for attempt in 1..=self.verify.max_attempts.max(1) {
            match self.server.write_probe() {
                ProbeOutcome::Writable | ProbeOutcome::NoDatabase => {
                    let _ = self.signal.clear();
                    tracing::info!(attempt, "dolt server writable again");
                    return Ok(());
                }
                ProbeOutcome::ReadOnly(m) | ProbeOutcome::Failed(m) => last = m,
            }
            if attempt < self.verify.max_attempts {
                self.clock.sleep(self.verify.delay_for(attempt));
            }
        }
        Err(SupervisorError::StillReadOnly(last))
    }

    /// Heartbeat until `shutdown` is set. Errors are logged and the loop
    /// continues; the restart cap keeps it from restarting in a tight loop.
    pub fn run(&self, interval: Duration, shutdown: &AtomicBool) {
        tracing::info!(interval_secs = interval.as_secs(), "supervisor started");
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.ensure_running() {
                tracing::error!(error = %e, "heartbeat failed");
            }
            let deadline = Instant::now() + interval;
            while !shutdown.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(100).min(interval));
            }
        }
        tracing::info!("supervisor stopped");
    }
}

impl ReadOnlyRecovery for Supervisor {
    fn recover_read_only(&self) -> anyhow::Result<()> {
        self.recover_from_read_only().map_err(SupervisorError::into_anyhow)
    }
}
