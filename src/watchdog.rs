use crate::config::WatchdogConfig;
use crate::hal::{Clock, HardwareWatchdog, ResetCause, SchedulerProbe};
use crate::peripherals::Uplink;
use crate::protocol::Outbound;
use crate::supervision::{ErrorKind, SupervisionNotifier};
use heapless::Vec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const MAX_TASKS: usize = 6;

/// Consecutive failed checks after which a task is reported as hung.
pub const HANG_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskId {
    Orchestrator,
    Keypad,
    Display,
    NetworkLink,
    Motor,
    StockSensor,
}

impl TaskId {
    pub const ALL: [TaskId; MAX_TASKS] = [
        TaskId::Orchestrator,
        TaskId::Keypad,
        TaskId::Display,
        TaskId::NetworkLink,
        TaskId::Motor,
        TaskId::StockSensor,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskId::Orchestrator => "orchestrator",
            TaskId::Keypad => "keypad",
            TaskId::Display => "display",
            TaskId::NetworkLink => "network-link",
            TaskId::Motor => "motor",
            TaskId::StockSensor => "stock-sensor",
        }
    }

    /// Optional tasks are switched off in degraded mode.
    pub fn is_optional(self) -> bool {
        matches!(self, TaskId::Motor | TaskId::StockSensor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WatchdogError {
    #[error("watchdog supervisor not initialized")]
    NotInitialized,
    #[error("task table full")]
    TableFull,
    #[error("task {0:?} is not registered")]
    NotRegistered(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorPhase {
    Uninitialized,
    Initialized,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskHealth {
    pub id: TaskId,
    pub name: &'static str,
    pub max_interval_ms: u32,
    pub last_heartbeat_ms: u64,
    pub enabled: bool,
    pub alive: bool,
    pub missed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogStats {
    pub resets: u32,
    pub refreshes: u32,
    pub missed_refreshes: u32,
    pub uptime_ms: u64,
    pub last_reset_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Reloaded,
    /// Health check failed, the hardware timer was left to run down.
    Withheld,
    /// Supervisor not started yet.
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub watchdog_reset: bool,
    pub degraded: bool,
    pub resets: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: &'static str,
    pub alive: bool,
    pub elapsed_ms: u64,
    pub missed: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogReport {
    pub phase: SupervisorPhase,
    pub degraded: bool,
    pub stats: WatchdogStats,
    pub tasks: alloc::vec::Vec<TaskStatus>,
}

/// Hardware the supervisor drives.
pub struct WatchdogHardware {
    pub watchdog: Box<dyn HardwareWatchdog>,
    pub reset_cause: Box<dyn ResetCause>,
    pub scheduler: Arc<dyn SchedulerProbe>,
    pub clock: Arc<dyn Clock>,
}

struct Inner {
    phase: SupervisorPhase,
    degraded: bool,
    tasks: Vec<TaskHealth, MAX_TASKS>,
    resets: u32,
    refreshes: u32,
    missed_refreshes: u32,
    last_reset_ms: Option<u64>,
    start_ms: u64,
    watchdog: Box<dyn HardwareWatchdog>,
    reset_cause: Box<dyn ResetCause>,
    notifier: Option<SupervisionNotifier>,
}

impl Inner {
    fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskHealth> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn notify(&mut self, kind: ErrorKind, message: &str, now_ms: u64) -> Option<Outbound> {
        self.notifier.as_mut()?.prepare(kind, message, now_ms)
    }
}

/// Tracks task liveness and reloads the hardware watchdog only while every
/// enabled task is alive. All methods take `&self` so the supervisor can be
/// shared behind an `Arc` by every task that heartbeats.
pub struct WatchdogSupervisor {
    config: WatchdogConfig,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn SchedulerProbe>,
    inner: Mutex<Inner>,
    uplink: Mutex<Option<Box<dyn Uplink + Send>>>,
}

impl core::fmt::Debug for WatchdogSupervisor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WatchdogSupervisor")
            .field("phase", &inner.phase)
            .field("degraded", &inner.degraded)
            .field("tasks", &inner.tasks)
            .finish()
    }
}

impl WatchdogSupervisor {
    pub fn new(config: WatchdogConfig, hardware: WatchdogHardware) -> Self {
        Self {
            config,
            clock: hardware.clock,
            scheduler: hardware.scheduler,
            inner: Mutex::new(Inner {
                phase: SupervisorPhase::Uninitialized,
                degraded: false,
                tasks: Vec::new(),
                resets: 0,
                refreshes: 0,
                missed_refreshes: 0,
                last_reset_ms: None,
                start_ms: 0,
                watchdog: hardware.watchdog,
                reset_cause: hardware.reset_cause,
                notifier: None,
            }),
            uplink: Mutex::new(None),
        }
    }

    /// Sends supervision notifications through `uplink`.
    pub fn with_notifications(self, notifier: SupervisionNotifier, uplink: Box<dyn Uplink + Send>) -> Self {
        self.inner.lock().notifier = Some(notifier);
        *self.uplink.lock() = Some(uplink);
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Boot-time reset-cause handling. Safe to call more than once.
    pub fn init(&self) -> BootReport {
        let now = self.clock.now_ms();
        let outbound = {
            let mut inner = self.inner.lock();
            if inner.phase != SupervisorPhase::Uninitialized {
                return BootReport { watchdog_reset: false, degraded: inner.degraded, resets: inner.resets };
            }

            let watchdog_reset = inner.reset_cause.was_watchdog_reset();
            let mut outbound = None;
            if watchdog_reset {
                inner.resets = inner.resets.saturating_add(1);
                inner.last_reset_ms = Some(now);
                warn!(total = inner.resets, "previous reset was caused by the watchdog");
                Self::enter_degraded_mode(&mut inner);
                inner.reset_cause.clear();
                outbound = inner.notify(
                    ErrorKind::WatchdogReset,
                    "recovered from watchdog reset, optional tasks disabled",
                    now,
                );
            }

            inner.start_ms = now;
            inner.phase = SupervisorPhase::Initialized;
            info!(degraded = inner.degraded, "watchdog supervisor initialized");
            outbound
        };
        self.send(outbound);

        let inner = self.inner.lock();
        BootReport { watchdog_reset: inner.last_reset_ms.is_some(), degraded: inner.degraded, resets: inner.resets }
    }

    fn enter_degraded_mode(inner: &mut Inner) {
        inner.degraded = true;
        for task in inner.tasks.iter_mut().filter(|t| t.id.is_optional()) {
            task.enabled = false;
        }
        info!("degraded mode: optional tasks disabled");
    }

    /// Adds `id` to the table, or resets its entry if already present.
    pub fn register(&self, id: TaskId, max_interval_ms: u32) -> Result<(), WatchdogError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let enabled = !(inner.degraded && id.is_optional());

        if let Some(task) = inner.task_mut(id) {
            task.max_interval_ms = max_interval_ms;
            task.last_heartbeat_ms = now;
            task.enabled = enabled;
            task.alive = true;
            task.missed = 0;
            debug!(task = id.name(), max_interval_ms, "task re-registered");
            return Ok(());
        }

        inner
            .tasks
            .push(TaskHealth {
                id,
                name: id.name(),
                max_interval_ms,
                last_heartbeat_ms: now,
                enabled,
                alive: true,
                missed: 0,
            })
            .map_err(|_| WatchdogError::TableFull)?;
        info!(task = id.name(), max_interval_ms, enabled, "task registered");
        Ok(())
    }

    pub fn heartbeat(&self, id: TaskId) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        if let Some(task) = inner.task_mut(id) {
            task.last_heartbeat_ms = now;
            task.alive = true;
            if task.missed > 0 {
                debug!(task = id.name(), missed = task.missed, "task recovered");
                task.missed = 0;
            }
        }
    }

    pub fn enable_task(&self, id: TaskId, enable: bool) -> Result<(), WatchdogError> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id).ok_or(WatchdogError::NotRegistered(id))?;
        if enable && !task.enabled {
            // Fresh baseline, otherwise the task is dead on arrival
            task.last_heartbeat_ms = now;
            task.missed = 0;
        }
        task.enabled = enable;
        info!(task = id.name(), enable, "task monitoring changed");
        Ok(())
    }

    /// Recomputes liveness for every enabled task. True only if all of them
    /// are alive and the scheduler is running. Missed checks are counted by
    /// `refresh` only, so extra calls here do not advance a task towards
    /// [`HANG_THRESHOLD`].
    pub fn check_health(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_health_locked(&mut inner, false)
    }

    fn check_health_locked(&self, inner: &mut Inner, count_missed: bool) -> bool {
        let now = self.clock.now_ms();
        let mut healthy = true;

        for task in inner.tasks.iter_mut().filter(|t| t.enabled) {
            let elapsed = now.saturating_sub(task.last_heartbeat_ms);
            if elapsed > u64::from(task.max_interval_ms) {
                task.alive = false;
                healthy = false;
                if !count_missed {
                    debug!(task = task.name, elapsed, "task unresponsive");
                    continue;
                }
                task.missed = task.missed.saturating_add(1);
                if task.missed == HANG_THRESHOLD {
                    error!(task = task.name, elapsed, "task appears hung");
                } else {
                    warn!(task = task.name, elapsed, missed = task.missed, "task unresponsive");
                }
            } else {
                task.alive = true;
            }
        }

        if !self.scheduler.is_running() {
            error!("scheduler not running");
            healthy = false;
        }
        healthy
    }

    /// Reloads the hardware watchdog if the system is healthy. Otherwise the
    /// reload is withheld and the hardware timer is allowed to expire.
    pub fn refresh(&self) -> RefreshOutcome {
        let now = self.clock.now_ms();
        let (outcome, outbound) = {
            let mut inner = self.inner.lock();
            if inner.phase != SupervisorPhase::Started {
                return RefreshOutcome::Inactive;
            }

            if self.check_health_locked(&mut inner, true) {
                inner.watchdog.reload();
                inner.refreshes = inner.refreshes.wrapping_add(1);
                debug!(total = inner.refreshes, "watchdog reloaded");
                (RefreshOutcome::Reloaded, None)
            } else {
                inner.missed_refreshes = inner.missed_refreshes.wrapping_add(1);
                warn!(missed = inner.missed_refreshes, "watchdog reload withheld, system unhealthy");

                let dead: alloc::vec::Vec<&str> = inner
                    .tasks
                    .iter()
                    .filter(|t| t.enabled && !t.alive)
                    .map(|t| t.name)
                    .collect();
                let message = if dead.is_empty() {
                    "scheduler not running".to_string()
                } else {
                    format!("unresponsive: {}", dead.join(","))
                };
                let outbound = inner.notify(ErrorKind::WatchdogTimeout, &message, now);
                (RefreshOutcome::Withheld, outbound)
            }
        };
        self.send(outbound);
        outcome
    }

    /// Arms the hardware watchdog. From here on it cannot be stopped.
    pub fn start(&self) -> Result<(), WatchdogError> {
        let mut inner = self.inner.lock();
        match inner.phase {
            SupervisorPhase::Uninitialized => Err(WatchdogError::NotInitialized),
            SupervisorPhase::Started => Ok(()),
            SupervisorPhase::Initialized => {
                let timeout = self.config.hardware_timeout_ms;
                inner.watchdog.arm(timeout);
                inner.phase = SupervisorPhase::Started;
                info!(timeout_ms = timeout, "hardware watchdog started");
                Ok(())
            }
        }
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.inner.lock().phase
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.lock().degraded
    }

    pub fn is_task_alive(&self, id: TaskId) -> bool {
        self.inner.lock().tasks.iter().any(|t| t.id == id && t.alive)
    }

    pub fn task_health(&self, id: TaskId) -> Option<TaskHealth> {
        self.inner.lock().tasks.iter().find(|t| t.id == id).copied()
    }

    pub fn stats(&self) -> WatchdogStats {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        WatchdogStats {
            resets: inner.resets,
            refreshes: inner.refreshes,
            missed_refreshes: inner.missed_refreshes,
            uptime_ms: now.saturating_sub(inner.start_ms),
            last_reset_ms: inner.last_reset_ms,
        }
    }

    pub fn report(&self) -> WatchdogReport {
        let now = self.clock.now_ms();
        let stats = self.stats();
        let inner = self.inner.lock();
        WatchdogReport {
            phase: inner.phase,
            degraded: inner.degraded,
            stats,
            tasks: inner
                .tasks
                .iter()
                .filter(|t| t.enabled)
                .map(|t| TaskStatus {
                    name: t.name,
                    alive: t.alive,
                    elapsed_ms: now.saturating_sub(t.last_heartbeat_ms),
                    missed: t.missed,
                })
                .collect(),
        }
    }

    pub fn log_status(&self) {
        let report = self.report();
        info!(
            uptime_ms = report.stats.uptime_ms,
            resets = report.stats.resets,
            refreshes = report.stats.refreshes,
            missed = report.stats.missed_refreshes,
            degraded = report.degraded,
            "watchdog status"
        );
        for task in &report.tasks {
            info!(
                task = task.name,
                alive = task.alive,
                elapsed_ms = task.elapsed_ms,
                missed = task.missed,
                "  monitored task"
            );
        }
    }

    fn send(&self, outbound: Option<Outbound>) {
        let Some(outbound) = outbound else { return };
        if let Some(uplink) = self.uplink.lock().as_mut() {
            if let Err(e) = uplink.send(&outbound) {
                warn!(error = %e, "supervision notification not sent");
            }
        }
    }

    /// Supervisor task: waits for the other tasks to come up, arms the
    /// hardware, then refreshes on a fixed period.
    pub async fn run(self: Arc<Self>) {
        if self.phase() == SupervisorPhase::Uninitialized {
            self.init();
        }
        info!("watchdog task started");
        tokio::time::sleep(self.config.startup_delay()).await;

        if let Err(e) = self.start() {
            error!(error = %e, "watchdog could not start");
            return;
        }

        let every = self.config.status_every_cycles.max(1);
        let mut cycles: u32 = 0;
        loop {
            self.refresh();
            cycles = cycles.wrapping_add(1);
            if cycles % every == 0 {
                self.log_status();
            }
            tokio::time::sleep(self.config.refresh_interval()).await;
        }
    }
}
