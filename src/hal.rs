//! Narrow hardware seams used by the watchdog supervisor, plus host
//! implementations for the simulator and tests.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Independent hardware timer. Once armed it cannot be disabled again.
pub trait HardwareWatchdog: Send {
    fn arm(&mut self, timeout_ms: u32);
    fn reload(&mut self);
}

/// Reset-cause register as seen on boot.
pub trait ResetCause: Send {
    fn was_watchdog_reset(&self) -> bool;
    fn clear(&mut self);
}

pub trait SchedulerProbe: Send + Sync {
    fn is_running(&self) -> bool;
}

/// Monotonic milliseconds since some fixed origin.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_ms)) }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

#[derive(Debug, Default)]
struct WatchdogRegisters {
    armed_timeout_ms: Option<u32>,
    last_reload_ms: u64,
    arm_count: u32,
    reload_count: u32,
}

/// Host stand-in for the hardware timer. Records every arm and reload and
/// reports expiry against the supplied clock.
#[derive(Clone)]
pub struct SimulatedWatchdog {
    regs: Arc<Mutex<WatchdogRegisters>>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for SimulatedWatchdog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedWatchdog").field("regs", &*self.regs.lock()).finish()
    }
}

impl SimulatedWatchdog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { regs: Arc::new(Mutex::new(WatchdogRegisters::default())), clock }
    }

    pub fn is_armed(&self) -> bool {
        self.regs.lock().armed_timeout_ms.is_some()
    }

    pub fn arm_count(&self) -> u32 {
        self.regs.lock().arm_count
    }

    pub fn reload_count(&self) -> u32 {
        self.regs.lock().reload_count
    }

    /// True once an armed timer has gone a full timeout without reload.
    pub fn expired(&self) -> bool {
        let regs = self.regs.lock();
        match regs.armed_timeout_ms {
            Some(timeout) => {
                self.clock.now_ms().saturating_sub(regs.last_reload_ms) > u64::from(timeout)
            }
            None => false,
        }
    }
}

impl HardwareWatchdog for SimulatedWatchdog {
    fn arm(&mut self, timeout_ms: u32) {
        let mut regs = self.regs.lock();
        if regs.armed_timeout_ms.is_some() {
            warn!("hardware watchdog already armed, ignoring re-arm");
            return;
        }
        regs.armed_timeout_ms = Some(timeout_ms);
        regs.last_reload_ms = self.clock.now_ms();
        regs.arm_count += 1;
        debug!(timeout_ms, "hardware watchdog armed");
    }

    fn reload(&mut self) {
        let mut regs = self.regs.lock();
        regs.last_reload_ms = self.clock.now_ms();
        regs.reload_count += 1;
    }
}

/// In-memory reset-cause flag.
#[derive(Debug, Clone, Default)]
pub struct SimulatedResetCause {
    watchdog_reset: Arc<AtomicBool>,
    clears: Arc<AtomicU32>,
}

impl SimulatedResetCause {
    pub fn new(watchdog_reset: bool) -> Self {
        Self {
            watchdog_reset: Arc::new(AtomicBool::new(watchdog_reset)),
            clears: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn clear_count(&self) -> u32 {
        self.clears.load(Ordering::SeqCst)
    }
}

impl ResetCause for SimulatedResetCause {
    fn was_watchdog_reset(&self) -> bool {
        self.watchdog_reset.load(Ordering::SeqCst)
    }

    fn clear(&mut self) {
        self.watchdog_reset.store(false, Ordering::SeqCst);
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reset cause persisted as a marker file so a simulated watchdog reset
/// survives the process exit and is seen on the next boot.
#[derive(Debug, Clone)]
pub struct ResetMarkerFile {
    path: PathBuf,
}

impl ResetMarkerFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leaves the marker behind. Called right before a simulated reset.
    pub fn mark(&self) -> std::io::Result<()> {
        std::fs::write(&self.path, b"watchdog\n")
    }
}

impl ResetCause for ResetMarkerFile {
    fn was_watchdog_reset(&self) -> bool {
        self.path.exists()
    }

    fn clear(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "could not clear reset marker"),
        }
    }
}

/// Scheduler state that the runtime flips on start and off on shutdown.
#[derive(Debug, Clone, Default)]
pub struct SchedulerFlag {
    running: Arc<AtomicBool>,
}

impl SchedulerFlag {
    pub fn new(running: bool) -> Self {
        Self { running: Arc::new(AtomicBool::new(running)) }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl SchedulerProbe for SchedulerFlag {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
