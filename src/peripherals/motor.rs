use super::{MotorDriver, MotorError};
use crate::bus::{BusError, EventPublisher};
use crate::catalog::Channel;
use crate::event::Event;
use crate::watchdog::{TaskId, WatchdogSupervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Settle time after switching the multiplexer select lines.
const MUX_SETTLE: Duration = Duration::from_millis(20);

/// A run's outcome is retried on a full bus for up to
/// `REPORT_ATTEMPTS * REPORT_RETRY`, longer than any orchestrator message hold.
pub const REPORT_ATTEMPTS: u32 = 100;
pub const REPORT_RETRY: Duration = Duration::from_millis(50);

/// Four select lines plus one drive signal.
pub trait MotorMux: Send {
    fn select(&mut self, channel: Channel);
    fn set_drive(&mut self, on: bool);
}

/// Host multiplexer: logs the select bits and counts completed runs.
#[derive(Debug, Default)]
pub struct TracingMux {
    selected: Option<Channel>,
    driving: bool,
    runs: u32,
}

impl TracingMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }
}

impl MotorMux for TracingMux {
    fn select(&mut self, channel: Channel) {
        let i = channel.index();
        debug!(
            s3 = (i >> 3) & 1,
            s2 = (i >> 2) & 1,
            s1 = (i >> 1) & 1,
            s0 = i & 1,
            channel = i,
            "mux select"
        );
        self.selected = Some(channel);
    }

    fn set_drive(&mut self, on: bool) {
        if self.driving && !on {
            self.runs = self.runs.wrapping_add(1);
        }
        self.driving = on;
        debug!(on, channel = ?self.selected.map(Channel::index), "motor drive");
    }
}

/// Orchestrator-side handle onto the motor queue.
#[derive(Debug, Clone)]
pub struct MotorHandle {
    tx: mpsc::Sender<Channel>,
}

impl MotorDriver for MotorHandle {
    fn start_delivery(&mut self, channel: Channel) -> Result<(), MotorError> {
        self.tx.try_send(channel).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MotorError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => MotorError::Offline,
        })
    }
}

/// Runs one motor at a time from a bounded command queue and reports each
/// outcome back on the bus.
pub struct MotorService<M> {
    commands: mpsc::Receiver<Channel>,
    mux: M,
    publisher: EventPublisher,
    run_time: Duration,
}

pub fn channel<M: MotorMux>(
    queue_len: usize,
    mux: M,
    publisher: EventPublisher,
    run_time: Duration,
) -> (MotorHandle, MotorService<M>) {
    let (tx, commands) = mpsc::channel(queue_len.max(1));
    (MotorHandle { tx }, MotorService { commands, mux, publisher, run_time })
}

impl<M: MotorMux> MotorService<M> {
    /// Select, drive for the run time, stop.
    async fn dispense(&mut self, channel: Channel) -> Result<(), MotorError> {
        if !channel.is_valid() {
            return Err(MotorError::Offline);
        }
        info!(channel = channel.index(), "⚙️ motor run");
        self.mux.select(channel);
        tokio::time::sleep(MUX_SETTLE).await;
        self.mux.set_drive(true);
        tokio::time::sleep(self.run_time).await;
        self.mux.select(channel);
        self.mux.set_drive(false);
        Ok(())
    }

    pub async fn run(mut self, supervisor: Arc<WatchdogSupervisor>) {
        info!("motor service started");
        self.mux.set_drive(false);
        loop {
            supervisor.heartbeat(TaskId::Motor);
            let command = match tokio::time::timeout(Duration::from_millis(1000), self.commands.recv()).await {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    warn!("motor queue closed");
                    return;
                }
                Err(_) => continue,
            };

            let event = match self.dispense(command).await {
                Ok(()) => Event::DeliveryDone,
                Err(e) => {
                    error!(channel = command.index(), error = %e, "motor run failed");
                    Event::MotorError
                }
            };
            report(&self.publisher, event, &supervisor).await;
        }
    }

    pub fn mux(&self) -> &M {
        &self.mux
    }
}

/// Publishes the outcome of a run. The orchestrator leaves Delivering only
/// on this event, so a full bus is retried instead of dropping it.
async fn report(publisher: &EventPublisher, event: Event, supervisor: &WatchdogSupervisor) {
    for attempt in 1..=REPORT_ATTEMPTS {
        match publisher.publish(event) {
            Ok(()) => return,
            Err(BusError::Full) => {
                debug!(attempt, kind = event.kind(), "bus full, retrying motor report");
                supervisor.heartbeat(TaskId::Motor);
                tokio::time::sleep(REPORT_RETRY).await;
            }
            Err(e) => {
                warn!(error = %e, kind = event.kind(), "motor report not delivered");
                return;
            }
        }
    }
    error!(kind = event.kind(), attempts = REPORT_ATTEMPTS, "motor report dropped, bus stayed full");
}
