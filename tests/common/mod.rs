#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use vendbus::catalog::Channel;
use vendbus::config::{OrchestratorConfig, WatchdogConfig};
use vendbus::hal::{Clock, ManualClock, SchedulerFlag, SimulatedResetCause, SimulatedWatchdog};
use vendbus::link::LinkError;
use vendbus::orchestrator::Orchestrator;
use vendbus::peripherals::{DisplayMessage, DisplaySink, MotorDriver, MotorError, Uplink};
use vendbus::protocol::Outbound;
use vendbus::state::StateView;
use vendbus::watchdog::{WatchdogHardware, WatchdogSupervisor};

#[derive(Debug, Default)]
pub struct Recording {
    pub frames: Vec<String>,
    pub motor: Vec<u8>,
    pub outbound: Vec<String>,
    pub motor_failure: Option<MotorError>,
}

/// Collaborator double that records everything the orchestrator asks of it.
/// Clones share the same recording.
#[derive(Debug, Clone, Default)]
pub struct Recorder(pub Arc<Mutex<Recording>>);

impl Recorder {
    pub fn frames(&self) -> Vec<String> {
        self.0.lock().frames.clone()
    }

    pub fn last_frame(&self) -> Option<String> {
        self.0.lock().frames.last().cloned()
    }

    pub fn motor(&self) -> Vec<u8> {
        self.0.lock().motor.clone()
    }

    pub fn outbound(&self) -> Vec<String> {
        self.0.lock().outbound.clone()
    }

    pub fn fail_motor(&self, error: Option<MotorError>) {
        self.0.lock().motor_failure = error;
    }

    pub fn clear(&self) {
        let mut rec = self.0.lock();
        rec.frames.clear();
        rec.motor.clear();
        rec.outbound.clear();
    }
}

impl DisplaySink for Recorder {
    fn show(&mut self, message: &DisplayMessage) {
        self.0.lock().frames.push(format!("{}|{}", message.line1, message.line2));
    }
}

impl MotorDriver for Recorder {
    fn start_delivery(&mut self, channel: Channel) -> Result<(), MotorError> {
        let mut rec = self.0.lock();
        if let Some(error) = rec.motor_failure {
            return Err(error);
        }
        rec.motor.push(channel.index());
        Ok(())
    }
}

impl Uplink for Recorder {
    fn send(&mut self, line: &Outbound) -> Result<(), LinkError> {
        let encoded = line.encode()?;
        self.0.lock().outbound.push(encoded.to_string());
        Ok(())
    }
}

pub fn orchestrator(recorder: &Recorder, view: &StateView) -> Orchestrator {
    Orchestrator::new(
        &OrchestratorConfig::default(),
        Box::new(recorder.clone()),
        Box::new(recorder.clone()),
        Box::new(recorder.clone()),
        view.clone(),
    )
}

pub struct SupervisorRig {
    pub clock: ManualClock,
    pub watchdog: SimulatedWatchdog,
    pub reset_cause: SimulatedResetCause,
    pub scheduler: SchedulerFlag,
    pub uplink: Recorder,
    pub supervisor: WatchdogSupervisor,
}

/// Supervisor on a manual clock with simulated hardware and a recording uplink.
pub fn supervisor_rig(config: WatchdogConfig, watchdog_reset: bool) -> SupervisorRig {
    let clock = ManualClock::new(10_000);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let watchdog = SimulatedWatchdog::new(Arc::clone(&shared));
    let reset_cause = SimulatedResetCause::new(watchdog_reset);
    let scheduler = SchedulerFlag::new(true);
    let uplink = Recorder::default();
    let supervisor = WatchdogSupervisor::new(
        config,
        WatchdogHardware {
            watchdog: Box::new(watchdog.clone()),
            reset_cause: Box::new(reset_cause.clone()),
            scheduler: Arc::new(scheduler.clone()),
            clock: shared,
        },
    )
    .with_notifications(
        vendbus::supervision::SupervisionNotifier::new("VM-TEST", 30_000),
        Box::new(uplink.clone()),
    );
    SupervisorRig { clock, watchdog, reset_cause, scheduler, uplink, supervisor }
}
