use super::{DisplayMessage, DisplaySink};
use crate::watchdog::{TaskId, WatchdogSupervisor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Frames queued for the display task before the newest ones are dropped.
pub const DISPLAY_QUEUE_LEN: usize = 4;

/// A physical bus shared between devices. Each closure passed to
/// [`SharedBus::transaction`] runs with exclusive access, so no two
/// transactions interleave.
#[derive(Debug)]
pub struct SharedBus<B> {
    inner: Arc<Mutex<B>>,
}

impl<B> Clone for SharedBus<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B> SharedBus<B> {
    pub fn new(bus: B) -> Self {
        Self { inner: Arc::new(Mutex::new(bus)) }
    }

    pub fn transaction<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let mut bus = self.inner.lock();
        f(&mut bus)
    }
}

/// Character LCD as seen from the shared bus.
pub trait LcdPanel {
    fn write_frame(&mut self, message: &DisplayMessage);
}

/// Host LCD: logs every frame and remembers the last one.
#[derive(Debug, Default)]
pub struct ConsoleLcd {
    current: DisplayMessage,
    frames: u32,
}

impl ConsoleLcd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &DisplayMessage {
        &self.current
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }
}

impl LcdPanel for ConsoleLcd {
    fn write_frame(&mut self, message: &DisplayMessage) {
        self.current = *message;
        self.frames = self.frames.wrapping_add(1);
        info!("📟 [{:<16}] [{:<16}]", message.line1.as_str(), message.line2.as_str());
    }
}

/// Orchestrator-side handle. Frames are queued to the display task and
/// never block the caller.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    tx: mpsc::Sender<DisplayMessage>,
}

impl DisplaySink for DisplayHandle {
    fn show(&mut self, message: &DisplayMessage) {
        if let Err(e) = self.tx.try_send(*message) {
            warn!(error = %e, "display frame dropped");
        }
    }
}

pub fn channel() -> (DisplayHandle, mpsc::Receiver<DisplayMessage>) {
    let (tx, rx) = mpsc::channel(DISPLAY_QUEUE_LEN);
    (DisplayHandle { tx }, rx)
}

/// Display task: writes each queued frame in a single bus transaction.
pub async fn run<B: LcdPanel + Send + 'static>(
    mut frames: mpsc::Receiver<DisplayMessage>,
    bus: SharedBus<B>,
    supervisor: Arc<WatchdogSupervisor>,
) {
    info!("display task started");
    loop {
        supervisor.heartbeat(TaskId::Display);
        match tokio::time::timeout(Duration::from_millis(1000), frames.recv()).await {
            Ok(Some(message)) => bus.transaction(|lcd| lcd.write_frame(&message)),
            Ok(None) => {
                info!("display queue closed");
                return;
            }
            Err(_) => {}
        }
    }
}
