use crate::bus::EventPublisher;
use crate::event::{Event, Key};
use crate::hal::Clock;
use crate::watchdog::{TaskId, WatchdogSupervisor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const MIN_PRESS_INTERVAL_MS: u64 = 100;
pub const MAX_INVALID_KEYS: u32 = 10;
pub const LOCKOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyRejected {
    #[error("keypad locked out")]
    LockedOut,
    #[error("key pressed too soon after the previous one")]
    TooFast,
    #[error("{0:?} is not a keypad key")]
    Invalid(char),
}

/// Validates raw key characters before they reach the bus.
#[derive(Debug, Default)]
pub struct KeypadGate {
    invalid_count: u32,
    last_press_ms: Option<u64>,
    lockout_start_ms: Option<u64>,
}

impl KeypadGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, c: char, now_ms: u64) -> Result<Key, KeyRejected> {
        if let Some(start) = self.lockout_start_ms {
            if now_ms.saturating_sub(start) < LOCKOUT_MS {
                return Err(KeyRejected::LockedOut);
            }
            self.lockout_start_ms = None;
            self.invalid_count = 0;
            info!("keypad lockout over");
        }

        if let Some(last) = self.last_press_ms {
            if now_ms.saturating_sub(last) < MIN_PRESS_INTERVAL_MS {
                return Err(KeyRejected::TooFast);
            }
        }

        let Some(key) = Key::from_char(c) else {
            self.invalid_count += 1;
            warn!(?c, attempts = self.invalid_count, "invalid keypad character");
            if self.invalid_count >= MAX_INVALID_KEYS {
                self.lockout_start_ms = Some(now_ms);
                error!(lockout_ms = LOCKOUT_MS, "too many invalid keys, locking keypad");
            }
            return Err(KeyRejected::Invalid(c));
        };

        self.last_press_ms = Some(now_ms);
        self.invalid_count = 0;
        Ok(key)
    }

    pub fn is_locked(&self, now_ms: u64) -> bool {
        self.lockout_start_ms
            .is_some_and(|start| now_ms.saturating_sub(start) < LOCKOUT_MS)
    }
}

/// Keypad task: gates raw characters from `input` and publishes accepted keys.
pub async fn run(
    mut input: mpsc::Receiver<char>,
    mut gate: KeypadGate,
    bus: EventPublisher,
    supervisor: Arc<WatchdogSupervisor>,
    clock: Arc<dyn Clock>,
) {
    info!("keypad task started");
    loop {
        supervisor.heartbeat(TaskId::Keypad);
        match tokio::time::timeout(Duration::from_millis(500), input.recv()).await {
            Ok(Some(c)) => match gate.admit(c, clock.now_ms()) {
                Ok(key) => {
                    debug!(key = %key.as_char(), "key accepted");
                    let _ = bus.publish(Event::Keypad(key));
                }
                Err(reason) => debug!(%reason, "key rejected"),
            },
            Ok(None) => {
                info!("keypad input closed");
                return;
            }
            Err(_) => {}
        }
    }
}
