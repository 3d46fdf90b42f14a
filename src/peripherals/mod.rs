pub mod display;
pub mod keypad;
pub mod motor;
pub mod stock;

pub use display::{ConsoleLcd, DisplayHandle, SharedBus};
pub use keypad::KeypadGate;
pub use motor::{MotorHandle, MotorService};
pub use stock::StockMonitor;

use crate::catalog::Channel;
use crate::protocol::{LinkError, Outbound};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters per LCD row.
pub const DISPLAY_COLS: usize = 16;

pub type DisplayLine = ArrayString<DISPLAY_COLS>;

/// One full two-row frame for the LCD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub line1: DisplayLine,
    pub line2: DisplayLine,
}

impl DisplayMessage {
    /// Builds a frame, cutting each row at the display width.
    pub fn new(line1: &str, line2: &str) -> Self {
        Self { line1: fit(line1), line2: fit(line2) }
    }
}

fn fit(text: &str) -> DisplayLine {
    let mut line = DisplayLine::new();
    for c in text.chars() {
        if line.try_push(c).is_err() {
            break;
        }
    }
    line
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MotorError {
    #[error("motor command queue full")]
    QueueFull,
    #[error("motor service offline")]
    Offline,
}

/// Writes frames to the display. The orchestrator is the only writer.
pub trait DisplaySink {
    fn show(&mut self, message: &DisplayMessage);
}

/// Fire-and-forget motor commands. Completion comes back as a bus event.
pub trait MotorDriver {
    fn start_delivery(&mut self, channel: Channel) -> Result<(), MotorError>;
}

/// Outbound side of the network link.
pub trait Uplink {
    fn send(&mut self, line: &Outbound) -> Result<(), LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lines_truncate_at_width() {
        let message = DisplayMessage::new("Dispensing in progress", "ok");
        assert_eq!(message.line1.as_str(), "Dispensing in pr");
        assert_eq!(message.line2.as_str(), "ok");
    }
}
