use crate::event::{truncated_id, MAX_ID_LEN};
use crate::protocol::Outbound;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Longest free-text message carried in a notification. Keeps the whole
/// `SUPERVISION_ERROR:` line inside one outbound line.
pub const MAX_MESSAGE_LEN: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    WatchdogTimeout,
    WatchdogReset,
    TaskHang,
    MemoryLow,
    CriticalServiceFailure,
    HardwareFault,
    SystemCrash,
    MotorFailure,
    SensorFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisionEvent {
    pub error_id: ArrayString<32>,
    pub machine_id: ArrayString<MAX_ID_LEN>,
    pub error_type: ErrorKind,
    pub message: ArrayString<MAX_MESSAGE_LEN>,
}

/// Builds rate-limited error notifications for the remote operator.
#[derive(Debug)]
pub struct SupervisionNotifier {
    machine_id: ArrayString<MAX_ID_LEN>,
    cooldown_ms: u64,
    last_sent_ms: Option<u64>,
    sequence: u32,
    suppressed: u32,
}

impl SupervisionNotifier {
    pub fn new(machine_id: &str, cooldown_ms: u64) -> Self {
        Self {
            machine_id: truncated_id(machine_id),
            cooldown_ms,
            last_sent_ms: None,
            sequence: 0,
            suppressed: 0,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn should_send(&self, now_ms: u64) -> bool {
        match self.last_sent_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.cooldown_ms,
            None => true,
        }
    }

    /// Notifications dropped by the cooldown.
    pub fn suppressed(&self) -> u32 {
        self.suppressed
    }

    /// Returns the line to transmit, or `None` while cooling down.
    pub fn prepare(&mut self, kind: ErrorKind, message: &str, now_ms: u64) -> Option<Outbound> {
        if !self.should_send(now_ms) {
            self.suppressed = self.suppressed.wrapping_add(1);
            debug!(?kind, "supervision notification skipped, cooling down");
            return None;
        }

        self.sequence = self.sequence.wrapping_add(1);
        let event = SupervisionEvent {
            error_id: error_id(now_ms, self.sequence),
            machine_id: self.machine_id,
            error_type: kind,
            message: sanitize(message),
        };
        // Only fixed-capacity strings and a unit enum, serialization cannot fail
        let json = serde_json::to_string(&event).ok()?;

        self.last_sent_ms = Some(now_ms);
        info!(error_id = %event.error_id, ?kind, "supervision notification");
        Some(Outbound::SupervisionError(json))
    }
}

fn error_id(now_ms: u64, sequence: u32) -> ArrayString<32> {
    use core::fmt::Write as _;
    let mut id = ArrayString::new();
    // err_ + 8 + _ + 8 always fits
    let _ = write!(id, "err_{:08x}_{:08x}", now_ms as u32, sequence);
    id
}

// Quotes, backslashes and non-printables would either be escaped past the
// line budget or rejected by the link.
fn sanitize(message: &str) -> ArrayString<MAX_MESSAGE_LEN> {
    let mut out = ArrayString::new();
    for c in message.chars() {
        let c = match c {
            '"' | '\\' => '\'',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '?',
        };
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_OUTBOUND_LEN;

    #[test]
    fn test_first_notification_passes_then_cooldown() {
        let mut notifier = SupervisionNotifier::new("VM-1", 30_000);
        assert!(notifier.prepare(ErrorKind::WatchdogReset, "boot", 100).is_some());
        assert!(notifier.prepare(ErrorKind::TaskHang, "again", 29_000).is_none());
        assert_eq!(notifier.suppressed(), 1);
        assert!(notifier.prepare(ErrorKind::TaskHang, "later", 30_100).is_some());
    }

    #[test]
    fn test_payload_shape() {
        let mut notifier = SupervisionNotifier::new("VM-7", 0);
        let line = notifier
            .prepare(ErrorKind::MotorFailure, "motor \"3\" jammed", 0x1234)
            .unwrap()
            .to_string();
        let json = line.strip_prefix("SUPERVISION_ERROR:").unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();

        assert_eq!(value["error_id"], "err_00001234_00000001");
        assert_eq!(value["machine_id"], "VM-7");
        assert_eq!(value["error_type"], "MOTOR_FAILURE");
        assert_eq!(value["message"], "motor '3' jammed");
    }

    #[test]
    fn test_worst_case_line_fits() {
        let mut notifier = SupervisionNotifier::new(&"M".repeat(64), 0);
        let outbound = notifier
            .prepare(ErrorKind::CriticalServiceFailure, &"\u{7f}é".repeat(200), u64::MAX)
            .unwrap();
        let encoded = outbound.encode().unwrap();
        assert!(encoded.len() <= MAX_OUTBOUND_LEN);
    }
}
