use crate::watchdog::TaskId;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

const MAX_FAULT_HISTORY: usize = 16;

/// Occurrences of one fault kind tolerated before a full reset.
pub const MAX_FAULT_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    StackOverflow,
    HardFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Kill the offending task and keep running without it.
    TerminateTask,
    /// Stop making progress and let the hardware watchdog reset the machine.
    AwaitWatchdog,
    ForceReset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub kind: FaultKind,
    pub task: Option<TaskId>,
    pub timestamp: u64,
    pub action: RecoveryAction,
}

#[derive(Debug)]
pub struct FaultMonitor {
    fault_history: Vec<FaultRecord, MAX_FAULT_HISTORY>,
    next_fault_id: u32,
    stack_overflows: u32,
    hard_faults: u32,
}

impl Default for FaultMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultMonitor {
    pub fn new() -> Self {
        Self {
            fault_history: Vec::new(),
            next_fault_id: 1,
            stack_overflows: 0,
            hard_faults: 0,
        }
    }

    /// Records a fatal fault and decides how to recover from it.
    pub fn record(&mut self, kind: FaultKind, task: Option<TaskId>, timestamp: u64) -> RecoveryAction {
        let action = match kind {
            FaultKind::StackOverflow => {
                self.stack_overflows = self.stack_overflows.saturating_add(1);
                if self.stack_overflows < MAX_FAULT_COUNT {
                    RecoveryAction::TerminateTask
                } else {
                    RecoveryAction::ForceReset
                }
            }
            FaultKind::HardFault => {
                self.hard_faults = self.hard_faults.saturating_add(1);
                if self.hard_faults >= MAX_FAULT_COUNT {
                    RecoveryAction::ForceReset
                } else {
                    RecoveryAction::AwaitWatchdog
                }
            }
        };

        let record = FaultRecord {
            id: self.next_fault_id,
            kind,
            task,
            timestamp,
            action,
        };
        self.next_fault_id = self.next_fault_id.wrapping_add(1);

        if self.fault_history.is_full() {
            self.fault_history.remove(0);
        }
        let _ = self.fault_history.push(record);

        match action {
            RecoveryAction::ForceReset => error!(?kind, ?task, "fault limit reached, forcing reset"),
            _ => warn!(?kind, ?task, ?action, "fatal fault recorded"),
        }
        action
    }

    pub fn stack_overflows(&self) -> u32 {
        self.stack_overflows
    }

    pub fn hard_faults(&self) -> u32 {
        self.hard_faults
    }

    pub fn get_fault_history(&self) -> &[FaultRecord] {
        &self.fault_history
    }

    pub fn last_fault(&self) -> Option<&FaultRecord> {
        self.fault_history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_overflow_escalates_on_fifth() {
        let mut monitor = FaultMonitor::new();
        for i in 0..4 {
            assert_eq!(
                monitor.record(FaultKind::StackOverflow, Some(TaskId::Keypad), i),
                RecoveryAction::TerminateTask
            );
        }
        assert_eq!(
            monitor.record(FaultKind::StackOverflow, Some(TaskId::Display), 10),
            RecoveryAction::ForceReset
        );
        assert_eq!(monitor.stack_overflows(), 5);
    }

    #[test]
    fn test_hard_fault_waits_for_watchdog_until_limit() {
        let mut monitor = FaultMonitor::new();
        for _ in 0..4 {
            assert_eq!(monitor.record(FaultKind::HardFault, None, 0), RecoveryAction::AwaitWatchdog);
        }
        assert_eq!(monitor.record(FaultKind::HardFault, None, 0), RecoveryAction::ForceReset);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut monitor = FaultMonitor::new();
        for i in 0..(MAX_FAULT_HISTORY as u64 + 4) {
            monitor.record(FaultKind::HardFault, None, i);
        }
        assert_eq!(monitor.get_fault_history().len(), MAX_FAULT_HISTORY);
        assert_eq!(monitor.get_fault_history()[0].timestamp, 4);
        assert_eq!(monitor.last_fault().map(|f| f.id), Some(MAX_FAULT_HISTORY as u32 + 4));
    }
}
