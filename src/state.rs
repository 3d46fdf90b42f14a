use crate::catalog::Channel;
use crate::event::OrderId;
use heapless::Vec;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MAX_BINDINGS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Ordering,
    Paying,
    Delivering,
    Settings,
}

/// Partially entered two-digit product code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSelection {
    digits: Vec<u8, 2>,
}

impl PendingSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a digit. The second digit completes the code: it is returned
    /// and the buffer is emptied in the same call. Values above 9 are not
    /// digits and leave the buffer untouched.
    pub fn push(&mut self, digit: u8) -> Option<u8> {
        if digit > 9 {
            return None;
        }
        if self.digits.push(digit).is_err() {
            // Cannot happen while every push of the second digit drains the buffer
            self.digits.clear();
            return None;
        }
        if self.digits.is_full() {
            let code = self.digits[0] * 10 + self.digits[1];
            self.digits.clear();
            Some(code)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.digits.clear();
    }

    pub fn len(&self) -> usize {
        self.digits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    pub fn digits(&self) -> &[u8] {
        &self.digits
    }

    pub fn as_text(&self) -> arrayvec::ArrayString<2> {
        let mut text = arrayvec::ArrayString::new();
        for d in &self.digits {
            text.push(char::from(b'0' + d));
        }
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSource {
    Keypad,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBinding {
    pub slot: u8,
    pub channel: Channel,
}

/// The one in-flight delivery session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveOrder {
    pub order_id: OrderId,
    pub source: OrderSource,
    pub bindings: Vec<SlotBinding, MAX_BINDINGS>,
    pub requested_qty: u16,
    pub delivered_count: u16,
    pub in_progress: bool,
}

impl ActiveOrder {
    /// Keypad order awaiting payment: one product bound to one channel.
    pub fn keypad(code: u8, channel: Channel) -> Self {
        let mut order_id = OrderId::new();
        order_id.push(char::from(b'0' + code / 10));
        order_id.push(char::from(b'0' + code % 10));
        let mut bindings = Vec::new();
        let _ = bindings.push(SlotBinding { slot: code, channel });
        Self {
            order_id,
            source: OrderSource::Keypad,
            bindings,
            requested_qty: 1,
            delivered_count: 0,
            in_progress: false,
        }
    }

    pub fn remote(order_id: OrderId) -> Self {
        Self {
            order_id,
            source: OrderSource::Remote,
            bindings: Vec::new(),
            requested_qty: 0,
            delivered_count: 0,
            in_progress: true,
        }
    }

    /// Channel of the first binding.
    pub fn channel(&self) -> Option<Channel> {
        self.bindings.first().map(|b| b.channel)
    }

    pub fn code(&self) -> Option<u8> {
        match self.source {
            OrderSource::Keypad => self.bindings.first().map(|b| b.slot),
            OrderSource::Remote => None,
        }
    }

    /// Records slot -> channel, replacing an earlier binding of the same slot.
    /// When the table is full the oldest binding is overwritten.
    pub fn bind(&mut self, slot: u8, channel: Channel) {
        if let Some(binding) = self.bindings.iter_mut().find(|b| b.slot == slot) {
            binding.channel = channel;
            return;
        }
        if self.bindings.is_full() {
            self.bindings.remove(0);
        }
        let _ = self.bindings.push(SlotBinding { slot, channel });
    }
}

/// Point-in-time copy of the orchestrator-owned state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineSnapshot {
    pub state: MachineState,
    pub pending: arrayvec::ArrayString<2>,
    pub active_order: Option<ActiveOrder>,
    /// ORDER_START events handled so far, accepted or not.
    pub order_starts: u32,
}

impl Default for MachineSnapshot {
    fn default() -> Self {
        Self {
            state: MachineState::Idle,
            pending: arrayvec::ArrayString::new(),
            active_order: None,
            order_starts: 0,
        }
    }
}

/// Read-only handle onto the machine state for tasks other than the
/// orchestrator. Every read is a short critical section returning a copy.
#[derive(Debug, Clone, Default)]
pub struct StateView {
    inner: Arc<RwLock<MachineSnapshot>>,
}

impl StateView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.inner.read().clone()
    }

    pub fn state(&self) -> MachineState {
        self.inner.read().state
    }

    pub fn has_active_order(&self) -> bool {
        self.inner.read().active_order.is_some()
    }

    pub fn has_remote_order(&self) -> bool {
        matches!(&self.inner.read().active_order, Some(order) if order.source == OrderSource::Remote)
    }

    pub fn order_starts(&self) -> u32 {
        self.inner.read().order_starts
    }

    // Only the orchestrator publishes.
    pub(crate) fn publish(&self, snapshot: MachineSnapshot) {
        *self.inner.write() = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_selection_completes_on_second_digit() {
        let mut pending = PendingSelection::new();
        assert_eq!(pending.push(1), None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.as_text().as_str(), "1");
        assert_eq!(pending.push(2), Some(12));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_selection_never_holds_two_digits() {
        let mut pending = PendingSelection::new();
        for d in [9, 9, 0, 5, 3] {
            pending.push(d);
            assert!(pending.len() < 2);
        }
    }

    #[test]
    fn test_pending_selection_ignores_non_digits() {
        let mut pending = PendingSelection::new();
        assert_eq!(pending.push(200), None);
        assert!(pending.is_empty());
        assert_eq!(pending.push(2), None);
        assert_eq!(pending.push(255), None);
        assert_eq!(pending.digits(), &[2]);
        assert_eq!(pending.push(3), Some(23));
    }

    #[test]
    fn test_keypad_order_binding() {
        let order = ActiveOrder::keypad(12, Channel::new(1));
        assert_eq!(order.order_id.as_str(), "12");
        assert_eq!(order.channel(), Some(Channel::new(1)));
        assert_eq!(order.code(), Some(12));
        assert!(!order.in_progress);
    }

    #[test]
    fn test_remote_order_bind_replaces_and_rotates() {
        let mut order = ActiveOrder::remote(OrderId::from("R-1").unwrap());
        order.bind(1, Channel::new(1));
        order.bind(1, Channel::new(1));
        assert_eq!(order.bindings.len(), 1);
        for slot in 2..=5 {
            order.bind(slot, Channel::new(slot));
        }
        assert_eq!(order.bindings.len(), MAX_BINDINGS);
        assert_eq!(order.bindings[0].slot, 2);
    }

    #[test]
    fn test_state_view_reads_published_snapshot() {
        let view = StateView::new();
        assert_eq!(view.state(), MachineState::Idle);
        assert!(!view.has_active_order());

        view.publish(MachineSnapshot {
            state: MachineState::Delivering,
            pending: arrayvec::ArrayString::new(),
            active_order: Some(ActiveOrder::remote(OrderId::from("X").unwrap())),
            order_starts: 1,
        });
        assert_eq!(view.state(), MachineState::Delivering);
        assert!(view.has_active_order());
        assert!(view.has_remote_order());
        assert_eq!(view.order_starts(), 1);

        view.publish(MachineSnapshot {
            state: MachineState::Paying,
            active_order: Some(ActiveOrder::keypad(12, Channel::new(1))),
            ..MachineSnapshot::default()
        });
        assert!(view.has_active_order());
        assert!(!view.has_remote_order());
    }
}
