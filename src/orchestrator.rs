use crate::bus::{BusError, EventReceiver};
use crate::catalog::{self, Channel};
use crate::config::OrchestratorConfig;
use crate::event::{Event, Key, OrderId, ProductId};
use crate::peripherals::{DisplayMessage, DisplaySink, MotorDriver, MotorError, Uplink};
use crate::protocol::{Outbound, Reason, MAX_VEND_QTY};
use crate::state::{ActiveOrder, MachineSnapshot, MachineState, OrderSource, PendingSelection, StateView};
use crate::watchdog::{TaskId, WatchdogSupervisor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the run loop must do after an event has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Done,
    /// Keep the current message on screen for `delay`, then apply `then`.
    Hold { delay: Duration, then: Deferred },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    ShowIdle,
    /// Drop any selection or order and return to Idle.
    RevertToIdle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub events: u32,
    pub orders_started: u32,
    pub orders_completed: u32,
    pub orders_aborted: u32,
    pub invalid_codes: u32,
    pub motor_commands: u32,
}

/// The machine's state owner. Turns bus events into state transitions and
/// commands for the display, motor and network collaborators.
pub struct Orchestrator {
    state: MachineState,
    pending: PendingSelection,
    active_order: Option<ActiveOrder>,
    order_starts: u32,
    stats: OrchestratorStats,

    display: Box<dyn DisplaySink + Send>,
    motor: Box<dyn MotorDriver + Send>,
    uplink: Box<dyn Uplink + Send>,
    view: StateView,

    receive_timeout: Duration,
    message_hold: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &OrchestratorConfig,
        display: Box<dyn DisplaySink + Send>,
        motor: Box<dyn MotorDriver + Send>,
        uplink: Box<dyn Uplink + Send>,
        view: StateView,
    ) -> Self {
        let orchestrator = Self {
            state: MachineState::Idle,
            pending: PendingSelection::new(),
            active_order: None,
            order_starts: 0,
            stats: OrchestratorStats::default(),
            display,
            motor,
            uplink,
            view,
            receive_timeout: config.receive_timeout(),
            message_hold: config.message_hold(),
        };
        orchestrator.publish_snapshot();
        orchestrator
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn pending(&self) -> &PendingSelection {
        &self.pending
    }

    pub fn active_order(&self) -> Option<&ActiveOrder> {
        self.active_order.as_ref()
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    /// Draws the screen for the current state.
    pub fn show_current(&mut self) {
        let message = self.screen_for(self.state);
        self.display.show(&message);
    }

    /// One handling step. Every invariant on the selection and the order
    /// holds again when this returns.
    pub fn handle_event(&mut self, event: Event) -> Step {
        self.stats.events = self.stats.events.wrapping_add(1);
        debug!(kind = event.kind(), state = ?self.state, "event");

        let step = match event {
            Event::Keypad(key) => self.on_key(key),
            // Payment results from the network node act like the confirm and
            // cancel keys
            Event::PaymentOk => self.on_key(Key::Hash),
            Event::PaymentCancel => self.on_key(Key::Star),
            Event::NoNetwork => self.on_no_network(),
            Event::DeliveryDone => self.on_delivery_done(),
            Event::MotorError => self.on_motor_error(),
            Event::StockLow { sensor_id, distance_mm } => {
                warn!(sensor_id, distance_mm, "stock low");
                Step::Done
            }
            Event::OrderStart(order_id) => self.on_order_start(order_id),
            Event::VendItem { slot, qty, product_id } => self.on_vend_item(slot, qty, product_id),
            Event::OrderComplete => self.on_order_complete(),
            Event::OrderFailed => self.on_order_failed(),
        };

        self.publish_snapshot();
        step
    }

    /// Completes a deferred action once its hold time has passed.
    pub fn finish(&mut self, deferred: Deferred) {
        match deferred {
            Deferred::ShowIdle => {
                if self.state == MachineState::Idle {
                    self.show_current();
                }
            }
            Deferred::RevertToIdle => {
                if let Some(order) = self.active_order.take() {
                    warn!(order_id = %order.order_id, state = ?self.state, "order dropped by network revert");
                    self.stats.orders_aborted = self.stats.orders_aborted.wrapping_add(1);
                }
                self.pending.clear();
                self.state = MachineState::Idle;
                self.show_current();
            }
        }
        self.publish_snapshot();
    }

    fn on_key(&mut self, key: Key) -> Step {
        match self.state {
            MachineState::Idle | MachineState::Ordering => self.on_key_selecting(key),
            MachineState::Paying => self.on_key_paying(key),
            MachineState::Settings => {
                if key == Key::Star {
                    self.state = MachineState::Idle;
                    self.show_current();
                }
                Step::Done
            }
            MachineState::Delivering => {
                debug!(key = %key.as_char(), "key ignored while delivering");
                Step::Done
            }
        }
    }

    fn on_key_selecting(&mut self, key: Key) -> Step {
        let digit = match key {
            Key::Star if self.state == MachineState::Ordering => {
                info!("selection cancelled");
                self.pending.clear();
                self.state = MachineState::Idle;
                self.show("Order cancelled", "");
                return Step::Done;
            }
            Key::Star | Key::Hash => return Step::Done,
            Key::Digit(d) if d > 9 => {
                warn!(digit = d, "keypad digit out of range");
                return Step::Done;
            }
            Key::Digit(d) => d,
        };

        let Some(code) = self.pending.push(digit) else {
            self.state = MachineState::Ordering;
            self.show_current();
            return Step::Done;
        };

        let channel = catalog::lookup(code);
        if !channel.is_valid() {
            info!(code, "invalid product code");
            self.stats.invalid_codes = self.stats.invalid_codes.wrapping_add(1);
            self.state = MachineState::Idle;
            self.show("Invalid product", "");
            return self.hold(Deferred::ShowIdle);
        }

        info!(code, channel = channel.index(), "product selected, awaiting payment");
        self.active_order = Some(ActiveOrder::keypad(code, channel));
        self.state = MachineState::Paying;
        self.send(Outbound::StatePaying);
        self.show_current();
        Step::Done
    }

    fn on_key_paying(&mut self, key: Key) -> Step {
        match key {
            Key::Star => {
                info!("payment cancelled");
                self.abort_order();
                self.state = MachineState::Idle;
                self.show_current();
                Step::Done
            }
            Key::Hash => self.confirm_payment(),
            Key::Digit(_) => Step::Done,
        }
    }

    fn confirm_payment(&mut self) -> Step {
        // Re-derive the channel from the table rather than trusting the order
        let channel = self
            .active_order
            .as_ref()
            .and_then(ActiveOrder::code)
            .map_or(Channel::INVALID, catalog::lookup);

        if !channel.is_valid() {
            warn!("payment confirmed for an order with no valid channel");
            self.abort_order();
            self.state = MachineState::Idle;
            self.show("Invalid order", "");
            return self.hold(Deferred::ShowIdle);
        }

        info!(channel = channel.index(), "payment accepted, dispensing");
        self.state = MachineState::Delivering;
        if let Some(order) = self.active_order.as_mut() {
            order.in_progress = true;
        }
        self.stats.orders_started = self.stats.orders_started.wrapping_add(1);
        self.show_current();

        if let Err(e) = self.start_delivery(channel) {
            warn!(error = %e, "delivery could not be started");
            self.abort_order();
            self.state = MachineState::Idle;
            self.show("Motor error", "");
            return self.hold(Deferred::ShowIdle);
        }
        Step::Done
    }

    fn on_no_network(&mut self) -> Step {
        warn!(state = ?self.state, "network node reports no connection");
        self.show("No network", "connection");
        self.hold(Deferred::RevertToIdle)
    }

    fn on_delivery_done(&mut self) -> Step {
        if self.state != MachineState::Delivering {
            debug!(state = ?self.state, "delivery done outside delivering");
            return Step::Done;
        }
        match self.active_order.as_ref().map(|o| o.source) {
            Some(OrderSource::Remote) => {
                // Remote orders finish on ORDER_END
                debug!("remote unit delivered");
            }
            _ => {
                info!("delivery complete");
                self.active_order = None;
                self.stats.orders_completed = self.stats.orders_completed.wrapping_add(1);
                self.state = MachineState::Idle;
                self.show_current();
            }
        }
        Step::Done
    }

    fn on_motor_error(&mut self) -> Step {
        if self.state != MachineState::Delivering {
            warn!(state = ?self.state, "motor error outside delivering");
            return Step::Done;
        }
        warn!("motor error, aborting order");
        if self.active_order.as_ref().map(|o| o.source) == Some(OrderSource::Remote) {
            self.send(Outbound::DeliveryFailed(Reason::MotorError));
        }
        self.abort_order();
        self.state = MachineState::Idle;
        self.show("Motor error", "");
        self.hold(Deferred::ShowIdle)
    }

    fn on_order_start(&mut self, order_id: OrderId) -> Step {
        self.order_starts = self.order_starts.wrapping_add(1);
        if let Some(active) = &self.active_order {
            warn!(active = %active.order_id, rejected = %order_id, "order already active");
            self.send(Outbound::OrderNak(Reason::OrderAlreadyActive));
            return Step::Done;
        }

        info!(%order_id, "remote order started");
        self.pending.clear();
        self.active_order = Some(ActiveOrder::remote(order_id));
        self.stats.orders_started = self.stats.orders_started.wrapping_add(1);
        self.state = MachineState::Delivering;
        self.send(Outbound::OrderAck);
        self.show("Remote order", &order_id);
        Step::Done
    }

    fn on_vend_item(&mut self, slot: u8, qty: u8, product_id: ProductId) -> Step {
        let remote_active = matches!(&self.active_order, Some(o) if o.source == OrderSource::Remote);
        if !remote_active {
            warn!(slot, "vend without an active remote order");
            self.send(Outbound::OrderNak(Reason::NoActiveOrder));
            return Step::Done;
        }
        let channel = catalog::slot_channel(slot);
        if !channel.is_valid() {
            warn!(slot, "vend for invalid slot");
            self.send(Outbound::OrderNak(Reason::InvalidSlot));
            return Step::Done;
        }
        if !(1..=MAX_VEND_QTY).contains(&qty) {
            warn!(slot, qty, "vend with invalid quantity");
            self.send(Outbound::OrderNak(Reason::InvalidQty));
            return Step::Done;
        }

        info!(slot, qty, %product_id, "vending");
        if let Some(order) = self.active_order.as_mut() {
            order.bind(slot, channel);
            order.requested_qty = order.requested_qty.saturating_add(u16::from(qty));
        }

        for _ in 0..qty {
            if let Err(e) = self.start_delivery(channel) {
                warn!(slot, error = %e, "vend interrupted");
                let reason = match e {
                    MotorError::QueueFull => Reason::MotorQueueFull,
                    MotorError::Offline => Reason::MotorError,
                };
                self.send(Outbound::VendFailed { slot, reason });
                return Step::Done;
            }
            if let Some(order) = self.active_order.as_mut() {
                order.delivered_count = order.delivered_count.saturating_add(1);
            }
        }
        self.send(Outbound::VendCompleted { slot });
        Step::Done
    }

    fn on_order_complete(&mut self) -> Step {
        let remote_active = matches!(&self.active_order, Some(o) if o.source == OrderSource::Remote);
        if !remote_active {
            warn!("order end without an active remote order");
            self.send(Outbound::OrderNak(Reason::NoActiveOrder));
            return Step::Done;
        }
        if let Some(order) = self.active_order.take() {
            info!(
                order_id = %order.order_id,
                requested = order.requested_qty,
                delivered = order.delivered_count,
                "remote order complete"
            );
        }
        self.stats.orders_completed = self.stats.orders_completed.wrapping_add(1);
        self.send(Outbound::DeliveryCompleted);
        self.state = MachineState::Idle;
        self.show_current();
        Step::Done
    }

    fn on_order_failed(&mut self) -> Step {
        warn!(state = ?self.state, "order failed");
        if self.active_order.is_some() {
            self.send(Outbound::DeliveryFailed(Reason::OrderFailed));
            self.abort_order();
        }
        self.pending.clear();
        self.state = MachineState::Idle;
        self.show("Order failed", "");
        self.hold(Deferred::ShowIdle)
    }

    fn start_delivery(&mut self, channel: Channel) -> Result<(), MotorError> {
        self.motor.start_delivery(channel)?;
        self.stats.motor_commands = self.stats.motor_commands.wrapping_add(1);
        Ok(())
    }

    fn abort_order(&mut self) {
        if self.active_order.take().is_some() {
            self.stats.orders_aborted = self.stats.orders_aborted.wrapping_add(1);
        }
    }

    fn hold(&self, then: Deferred) -> Step {
        Step::Hold { delay: self.message_hold, then }
    }

    fn screen_for(&self, state: MachineState) -> DisplayMessage {
        match state {
            MachineState::Idle => DisplayMessage::new("Select a drink", ""),
            MachineState::Ordering => DisplayMessage::new("Drink choice", &self.pending.as_text()),
            MachineState::Paying => {
                let code = self
                    .active_order
                    .as_ref()
                    .map(|o| o.order_id)
                    .unwrap_or_default();
                DisplayMessage::new("Payment pending", &code)
            }
            MachineState::Delivering => DisplayMessage::new("Dispensing", "in progress..."),
            MachineState::Settings => DisplayMessage::new("Settings", ""),
        }
    }

    fn show(&mut self, line1: &str, line2: &str) {
        self.display.show(&DisplayMessage::new(line1, line2));
    }

    fn send(&mut self, line: Outbound) {
        if let Err(e) = self.uplink.send(&line) {
            warn!(error = %e, %line, "outbound line not sent");
        }
    }

    fn publish_snapshot(&self) {
        self.view.publish(MachineSnapshot {
            state: self.state,
            pending: self.pending.as_text(),
            active_order: self.active_order.clone(),
            order_starts: self.order_starts,
        });
    }

    /// Orchestrator task. Heartbeats on every pass, including receive
    /// timeouts and while a message is being held.
    pub async fn run(mut self, mut inbox: EventReceiver, supervisor: Arc<WatchdogSupervisor>) {
        info!("orchestrator started");
        self.show_current();
        loop {
            supervisor.heartbeat(TaskId::Orchestrator);
            let event = match inbox.consume(self.receive_timeout).await {
                Ok(event) => event,
                Err(BusError::Timeout) | Err(BusError::Full) => continue,
                Err(BusError::Closed) => {
                    info!("event bus closed, orchestrator stopping");
                    return;
                }
            };

            if let Step::Hold { delay, then } = self.handle_event(event) {
                hold_for(delay, self.receive_timeout, &supervisor).await;
                self.finish(then);
            }
        }
    }
}

// Sleeps through a message hold in receive-timeout slices so the
// orchestrator keeps heartbeating.
async fn hold_for(delay: Duration, slice: Duration, supervisor: &WatchdogSupervisor) {
    let slice = slice.max(Duration::from_millis(1));
    let mut remaining = delay;
    while !remaining.is_zero() {
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining -= step;
        supervisor.heartbeat(TaskId::Orchestrator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LinkError;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<alloc::vec::Vec<alloc::string::String>>>);

    impl DisplaySink for Log {
        fn show(&mut self, message: &DisplayMessage) {
            self.0.lock().push(format!("{}|{}", message.line1, message.line2));
        }
    }

    impl MotorDriver for Log {
        fn start_delivery(&mut self, channel: Channel) -> Result<(), MotorError> {
            self.0.lock().push(format!("motor:{}", channel));
            Ok(())
        }
    }

    impl Uplink for Log {
        fn send(&mut self, line: &Outbound) -> Result<(), LinkError> {
            self.0.lock().push(line.to_string());
            Ok(())
        }
    }

    fn orchestrator(log: &Log) -> Orchestrator {
        Orchestrator::new(
            &OrchestratorConfig::default(),
            Box::new(log.clone()),
            Box::new(log.clone()),
            Box::new(log.clone()),
            StateView::new(),
        )
    }

    #[test]
    fn test_ordering_cancel() {
        let log = Log::default();
        let mut orch = orchestrator(&log);
        orch.handle_event(Event::Keypad(Key::Digit(1)));
        assert_eq!(orch.state(), MachineState::Ordering);
        orch.handle_event(Event::Keypad(Key::Star));
        assert_eq!(orch.state(), MachineState::Idle);
        assert!(orch.pending().is_empty());
        assert!(log.0.lock().iter().any(|l| l == "Order cancelled|"));
    }

    #[test]
    fn test_hash_ignored_while_selecting() {
        let log = Log::default();
        let mut orch = orchestrator(&log);
        assert_eq!(orch.handle_event(Event::Keypad(Key::Hash)), Step::Done);
        assert_eq!(orch.state(), MachineState::Idle);
    }

    #[test]
    fn test_settings_exit_on_star() {
        let log = Log::default();
        let mut orch = orchestrator(&log);
        orch.state = MachineState::Settings;
        orch.handle_event(Event::Keypad(Key::Digit(4)));
        assert_eq!(orch.state(), MachineState::Settings);
        orch.handle_event(Event::Keypad(Key::Star));
        assert_eq!(orch.state(), MachineState::Idle);
    }

    #[test]
    fn test_paying_screen_shows_code() {
        let log = Log::default();
        let mut orch = orchestrator(&log);
        orch.handle_event(Event::Keypad(Key::Digit(2)));
        orch.handle_event(Event::Keypad(Key::Digit(3)));
        assert_eq!(orch.state(), MachineState::Paying);
        assert_eq!(log.0.lock().last().map(String::as_str), Some("Payment pending|23"));
    }

    #[test]
    fn test_view_tracks_orchestrator() {
        let log = Log::default();
        let view = StateView::new();
        let mut orch = Orchestrator::new(
            &OrchestratorConfig::default(),
            Box::new(log.clone()),
            Box::new(log.clone()),
            Box::new(log.clone()),
            view.clone(),
        );
        orch.handle_event(Event::Keypad(Key::Digit(1)));
        assert_eq!(view.snapshot().pending.as_str(), "1");
        orch.handle_event(Event::Keypad(Key::Digit(1)));
        assert_eq!(view.state(), MachineState::Paying);
        assert!(view.has_active_order());
    }
}
