use crate::bus::EventPublisher;
use crate::catalog::MAX_SLOT;
use crate::event::Event;
use crate::peripherals::Uplink;
use crate::protocol::{classify, Inbound, LineAssembler, Outbound, OutboundBuffer, Reason, MAX_VEND_QTY};
use crate::state::StateView;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub use crate::protocol::LinkError;

/// Inbound side of the serial link to the network node: framing,
/// classification, session pre-checks and publication.
pub struct LinkHandler {
    assembler: LineAssembler,
    publisher: EventPublisher,
    view: StateView,
    uplink: Box<dyn Uplink + Send>,
    /// Set when an ORDER_START was put on the bus, holding the orchestrator's
    /// ORDER_START count at that moment. Cleared once the count moves.
    start_pending: Option<u32>,
}

impl LinkHandler {
    pub fn new(
        inter_byte_timeout_ms: u64,
        publisher: EventPublisher,
        view: StateView,
        uplink: Box<dyn Uplink + Send>,
    ) -> Self {
        Self {
            assembler: LineAssembler::new(inter_byte_timeout_ms),
            publisher,
            view,
            uplink,
            start_pending: None,
        }
    }

    /// Feeds received bytes. Returns the events published for completed lines.
    pub fn feed(&mut self, bytes: &[u8], now_ms: u64) -> alloc::vec::Vec<Event> {
        let mut published = alloc::vec::Vec::new();
        for &byte in bytes {
            match self.assembler.push(byte, now_ms) {
                Ok(line) => published.extend(self.handle_line(&line)),
                Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(e)) => debug!(error = %e, "framing error"),
            }
        }
        published
    }

    /// Handles one complete line and returns the event it published, if any.
    pub fn handle_line(&mut self, line: &str) -> Option<Event> {
        let inbound = classify(line);
        match &inbound {
            Inbound::Unknown => {
                info!(line, "unknown line from network node");
                return None;
            }
            Inbound::Malformed => {
                warn!(line, "malformed line from network node");
                self.reply(Outbound::OrderNak(Reason::Malformed));
                if self.session_active() {
                    self.start_pending = None;
                    return self.publish(Event::OrderFailed);
                }
                return None;
            }
            Inbound::Vend { slot, qty, .. } => {
                if !self.session_active() {
                    self.reply(Outbound::OrderNak(Reason::NoActiveOrder));
                    return None;
                }
                if !(1..=MAX_SLOT).contains(slot) {
                    self.reply(Outbound::OrderNak(Reason::InvalidSlot));
                    return None;
                }
                if !(1..=MAX_VEND_QTY).contains(qty) {
                    self.reply(Outbound::OrderNak(Reason::InvalidQty));
                    return None;
                }
            }
            Inbound::OrderStart(_) => {
                let baseline = self.view.order_starts();
                let published = self.publish(inbound.event()?);
                if published.is_some() {
                    self.start_pending = Some(baseline);
                }
                return published;
            }
            Inbound::OrderEnd | Inbound::OrderFailed => self.start_pending = None,
            _ => {}
        }
        self.publish(inbound.event()?)
    }

    /// True while a remote order is active, or an ORDER_START is on the bus
    /// and not yet handled by the orchestrator.
    pub fn session_open(&self) -> bool {
        let pending = matches!(self.start_pending, Some(baseline) if self.view.order_starts() == baseline);
        pending || self.view.has_remote_order()
    }

    pub fn discarded_lines(&self) -> u32 {
        self.assembler.discarded()
    }

    fn session_active(&mut self) -> bool {
        if matches!(self.start_pending, Some(baseline) if self.view.order_starts() != baseline) {
            self.start_pending = None;
        }
        self.session_open()
    }

    fn publish(&self, event: Event) -> Option<Event> {
        debug!(kind = event.kind(), "link event");
        self.publisher.publish(event).ok().map(|_| event)
    }

    fn reply(&mut self, line: Outbound) {
        if let Err(e) = self.uplink.send(&line) {
            warn!(error = %e, %line, "reply not sent");
        }
    }
}

/// Uplink that fans encoded lines out to every connected peer.
#[derive(Debug, Clone)]
pub struct BroadcastUplink {
    tx: broadcast::Sender<OutboundBuffer>,
}

impl BroadcastUplink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundBuffer> {
        self.tx.subscribe()
    }
}

impl Uplink for BroadcastUplink {
    fn send(&mut self, line: &Outbound) -> Result<(), LinkError> {
        let encoded = line.encode()?;
        debug!(line = encoded.as_str(), "outbound");
        self.tx.send(encoded).map(|_| ()).map_err(|_| LinkError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus;

    #[test]
    fn test_broadcast_uplink_without_peer_is_disconnected() {
        let mut uplink = BroadcastUplink::new(8);
        assert_eq!(uplink.send(&Outbound::OrderAck), Err(LinkError::Disconnected));

        let mut rx = uplink.subscribe();
        uplink.send(&Outbound::VendCompleted { slot: 2 }).unwrap();
        assert_eq!(rx.try_recv().unwrap().as_str(), "VEND_COMPLETED:2");
    }

    #[test]
    fn test_feed_publishes_completed_lines() {
        let (publisher, mut receiver) = bus::channel(8);
        let uplink = BroadcastUplink::new(8);
        let mut handler = LinkHandler::new(1000, publisher, StateView::new(), Box::new(uplink));

        let events = handler.feed(b"NFC_UID:AB12\r\nNFC_ERR:x\n", 0);
        assert_eq!(events, vec![Event::PaymentOk, Event::PaymentCancel]);
        assert_eq!(receiver.try_consume(), Some(Event::PaymentOk));
        assert_eq!(receiver.try_consume(), Some(Event::PaymentCancel));
    }

    #[test]
    fn test_session_flag_follows_order_lines() {
        let (publisher, _receiver) = bus::channel(8);
        let mut handler =
            LinkHandler::new(1000, publisher, StateView::new(), Box::new(BroadcastUplink::new(8)));
        handler.handle_line("ORDER_START:A1");
        assert!(handler.session_open());
        handler.handle_line("ORDER_END");
        assert!(!handler.session_open());
    }
}
