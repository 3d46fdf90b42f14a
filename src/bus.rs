use crate::event::Event;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Sized for a keypad burst plus a stream of link lines arriving together.
pub const DEFAULT_BUS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("event bus full, event dropped")]
    Full,
    #[error("no event before timeout")]
    Timeout,
    #[error("event bus closed")]
    Closed,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU32,
    dropped: AtomicU32,
    consumed: AtomicU32,
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u32,
    pub dropped: u32,
    pub consumed: u32,
}

/// Producer side of the bus. Cheap to clone, one per peripheral task.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Event>,
    counters: Arc<BusCounters>,
}

/// The single consumer side of the bus, owned by the orchestrator.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
    counters: Arc<BusCounters>,
}

/// Creates a bounded FIFO bus. Events from one publisher arrive in publish
/// order; nothing is ordered across publishers.
pub fn channel(capacity: usize) -> (EventPublisher, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(BusCounters::default());
    (
        EventPublisher { tx, counters: Arc::clone(&counters) },
        EventReceiver { rx, counters },
    )
}

impl EventPublisher {
    /// Never blocks. A full queue drops the event and logs why.
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                trace!(kind = event.kind(), "event published");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = dropped.kind(), "event bus full, dropping event");
                Err(BusError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                warn!(kind = dropped.kind(), "event bus closed, dropping event");
                Err(BusError::Closed)
            }
        }
    }

    pub fn stats(&self) -> BusStats {
        snapshot(&self.counters)
    }
}

impl EventReceiver {
    /// Waits at most `timeout` for the next event.
    pub async fn consume(&mut self, timeout: Duration) -> Result<Event, BusError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => {
                self.counters.consumed.fetch_add(1, Ordering::Relaxed);
                Ok(event)
            }
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    pub fn try_consume(&mut self) -> Option<Event> {
        let event = self.rx.try_recv().ok()?;
        self.counters.consumed.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    pub fn stats(&self) -> BusStats {
        snapshot(&self.counters)
    }
}

fn snapshot(counters: &BusCounters) -> BusStats {
    BusStats {
        published: counters.published.load(Ordering::Relaxed),
        dropped: counters.dropped.load(Ordering::Relaxed),
        consumed: counters.consumed.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Key;

    #[test]
    fn test_full_bus_drops_without_blocking() {
        let (publisher, mut receiver) = channel(2);
        assert!(publisher.publish(Event::PaymentOk).is_ok());
        assert!(publisher.publish(Event::PaymentCancel).is_ok());
        assert_eq!(publisher.publish(Event::NoNetwork), Err(BusError::Full));

        let stats = publisher.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.dropped, 1);

        // The dropped event never shows up
        assert_eq!(receiver.try_consume(), Some(Event::PaymentOk));
        assert_eq!(receiver.try_consume(), Some(Event::PaymentCancel));
        assert_eq!(receiver.try_consume(), None);
    }

    #[test]
    fn test_single_producer_fifo_order() {
        let (publisher, mut receiver) = channel(8);
        for d in 0..5 {
            publisher.publish(Event::Keypad(Key::Digit(d))).unwrap();
        }
        for d in 0..5 {
            assert_eq!(receiver.try_consume(), Some(Event::Keypad(Key::Digit(d))));
        }
    }

    #[tokio::test]
    async fn test_consume_times_out_on_empty_bus() {
        let (_publisher, mut receiver) = channel(4);
        let result = receiver.consume(Duration::from_millis(5)).await;
        assert_eq!(result, Err(BusError::Timeout));
    }

    #[tokio::test]
    async fn test_consume_reports_closed_bus() {
        let (publisher, mut receiver) = channel(4);
        drop(publisher);
        let result = receiver.consume(Duration::from_millis(5)).await;
        assert_eq!(result, Err(BusError::Closed));
    }

    #[test]
    fn test_publish_to_closed_bus() {
        let (publisher, receiver) = channel(4);
        drop(receiver);
        assert_eq!(publisher.publish(Event::DeliveryDone), Err(BusError::Closed));
    }
}
