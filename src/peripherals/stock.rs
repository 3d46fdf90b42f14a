use super::display::SharedBus;
use crate::bus::EventPublisher;
use crate::event::Event;
use crate::watchdog::{TaskId, WatchdogSupervisor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MAX_SENSORS: usize = 8;

/// Time-of-flight sensors measuring the gap above each product column.
pub trait RangeSensor {
    /// One single-shot measurement, `None` on a bus or sensor error.
    fn read_mm(&mut self, sensor_id: u8) -> Option<u8>;
}

/// Turns raw distance readings into edge-triggered `StockLow` events.
#[derive(Debug)]
pub struct StockMonitor {
    threshold_mm: u8,
    low: [bool; MAX_SENSORS],
}

impl StockMonitor {
    pub fn new(threshold_mm: u8) -> Self {
        Self { threshold_mm, low: [false; MAX_SENSORS] }
    }

    /// A reading at or above the threshold means the column is nearly empty.
    /// Only the transition into that state produces an event.
    pub fn observe(&mut self, sensor_id: u8, distance_mm: u8) -> Option<Event> {
        let slot = self.low.get_mut(usize::from(sensor_id))?;
        let is_low = distance_mm >= self.threshold_mm;
        let became_low = is_low && !*slot;
        *slot = is_low;
        became_low.then_some(Event::StockLow { sensor_id, distance_mm })
    }

    pub fn is_low(&self, sensor_id: u8) -> bool {
        self.low.get(usize::from(sensor_id)).copied().unwrap_or(false)
    }
}

/// Stock task: polls every sensor in turn, each read inside one bus
/// transaction.
pub async fn run<B: RangeSensor + Send + 'static>(
    bus: SharedBus<B>,
    sensor_count: usize,
    mut monitor: StockMonitor,
    publisher: EventPublisher,
    supervisor: Arc<WatchdogSupervisor>,
    poll_interval: Duration,
) {
    let sensor_count = sensor_count.min(MAX_SENSORS) as u8;
    info!(sensors = sensor_count, "stock sensor task started");
    loop {
        for id in 0..sensor_count {
            match bus.transaction(|sensors| sensors.read_mm(id)) {
                Some(mm) => {
                    debug!(sensor = id, mm, "range reading");
                    if let Some(event) = monitor.observe(id, mm) {
                        warn!(sensor = id, mm, "stock low");
                        let _ = publisher.publish(event);
                    }
                }
                None => warn!(sensor = id, "range read failed"),
            }
        }
        supervisor.heartbeat(TaskId::StockSensor);
        tokio::time::sleep(poll_interval).await;
    }
}
