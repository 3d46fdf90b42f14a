use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};

/// Longest order or product identifier carried on the bus.
pub const MAX_ID_LEN: usize = 31;

pub type OrderId = ArrayString<MAX_ID_LEN>;
pub type ProductId = ArrayString<MAX_ID_LEN>;

/// A validated keypad key. Raw characters are checked by the keypad gate
/// before anything reaches the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    Digit(u8),
    Star,
    Hash,
}

impl Key {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0'..='9' => Some(Key::Digit(c as u8 - b'0')),
            '*' => Some(Key::Star),
            '#' => Some(Key::Hash),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Key::Digit(d) => char::from(b'0' + d),
            Key::Star => '*',
            Key::Hash => '#',
        }
    }
}

/// Everything the orchestrator can be told. Values are copied through the bus
/// and consumed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Keypad(Key),
    PaymentOk,
    PaymentCancel,
    NoNetwork,
    MotorError,
    DeliveryDone,
    StockLow { sensor_id: u8, distance_mm: u8 },
    OrderStart(OrderId),
    VendItem { slot: u8, qty: u8, product_id: ProductId },
    OrderComplete,
    OrderFailed,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Keypad(_) => "KEYPAD",
            Event::PaymentOk => "PAYMENT_OK",
            Event::PaymentCancel => "PAYMENT_CANCEL",
            Event::NoNetwork => "NO_NETWORK",
            Event::MotorError => "MOTOR_ERROR",
            Event::DeliveryDone => "DELIVERY_DONE",
            Event::StockLow { .. } => "STOCK_LOW",
            Event::OrderStart(_) => "ORDER_START",
            Event::VendItem { .. } => "VEND_ITEM",
            Event::OrderComplete => "ORDER_COMPLETE",
            Event::OrderFailed => "ORDER_FAILED",
        }
    }
}

/// Copies `s` into a fixed-capacity id, dropping whatever does not fit.
pub fn truncated_id(s: &str) -> ArrayString<MAX_ID_LEN> {
    let mut id = ArrayString::new();
    for c in s.chars() {
        if id.try_push(c).is_err() {
            break;
        }
    }
    id
}
