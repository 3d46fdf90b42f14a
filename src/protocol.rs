use crate::event::{truncated_id, Event, OrderId, ProductId};
use arrayvec::ArrayString;
use core::fmt::Write as _;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::warn;

/// Longest inbound line, terminator excluded.
pub const MAX_LINE_LEN: usize = 127;
/// Longest outbound line. Supervision payloads need more than an inbound line.
pub const MAX_OUTBOUND_LEN: usize = 255;

pub const MAX_VEND_QTY: u8 = 10;

pub type LineBuffer = ArrayString<MAX_LINE_LEN>;
pub type OutboundBuffer = ArrayString<MAX_OUTBOUND_LEN>;

const_assert!(MAX_LINE_LEN < MAX_OUTBOUND_LEN);
const_assert!(crate::event::MAX_ID_LEN < MAX_LINE_LEN);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("byte 0x{0:02X} is not printable ASCII")]
    InvalidByte(u8),
    #[error("line longer than {} bytes", MAX_LINE_LEN)]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("outbound line longer than {} bytes", MAX_OUTBOUND_LEN)]
    TooLong,
    #[error("outbound line contains byte 0x{0:02X}")]
    InvalidChar(u8),
    #[error("link disconnected")]
    Disconnected,
}

pub fn is_line_byte(byte: u8) -> bool {
    (0x20..=0x7E).contains(&byte) || byte == b'\r' || byte == b'\n'
}

/// Reassembles CR/LF terminated lines from single received bytes.
#[derive(Debug)]
pub struct LineAssembler {
    buffer: LineBuffer,
    last_byte_ms: Option<u64>,
    inter_byte_timeout_ms: u64,
    discarded: u32,
    // Rest of an over-long line is dropped up to its terminator
    skipping: bool,
}

impl LineAssembler {
    pub fn new(inter_byte_timeout_ms: u64) -> Self {
        Self {
            buffer: LineBuffer::new(),
            last_byte_ms: None,
            inter_byte_timeout_ms,
            discarded: 0,
            skipping: false,
        }
    }

    /// Feeds one byte. Returns the completed line on a terminator,
    /// `WouldBlock` while a line is still being assembled.
    pub fn push(&mut self, byte: u8, now_ms: u64) -> nb::Result<LineBuffer, FramingError> {
        if let Some(last) = self.last_byte_ms {
            if now_ms.saturating_sub(last) > self.inter_byte_timeout_ms {
                if !self.buffer.is_empty() {
                    self.discard("inter-byte timeout");
                }
                self.skipping = false;
            }
        }
        self.last_byte_ms = Some(now_ms);

        match byte {
            b'\r' | b'\n' => {
                if core::mem::take(&mut self.skipping) || self.buffer.is_empty() {
                    // CR of a CRLF pair, or a blank line
                    return Err(nb::Error::WouldBlock);
                }
                Ok(core::mem::replace(&mut self.buffer, LineBuffer::new()))
            }
            b if !is_line_byte(b) => {
                self.discard("invalid byte");
                Err(nb::Error::Other(FramingError::InvalidByte(b)))
            }
            _ if self.skipping => Err(nb::Error::WouldBlock),
            b => {
                if self.buffer.try_push(char::from(b)).is_err() {
                    self.discard("line overflow");
                    self.skipping = true;
                    return Err(nb::Error::Other(FramingError::Overflow));
                }
                Err(nb::Error::WouldBlock)
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Partial lines thrown away so far.
    pub fn discarded(&self) -> u32 {
        self.discarded
    }

    fn discard(&mut self, reason: &str) {
        if !self.buffer.is_empty() {
            warn!(reason, len = self.buffer.len(), "discarding partial line");
        } else {
            warn!(reason, "discarding byte");
        }
        self.buffer.clear();
        self.discarded = self.discarded.wrapping_add(1);
    }
}

/// What an inbound line means, before any session checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    NfcUid,
    NfcError,
    NoNetwork,
    PaymentDenied,
    OrderStart(OrderId),
    Vend { slot: u8, qty: u8, product_id: ProductId },
    OrderEnd,
    OrderFailed,
    /// Recognised command with unusable arguments.
    Malformed,
    Unknown,
}

impl Inbound {
    /// The bus event this line maps to, if any.
    pub fn event(&self) -> Option<Event> {
        match self {
            Inbound::NfcUid => Some(Event::PaymentOk),
            Inbound::NfcError | Inbound::PaymentDenied => Some(Event::PaymentCancel),
            Inbound::NoNetwork => Some(Event::NoNetwork),
            Inbound::OrderStart(id) => Some(Event::OrderStart(*id)),
            Inbound::Vend { slot, qty, product_id } => Some(Event::VendItem {
                slot: *slot,
                qty: *qty,
                product_id: *product_id,
            }),
            Inbound::OrderEnd => Some(Event::OrderComplete),
            Inbound::OrderFailed => Some(Event::OrderFailed),
            Inbound::Malformed | Inbound::Unknown => None,
        }
    }
}

const ORDER_FAILURE_LINES: [&str; 5] = [
    "QR_TOKEN_ERROR",
    "QR_TOKEN_INVALID",
    "QR_TOKEN_BUSY",
    "QR_TOKEN_NO_NETWORK",
    "ORDER_FAILED",
];

/// Classifies one line. Never fails: anything unrecognised is `Unknown`.
pub fn classify(line: &str) -> Inbound {
    let line = line.trim();

    if line.starts_with("NFC_UID:") {
        Inbound::NfcUid
    } else if line.starts_with("NFC_ERR:") {
        Inbound::NfcError
    } else if line.starts_with("NAK:STATE:PAYING:NO_NET") {
        Inbound::NoNetwork
    } else if line.starts_with("NAK:PAYMENT:DENIED") {
        Inbound::PaymentDenied
    } else if let Some(id) = line.strip_prefix("ORDER_START:") {
        let id = id.trim();
        if id.is_empty() {
            Inbound::Malformed
        } else {
            Inbound::OrderStart(truncated_id(id))
        }
    } else if line == "VEND" {
        Inbound::Malformed
    } else if let Some(args) = line.strip_prefix("VEND ") {
        parse_vend(args)
    } else if line == "ORDER_END" {
        Inbound::OrderEnd
    } else if ORDER_FAILURE_LINES.contains(&line) {
        Inbound::OrderFailed
    } else {
        Inbound::Unknown
    }
}

// `<slot> <qty> <product_id>`. Range checks happen at the link, not here.
fn parse_vend(args: &str) -> Inbound {
    let mut fields = args.split_whitespace();
    let (Some(slot), Some(qty), Some(product), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Inbound::Malformed;
    };
    match (slot.parse::<u8>(), qty.parse::<u8>()) {
        (Ok(slot), Ok(qty)) => Inbound::Vend { slot, qty, product_id: truncated_id(product) },
        _ => Inbound::Malformed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    NoActiveOrder,
    OrderAlreadyActive,
    InvalidSlot,
    InvalidQty,
    Malformed,
    MotorError,
    MotorQueueFull,
    OrderFailed,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::NoActiveOrder => "NO_ACTIVE_ORDER",
            Reason::OrderAlreadyActive => "ORDER_ALREADY_ACTIVE",
            Reason::InvalidSlot => "INVALID_SLOT",
            Reason::InvalidQty => "INVALID_QTY",
            Reason::Malformed => "MALFORMED",
            Reason::MotorError => "MOTOR_ERROR",
            Reason::MotorQueueFull => "MOTOR_QUEUE_FULL",
            Reason::OrderFailed => "ORDER_FAILED",
        }
    }
}

/// Lines sent to the network node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    OrderAck,
    OrderNak(Reason),
    VendCompleted { slot: u8 },
    VendFailed { slot: u8, reason: Reason },
    DeliveryCompleted,
    DeliveryFailed(Reason),
    StatePaying,
    /// Pre-rendered JSON payload.
    SupervisionError(alloc::string::String),
}

impl core::fmt::Display for Outbound {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Outbound::OrderAck => write!(f, "ORDER_ACK"),
            Outbound::OrderNak(reason) => write!(f, "ORDER_NAK:{}", reason.as_str()),
            Outbound::VendCompleted { slot } => write!(f, "VEND_COMPLETED:{}", slot),
            Outbound::VendFailed { slot, reason } => {
                write!(f, "VEND_FAILED:{}:{}", slot, reason.as_str())
            }
            Outbound::DeliveryCompleted => write!(f, "DELIVERY_COMPLETED"),
            Outbound::DeliveryFailed(reason) => write!(f, "DELIVERY_FAILED:{}", reason.as_str()),
            Outbound::StatePaying => write!(f, "STATE:PAYING"),
            Outbound::SupervisionError(json) => write!(f, "SUPERVISION_ERROR:{}", json),
        }
    }
}

impl Outbound {
    /// Renders the line without terminator, rejecting anything that would
    /// not survive the serial link.
    pub fn encode(&self) -> Result<OutboundBuffer, LinkError> {
        let mut buffer = OutboundBuffer::new();
        write!(buffer, "{}", self).map_err(|_| LinkError::TooLong)?;
        validate_outbound(&buffer)?;
        Ok(buffer)
    }
}

pub fn validate_outbound(line: &str) -> Result<(), LinkError> {
    if line.len() > MAX_OUTBOUND_LEN {
        return Err(LinkError::TooLong);
    }
    match line.bytes().find(|b| !(0x20..=0x7E).contains(b)) {
        Some(bad) => Err(LinkError::InvalidChar(bad)),
        None => Ok(()),
    }
}
