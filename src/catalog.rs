use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Outputs on the motor multiplexer (4 select lines).
pub const MUX_CHANNELS: u8 = 16;

/// Remote VEND slots are numbered 1..=MAX_SLOT.
pub const MAX_SLOT: u8 = 4;

/// Multiplexer output index driving one dispensing motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel(u8);

impl Channel {
    /// Reserved value for "no such product". Sits outside 0..MUX_CHANNELS.
    pub const INVALID: Channel = Channel(0xFF);

    pub const fn new(index: u8) -> Self {
        Channel(index)
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 < MUX_CHANNELS
    }

    pub fn checked(self) -> Option<Channel> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Keypad order code -> motor channel. Channel 5 is not wired on this machine.
const ORDER_TABLE: [(u8, Channel); 6] = [
    (11, Channel::new(0)),
    (12, Channel::new(1)),
    (13, Channel::new(2)),
    (21, Channel::new(3)),
    (22, Channel::new(4)),
    (23, Channel::new(6)),
];

const fn table_is_wired() -> bool {
    let mut i = 0;
    while i < ORDER_TABLE.len() {
        let (code, channel) = ORDER_TABLE[i];
        if !channel.is_valid() || code < 10 || code > 99 {
            return false;
        }
        i += 1;
    }
    true
}

const_assert!(!Channel::INVALID.is_valid());
const_assert!(table_is_wired());

/// Maps a two-digit order code to its channel, or [`Channel::INVALID`].
pub fn lookup(code: u8) -> Channel {
    ORDER_TABLE
        .iter()
        .find(|(entry, _)| *entry == code)
        .map_or(Channel::INVALID, |(_, channel)| *channel)
}

pub fn codes() -> impl Iterator<Item = u8> {
    ORDER_TABLE.iter().map(|(code, _)| *code)
}

/// Remote orders address motors by slot number directly.
pub fn slot_channel(slot: u8) -> Channel {
    if (1..=MAX_SLOT).contains(&slot) {
        Channel::new(slot)
    } else {
        Channel::INVALID
    }
}
