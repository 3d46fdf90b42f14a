//! # Vending Machine Controller Core
//!
//! Embedded-style control core for a keypad-driven vending machine with a remote
//! payment/network node on a serial line. Independent peripheral tasks feed a
//! bounded event bus, a single orchestrator turns those events into the order
//! fulfillment protocol, and a watchdog supervisor tracks task liveness and gates
//! the hardware watchdog reload.
//!
//! ## Features
//!
//! - **Event bus**: bounded FIFO, non-blocking publish, bounded-wait consume
//! - **Order orchestration**: keypad orders, payment, remote multi-item orders
//! - **Liveness supervision**: per-task heartbeats, health-gated watchdog reload
//! - **Line protocol**: CR/LF framed ASCII link to the payment node
//! - **Embedded-friendly**: fixed-capacity buffers for all per-order data
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use vendbus::bus;
//! use vendbus::event::{Event, Key};
//!
//! let (publisher, mut receiver) = bus::channel(16);
//! publisher.publish(Event::Keypad(Key::Digit(1))).unwrap();
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let event = runtime.block_on(receiver.consume(Duration::from_millis(10))).unwrap();
//! assert_eq!(event, Event::Keypad(Key::Digit(1)));
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Bounded many-producer/one-consumer event queue
//! - [`orchestrator`] - Machine state owner and order state machine
//! - [`watchdog`] - Task liveness tracking and hardware watchdog gating
//! - [`protocol`] / [`link`] - Serial line framing, classification, outbound lines
//! - [`peripherals`] - Display, motor, keypad and stock collaborators
//! - [`hal`] - Narrow hardware interfaces with host implementations

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

extern crate alloc;

pub mod bus;
pub mod catalog;
pub mod config;
pub mod event;
pub mod fault;
pub mod hal;
pub mod link;
pub mod orchestrator;
pub mod peripherals;
pub mod protocol;
pub mod state;
pub mod supervision;
pub mod watchdog;

// Re-export main public types for convenience
pub use bus::{EventPublisher, EventReceiver};
pub use config::MachineConfig;
pub use event::Event;
pub use orchestrator::Orchestrator;
pub use state::MachineState;
pub use watchdog::{TaskId, WatchdogSupervisor};
