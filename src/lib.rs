//! Courier - ordered, idempotent event consumption
//!
//! Consumes event messages from a topic transport, dispatches them to
//! registered handlers with per-key ordering, records each handled message
//! together with the messages it produced in one store transaction, and drains
//! those outbound messages through senders that retry until delivery.

pub mod config;
pub mod event_bus;
pub mod handler;
pub mod mailbox;
pub mod message;
pub mod saga;
pub mod sender;
pub mod store;
pub mod subscriber;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
