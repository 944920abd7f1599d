//! Test utilities.
//!
//! Sample message types and handlers shared by unit and integration tests.
//! The fakes for the transport and the store live next to their traits:
//! `transport::MockTransport` and `store::InMemoryMessageStore`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::handler::{DomainError, EventHandler, HandlerContext, HandlerError};
use crate::message::Message;

/// Event published when an order is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
}

impl OrderPlaced {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
        }
    }
}

impl Message for OrderPlaced {
    const TYPE_NAME: &'static str = "OrderPlaced";

    fn topic(&self) -> String {
        "orders".to_string()
    }

    fn key(&self) -> Option<String> {
        Some(self.order_id.clone())
    }
}

/// Command asking shipping to dispatch an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipOrder {
    pub order_id: String,
}

impl ShipOrder {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
        }
    }
}

impl Message for ShipOrder {
    const TYPE_NAME: &'static str = "ShipOrder";

    fn topic(&self) -> String {
        "shipping".to_string()
    }

    fn key(&self) -> Option<String> {
        Some(self.order_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: String,
}

impl OrderShipped {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
        }
    }
}

impl Message for OrderShipped {
    const TYPE_NAME: &'static str = "OrderShipped";

    fn key(&self) -> Option<String> {
        Some(self.order_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRejected {
    pub order_id: String,
    pub reason: String,
}

impl OrderRejected {
    pub fn new(order_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            reason: reason.into(),
        }
    }
}

impl Message for OrderRejected {
    const TYPE_NAME: &'static str = "OrderRejected";
}

/// Keyless message for ordering and retry tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMessage {
    pub n: u32,
}

impl TestMessage {
    pub fn new(n: u32) -> Self {
        Self { n }
    }
}

impl Message for TestMessage {
    const TYPE_NAME: &'static str = "TestMessage";
}

/// How `ShippingHandler` reacts to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShippingBehavior {
    /// Store the order, send `ShipOrder`, publish `OrderShipped`.
    Ship,
    /// Reject with a domain error carrying `OrderRejected`.
    Reject,
    /// Fail with a system error.
    Fail,
}

/// Handler for `OrderPlaced` that counts its invocations.
pub struct ShippingHandler {
    behavior: ShippingBehavior,
    invocations: Arc<AtomicUsize>,
}

impl ShippingHandler {
    pub fn new(behavior: ShippingBehavior) -> Self {
        Self {
            behavior,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared invocation counter, readable after the handler is registered.
    pub fn invocations(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }
}

#[async_trait]
impl EventHandler<OrderPlaced> for ShippingHandler {
    async fn handle(&self, event: OrderPlaced, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            ShippingBehavior::Ship => {
                ctx.put_state(format!("order:{}", event.order_id), &event)?;
                ctx.bus_mut().send_command(&ShipOrder::new(&event.order_id))?;
                ctx.bus_mut().publish(&OrderShipped::new(&event.order_id))?;
                Ok(())
            }
            ShippingBehavior::Reject => {
                let rejected = OrderRejected::new(&event.order_id, "out of stock");
                Err(DomainError::new("out of stock").with_event(&rejected)?.into())
            }
            ShippingBehavior::Fail => Err(HandlerError::system("warehouse unreachable")),
        }
    }
}
