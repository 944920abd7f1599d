//! Shared utilities for pipeline integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use courier::handler::{EventHandler, HandlerContext, HandlerError};
use courier::sender::SenderConfig;
use courier::test_utils::{OrderPlaced, ShipOrder, TestMessage};
use courier::transport::ConsumerConfig;

/// Consumer tuning that keeps idle polls short.
pub fn fast_consumer() -> ConsumerConfig {
    ConsumerConfig {
        receive_timeout_ms: 20,
        wait_interval_ms: 20,
        ..ConsumerConfig::default()
    }
}

pub fn fast_sender() -> SenderConfig {
    SenderConfig {
        retry_interval_ms: 10,
        ..SenderConfig::default()
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
macro_rules! wait_until {
    ($condition:expr) => {{
        let mut met = false;
        for _ in 0..500 {
            if $condition {
                met = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(met, "condition not met in time: {}", stringify!($condition));
    }};
}

/// Sends `ShipOrder` for every `OrderPlaced`, and nothing else.
#[derive(Default)]
pub struct ShipOnOrderPlaced {
    pub invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler<OrderPlaced> for ShipOnOrderPlaced {
    async fn handle(&self, event: OrderPlaced, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        ctx.bus_mut().send_command(&ShipOrder::new(&event.order_id))?;
        Ok(())
    }
}

/// Records `(key, n)` for every `TestMessage`, sleeping a little to invite
/// interleaving.
#[derive(Default)]
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<(String, u32)>>>,
}

#[async_trait]
impl EventHandler<TestMessage> for Recorder {
    async fn handle(&self, event: TestMessage, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        let key = ctx.message().key().unwrap_or_default().to_string();
        tokio::time::sleep(Duration::from_millis(u64::from(event.n % 3))).await;
        self.seen.lock().unwrap().push((key, event.n));
        Ok(())
    }
}
