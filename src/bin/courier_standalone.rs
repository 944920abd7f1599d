//! courier-standalone: single-process pipeline host
//!
//! Wires the in-process channel transport, the configured message store, a
//! command sender, an event publisher and two demo subscriptions:
//!
//! ```text
//! orders topic ──→ [orders subscription]   OrderPlaced → ShipOrder command
//! shipping topic ─→ [shipping subscription] ShipOrder   → OrderShipped event
//! ```
//!
//! A few orders are published at startup; the process then runs until Ctrl-C.
//!
//! ## Configuration
//! ```yaml
//! store:
//!   type: sqlite
//!   path: ./data/courier.db
//! consumer:
//!   mailbox_worker_count: 8
//! sender:
//!   retry_interval_ms: 500
//! subscription:
//!   name: orders
//!   consumer_id: courier-1
//!   topics: [orders]
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use courier::config::Config;
use courier::handler::{EventHandler, HandlerContext, HandlerError, HandlerRegistry};
use courier::message::{Message, MessageContext};
use courier::sender::{MessageSender, SenderConfig};
use courier::store::init_store;
use courier::subscriber::{EventSubscriber, SubscriptionOptions};
use courier::transport::{ChannelTransport, TopicSubscription, Transport};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShipOrder {
    order_id: String,
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

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderShipped {
    order_id: String,
}

impl Message for OrderShipped {
    const TYPE_NAME: &'static str = "OrderShipped";

    fn topic(&self) -> String {
        "shipped".to_string()
    }

    fn key(&self) -> Option<String> {
        Some(self.order_id.clone())
    }
}

struct RequestShipping;

#[async_trait]
impl EventHandler<OrderPlaced> for RequestShipping {
    async fn handle(&self, event: OrderPlaced, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        info!(order_id = %event.order_id, "Requesting shipment");
        ctx.put_state(format!("order:{}", event.order_id), &event)?;
        ctx.bus_mut().send_command(&ShipOrder {
            order_id: event.order_id,
        })?;
        Ok(())
    }
}

struct ShipOrders;

#[async_trait]
impl EventHandler<ShipOrder> for ShipOrders {
    async fn handle(&self, command: ShipOrder, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        info!(order_id = %command.order_id, "Shipping order");
        ctx.bus_mut().publish(&OrderShipped {
            order_id: command.order_id,
        })?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    courier::utils::bootstrap::init_tracing();

    let config_path = courier::utils::bootstrap::parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new());
    let store = init_store(&config.store).await?;

    // Both senders mark entries sent; only one reloads the shared outbox.
    let commands = Arc::new(
        MessageSender::new("commands", Arc::clone(&transport), config.sender.clone())
            .with_store(Arc::clone(&store)),
    );
    let events = Arc::new(
        MessageSender::new(
            "events",
            Arc::clone(&transport),
            SenderConfig {
                reload_unsent: false,
                ..config.sender.clone()
            },
        )
        .with_store(Arc::clone(&store)),
    );
    commands.start().await?;
    events.start().await?;

    let mut orders_registry = HandlerRegistry::new();
    orders_registry.register_named::<OrderPlaced, _>("request-shipping", RequestShipping);
    let mut orders_options =
        SubscriptionOptions::new(&config.subscription.name, &config.subscription.consumer_id)
            .with_consumer_config(config.consumer.clone());
    for topic in &config.subscription.topics {
        orders_options = orders_options.with_topic(TopicSubscription::new(topic));
    }
    let orders = EventSubscriber::new(
        orders_options,
        Arc::clone(&transport),
        Arc::new(orders_registry),
        Arc::clone(&store),
    )
    .with_command_sender(Arc::clone(&commands))
    .with_publisher(Arc::clone(&events));

    let mut shipping_registry = HandlerRegistry::new();
    shipping_registry.register_named::<ShipOrder, _>("ship-orders", ShipOrders);
    let shipping = EventSubscriber::new(
        SubscriptionOptions::new("shipping", &config.subscription.consumer_id)
            .with_topic(TopicSubscription::new("shipping"))
            .with_consumer_config(config.consumer.clone()),
        Arc::clone(&transport),
        Arc::new(shipping_registry),
        Arc::clone(&store),
    )
    .with_command_sender(Arc::clone(&commands))
    .with_publisher(Arc::clone(&events));

    orders.start().await?;
    shipping.start().await?;

    for n in 1..=3 {
        let order = OrderPlaced {
            order_id: format!("order-{}", n),
        };
        let context = MessageContext::from_message(&order)?.with_producer("courier-standalone");
        transport.send(&context).await?;
    }

    info!(
        store_type = ?config.store.store_type,
        "courier-standalone running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    orders.stop().await?;
    shipping.stop().await?;
    commands.stop().await?;
    events.stop().await?;

    info!(
        orders = %orders.status(),
        shipping = %shipping.status(),
        commands_sent = commands.sent_count(),
        events_sent = events.sent_count(),
        "Stopped"
    );
    Ok(())
}
