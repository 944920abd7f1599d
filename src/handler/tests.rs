use super::*;
use crate::test_utils::{OrderPlaced, OrderShipped, ShipOrder};

struct Shipper;

#[async_trait]
impl EventHandler<OrderPlaced> for Shipper {
    async fn handle(&self, event: OrderPlaced, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        ctx.bus_mut().send_command(&ShipOrder::new(&event.order_id))?;
        ctx.put_state(format!("order/{}", event.order_id), &"placed")?;
        Ok(())
    }
}

struct BlockingAuditor;

impl SyncEventHandler<OrderPlaced> for BlockingAuditor {
    fn handle(&self, event: OrderPlaced, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        std::thread::sleep(std::time::Duration::from_millis(5));
        ctx.bus_mut().publish(&OrderShipped::new(&event.order_id))?;
        Ok(())
    }
}

struct Rejecter;

#[async_trait]
impl EventHandler<OrderPlaced> for Rejecter {
    async fn handle(&self, _event: OrderPlaced, _ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        Err(DomainError::new("order limit exceeded").into())
    }
}

struct Panicker;

impl SyncEventHandler<OrderPlaced> for Panicker {
    fn handle(&self, _event: OrderPlaced, _ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        panic!("boom");
    }
}

fn context_for(event: &OrderPlaced) -> HandlerContext {
    HandlerContext::new(Arc::new(MessageContext::from_message(event).unwrap()))
}

#[test]
fn test_registry_keeps_registration_order() {
    let mut registry = HandlerRegistry::new();
    registry
        .register::<OrderPlaced, _>(Shipper)
        .register_sync::<OrderPlaced, _>(BlockingAuditor);

    let handlers = registry.handlers_for("OrderPlaced");

    assert_eq!(handlers.len(), 2);
    assert!(handlers[0].name().ends_with("Shipper"));
    assert_eq!(handlers[0].kind(), HandlerKind::Async);
    assert!(handlers[1].name().ends_with("BlockingAuditor"));
    assert_eq!(handlers[1].kind(), HandlerKind::Sync);
    assert_eq!(registry.handler_count(), 2);
}

#[test]
fn test_registry_unknown_type_is_empty() {
    let registry = HandlerRegistry::new();
    assert!(registry.handlers_for("Nope").is_empty());
}

#[test]
fn test_register_named() {
    let mut registry = HandlerRegistry::new();
    registry.register_named::<OrderPlaced, _>("shipping-saga", Shipper);

    assert_eq!(registry.handlers_for("OrderPlaced")[0].name(), "shipping-saga");
}

#[tokio::test]
async fn test_async_handler_collects_output() {
    let mut registry = HandlerRegistry::new();
    registry.register::<OrderPlaced, _>(Shipper);
    let handler = &registry.handlers_for("OrderPlaced")[0];

    let (ctx, result) = handler.invoke(context_for(&OrderPlaced::new("o-1"))).await;

    assert!(result.is_ok());
    assert_eq!(ctx.bus().commands().len(), 1);
    assert_eq!(ctx.changes().len(), 1);
}

#[tokio::test]
async fn test_sync_handler_runs_on_blocking_pool() {
    let mut registry = HandlerRegistry::new();
    registry.register_sync::<OrderPlaced, _>(BlockingAuditor);
    let handler = &registry.handlers_for("OrderPlaced")[0];

    let (ctx, result) = handler.invoke(context_for(&OrderPlaced::new("o-2"))).await;

    assert!(result.is_ok());
    assert_eq!(ctx.bus().events().len(), 1);
}

#[tokio::test]
async fn test_sync_handler_panic_becomes_system_failure() {
    let mut registry = HandlerRegistry::new();
    registry.register_sync::<OrderPlaced, _>(Panicker);
    let handler = &registry.handlers_for("OrderPlaced")[0];

    let (ctx, result) = handler.invoke(context_for(&OrderPlaced::new("o-3"))).await;

    assert!(matches!(result, Err(HandlerError::System(_))));
    assert!(ctx.bus().is_empty());
    assert_eq!(ctx.message().key(), Some("o-3"));
}

#[tokio::test]
async fn test_decode_failure_is_system_failure() {
    let mut registry = HandlerRegistry::new();
    registry.register::<OrderPlaced, _>(Shipper);
    let handler = &registry.handlers_for("OrderPlaced")[0];

    let bogus = MessageContext::new(
        Payload::new("OrderPlaced", serde_json::json!({"unexpected": 1})),
        "orders",
    );
    let (_ctx, result) = handler.invoke(HandlerContext::new(Arc::new(bogus))).await;

    assert!(matches!(result, Err(HandlerError::System(_))));
}

#[tokio::test]
async fn test_domain_error_maps_to_domain_outcome() {
    let mut registry = HandlerRegistry::new();
    registry.register::<OrderPlaced, _>(Rejecter);
    let handler = &registry.handlers_for("OrderPlaced")[0];

    let (_ctx, result) = handler.invoke(context_for(&OrderPlaced::new("o-4"))).await;
    let outcome = HandlingOutcome::from(result.unwrap_err());

    assert!(outcome.is_failure());
    match outcome {
        HandlingOutcome::DomainFailure(e) => assert_eq!(e.message, "order limit exceeded"),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_domain_error_with_event() {
    let error = DomainError::new("rejected")
        .with_event(&OrderShipped::new("o-5"))
        .unwrap();

    let event = error.event.unwrap();
    assert_eq!(event.payload.type_name, "OrderShipped");
}

#[test]
fn test_delete_state_is_staged() {
    let mut ctx = context_for(&OrderPlaced::new("o-6"));
    ctx.delete_state("order/o-6");

    let (_bus, changes) = ctx.into_parts();
    assert_eq!(
        changes,
        vec![StateChange::Delete {
            key: "order/o-6".to_string()
        }]
    );
}
