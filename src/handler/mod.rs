//! Handler registration and invocation.
//!
//! Handlers are registered per payload type. At runtime the registry is read-only:
//! the pipeline looks up the descriptors for a payload's type name and invokes each
//! through the same erased `invoke` capability, whatever its concrete type.
//!
//! Handlers report failures through `HandlerError`. The pipeline folds the result
//! into a `HandlingOutcome` and branches on it explicitly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::error;

use crate::event_bus::{EventBus, OutgoingMessage};
use crate::message::{Message, MessageContext, MessageError, Payload, SagaInfo};
use crate::store::StateChange;

// ============================================================================
// Errors and outcomes
// ============================================================================

/// Expected business-rule violation.
///
/// May carry a notification event that is published even though the handler's
/// staged work is discarded.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DomainError {
    pub message: String,
    pub event: Option<OutgoingMessage>,
}

impl DomainError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            event: None,
        }
    }

    /// Attach the event to publish when this error surfaces.
    pub fn with_event<E: Message>(mut self, event: &E) -> Result<Self, MessageError> {
        self.event = Some(OutgoingMessage::from_message(event)?);
        Ok(self)
    }
}

/// Errors a handler can return.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("System error: {0}")]
    System(String),
}

impl HandlerError {
    pub fn system(cause: impl fmt::Display) -> Self {
        Self::System(cause.to_string())
    }
}

impl From<MessageError> for HandlerError {
    fn from(e: MessageError) -> Self {
        Self::System(e.to_string())
    }
}

impl From<crate::store::StoreError> for HandlerError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::System(e.to_string())
    }
}

/// Result of one handler scope.
#[derive(Debug)]
pub enum HandlingOutcome {
    /// Committed with its outbox.
    Handled,
    /// Idempotency record already present.
    Skipped,
    /// Business rule rejected the message.
    DomainFailure(DomainError),
    /// Anything else: infrastructure, decoding, panics.
    SystemFailure(String),
}

impl HandlingOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::DomainFailure(_) | Self::SystemFailure(_))
    }
}

impl From<HandlerError> for HandlingOutcome {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Domain(domain) => Self::DomainFailure(domain),
            HandlerError::System(cause) => Self::SystemFailure(cause),
        }
    }
}

// ============================================================================
// Handler context
// ============================================================================

/// Everything a handler may touch during one invocation.
///
/// Owned by the invocation: the pipeline builds it, hands it to the handler and
/// takes it back afterwards to drain the bus and the staged state changes.
pub struct HandlerContext {
    message: Arc<MessageContext>,
    bus: EventBus,
    changes: Vec<StateChange>,
}

impl HandlerContext {
    pub fn new(message: Arc<MessageContext>) -> Self {
        Self {
            message,
            bus: EventBus::new(),
            changes: Vec::new(),
        }
    }

    /// The inbound message being handled.
    pub fn message(&self) -> &MessageContext {
        &self.message
    }

    pub fn saga_info(&self) -> Option<&SagaInfo> {
        self.message.saga_info()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    /// Stage a business-state write, committed with the idempotency record.
    pub fn put_state<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), HandlerError> {
        let value = serde_json::to_value(value).map_err(HandlerError::system)?;
        self.changes.push(StateChange::Put {
            key: key.into(),
            value,
        });
        Ok(())
    }

    /// Stage a business-state delete.
    pub fn delete_state(&mut self, key: impl Into<String>) {
        self.changes.push(StateChange::Delete { key: key.into() });
    }

    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    pub fn into_parts(self) -> (EventBus, Vec<StateChange>) {
        (self.bus, self.changes)
    }
}

// ============================================================================
// Handler traits
// ============================================================================

/// Asynchronous handler, awaited in place.
#[async_trait]
pub trait EventHandler<E: Message>: Send + Sync + 'static {
    async fn handle(&self, event: E, ctx: &mut HandlerContext) -> Result<(), HandlerError>;
}

/// Blocking handler, run on the blocking thread pool.
pub trait SyncEventHandler<E: Message>: Send + Sync + 'static {
    fn handle(&self, event: E, ctx: &mut HandlerContext) -> Result<(), HandlerError>;
}

/// Whether a handler is awaited or run on a blocking worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Sync,
    Async,
}

/// Type-erased invocation used by the registry.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn invoke(&self, ctx: HandlerContext) -> (HandlerContext, Result<(), HandlerError>);
}

struct AsyncAdapter<E, H> {
    inner: H,
    _event: std::marker::PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for AsyncAdapter<E, H>
where
    E: Message,
    H: EventHandler<E>,
{
    async fn invoke(&self, mut ctx: HandlerContext) -> (HandlerContext, Result<(), HandlerError>) {
        let event = match ctx.message().payload().decode::<E>() {
            Ok(event) => event,
            Err(e) => return (ctx, Err(e.into())),
        };
        let result = self.inner.handle(event, &mut ctx).await;
        (ctx, result)
    }
}

struct SyncAdapter<E, H> {
    inner: Arc<H>,
    _event: std::marker::PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for SyncAdapter<E, H>
where
    E: Message,
    H: SyncEventHandler<E>,
{
    async fn invoke(&self, ctx: HandlerContext) -> (HandlerContext, Result<(), HandlerError>) {
        let event = match ctx.message().payload().decode::<E>() {
            Ok(event) => event,
            Err(e) => return (ctx, Err(e.into())),
        };
        let message = Arc::clone(&ctx.message);
        let inner = Arc::clone(&self.inner);

        let joined = tokio::task::spawn_blocking(move || {
            let mut ctx = ctx;
            let result = inner.handle(event, &mut ctx);
            (ctx, result)
        })
        .await;

        match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(message_id = %message.message_id(), error = %e, "Blocking handler panicked");
                (
                    HandlerContext::new(message),
                    Err(HandlerError::system(format!("handler panicked: {}", e))),
                )
            }
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A registered handler.
#[derive(Clone)]
pub struct HandlerDescriptor {
    name: String,
    kind: HandlerKind,
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerDescriptor {
    /// Handler name, used to scope the subscription for idempotency.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Run the handler against the message held by `ctx`.
    pub async fn invoke(&self, ctx: HandlerContext) -> (HandlerContext, Result<(), HandlerError>) {
        self.handler.invoke(ctx).await
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Payload type name to ordered handler descriptors.
#[derive(Default, Debug)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<HandlerDescriptor>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler under its Rust type name.
    pub fn register<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: Message,
        H: EventHandler<E>,
    {
        self.register_named::<E, H>(std::any::type_name::<H>(), handler)
    }

    /// Register an async handler under an explicit name.
    pub fn register_named<E, H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        E: Message,
        H: EventHandler<E>,
    {
        let adapter = AsyncAdapter {
            inner: handler,
            _event: std::marker::PhantomData,
        };
        self.insert(E::TYPE_NAME, name.into(), HandlerKind::Async, Arc::new(adapter))
    }

    /// Register a blocking handler under its Rust type name.
    pub fn register_sync<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: Message,
        H: SyncEventHandler<E>,
    {
        let adapter = SyncAdapter {
            inner: Arc::new(handler),
            _event: std::marker::PhantomData,
        };
        self.insert(
            E::TYPE_NAME,
            std::any::type_name::<H>().to_string(),
            HandlerKind::Sync,
            Arc::new(adapter),
        )
    }

    fn insert(
        &mut self,
        type_name: &str,
        name: String,
        kind: HandlerKind,
        handler: Arc<dyn ErasedHandler>,
    ) -> &mut Self {
        self.handlers
            .entry(type_name.to_string())
            .or_default()
            .push(HandlerDescriptor {
                name,
                kind,
                handler,
            });
        self
    }

    /// Handlers for a payload type, in registration order.
    pub fn handlers_for(&self, type_name: &str) -> &[HandlerDescriptor] {
        self.handlers
            .get(type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests;
