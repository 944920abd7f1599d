//! Event consumption pipeline.
//!
//! The subscriber starts a transport consumer for its topics and routes every
//! delivered message through the keyed mailbox, so messages sharing a key are
//! handled strictly in arrival order.
//!
//! Each registered handler runs in its own scope:
//! 1. Skip if `(message id, scoped subscription)` was already handled
//! 2. Invoke the handler; its state writes and messages are staged, not stored
//! 3. On success, persist state changes, the idempotency record and the outbox
//!    in one store transaction, commit, then queue the outbox on the senders
//! 4. On failure, drop the staged work, keep only publish-anyway events and saga
//!    replies, persist a failure record with that outbox and queue it
//!
//! The offset is committed once every handler scope has finished, whatever the
//! outcomes were.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::event_bus::{EventBus, OutgoingMessage};
use crate::handler::{HandlerContext, HandlerDescriptor, HandlerRegistry, HandlingOutcome};
use crate::mailbox::{MailboxError, MailboxOptions, MailboxProcessor, WorkerStatus};
use crate::message::{MessageContext, MessageState, SagaInfo};
use crate::saga::{finish_with_error, saga_reply_contexts};
use crate::sender::MessageSender;
use crate::store::{self, MessageStore, StateChange, StoreTransaction};
use crate::transport::{
    ConsumerConfig, ConsumerHandle, OnMessagesReceived, TopicSubscription, Transport,
    TransportError,
};

/// Result type for subscriber operations.
pub type Result<T> = std::result::Result<T, SubscriberError>;

/// Errors starting or stopping a subscriber.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("Subscriber is already running")]
    AlreadyRunning,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
}

/// What a subscriber consumes and under which name.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Subscription name. Scoped per handler for idempotency.
    pub subscription: String,
    pub consumer_id: String,
    pub topics: Vec<TopicSubscription>,
    pub consumer: ConsumerConfig,
}

impl SubscriptionOptions {
    pub fn new(subscription: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            consumer_id: consumer_id.into(),
            topics: Vec::new(),
            consumer: ConsumerConfig::default(),
        }
    }

    pub fn with_topic(mut self, topic: TopicSubscription) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn with_consumer_config(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }
}

struct Pipeline {
    subscription: String,
    consumer_id: String,
    producer: String,
    topics: Vec<TopicSubscription>,
    consumer_config: ConsumerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn MessageStore>,
    command_sender: Option<Arc<MessageSender>>,
    publisher: Option<Arc<MessageSender>>,
    mailbox: MailboxProcessor,
    message_count: AtomicU64,
    // Held for writing while the consumer starts so that no offset commit can
    // observe a half-started subscriber.
    consumer: RwLock<Option<Arc<dyn ConsumerHandle>>>,
}

/// Consumes topics and runs registered handlers with exactly-once bookkeeping.
pub struct EventSubscriber {
    inner: Arc<Pipeline>,
}

impl EventSubscriber {
    pub fn new(
        options: SubscriptionOptions,
        transport: Arc<dyn Transport>,
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let producer = format!("{}.{}", options.subscription, options.consumer_id);
        let mailbox = MailboxProcessor::new(MailboxOptions::from(&options.consumer));
        Self {
            inner: Arc::new(Pipeline {
                subscription: options.subscription,
                consumer_id: options.consumer_id,
                producer,
                topics: options.topics,
                consumer_config: options.consumer,
                transport,
                registry,
                store,
                command_sender: None,
                publisher: None,
                mailbox,
                message_count: AtomicU64::new(0),
                consumer: RwLock::new(None),
            }),
        }
    }

    /// Sender for commands produced by handlers.
    ///
    /// Must be called before the subscriber is shared or started.
    pub fn with_command_sender(mut self, sender: Arc<MessageSender>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.command_sender = Some(sender),
            None => warn!("Subscriber already shared, command sender ignored"),
        }
        self
    }

    /// Sender for events, saga replies and failure notifications.
    ///
    /// Must be called before the subscriber is shared or started.
    pub fn with_publisher(mut self, sender: Arc<MessageSender>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.publisher = Some(sender),
            None => warn!("Subscriber already shared, publisher ignored"),
        }
        self
    }

    /// Identity stamped on every outbound message: `{subscription}.{consumer_id}`.
    pub fn producer(&self) -> &str {
        &self.inner.producer
    }

    /// Start the mailbox and the transport consumer.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut consumer = inner.consumer.write().await;
        if consumer.is_some() {
            return Err(SubscriberError::AlreadyRunning);
        }

        inner.message_count.store(0, Ordering::SeqCst);
        inner.mailbox.start().await?;

        let topics: Vec<String> = inner.topics.iter().map(|t| t.topic.clone()).collect();
        let pipeline = Arc::clone(inner);
        let on_messages: OnMessagesReceived = Arc::new(move |batch: Vec<MessageContext>| {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.on_messages_received(batch).await }.boxed()
        });

        let handle = match inner
            .transport
            .start_consumer(
                &topics,
                &inner.subscription,
                &inner.consumer_id,
                on_messages,
                &inner.consumer_config,
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(stop_err) = inner.mailbox.stop().await {
                    warn!(error = %stop_err, "Failed to stop mailbox after consumer start failure");
                }
                return Err(e.into());
            }
        };
        *consumer = Some(handle);

        info!(
            subscription = %inner.subscription,
            consumer_id = %inner.consumer_id,
            topics = ?topics,
            handlers = inner.registry.handler_count(),
            "Subscriber started"
        );
        Ok(())
    }

    /// Stop polling, then let in-flight handlers finish.
    ///
    /// Messages already queued on a mailbox stay queued and are handled after the
    /// next `start`.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(handle) = inner.consumer.read().await.clone() else {
            return Ok(());
        };

        if let Err(e) = handle.stop().await {
            warn!(subscription = %inner.subscription, error = %e, "Failed to stop consumer");
        }
        inner.mailbox.stop().await?;
        *inner.consumer.write().await = None;

        info!(
            subscription = %inner.subscription,
            pending = inner.mailbox.pending(),
            "Subscriber stopped"
        );
        Ok(())
    }

    /// Route a delivered batch onto the mailboxes.
    pub async fn on_messages_received(&self, batch: Vec<MessageContext>) {
        self.inner.on_messages_received(batch).await;
    }

    /// Run every handler scope for one message, then commit its offset.
    pub async fn consume_message(&self, context: MessageContext) -> Vec<HandlingOutcome> {
        self.inner.consume_message(context).await
    }

    /// Messages dispatched since the last start.
    pub fn message_count(&self) -> u64 {
        self.inner.message_count.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> String {
        format!("Handled message count {}", self.message_count())
    }

    pub fn mailbox_status(&self) -> WorkerStatus {
        self.inner.mailbox.status()
    }
}

impl Pipeline {
    async fn on_messages_received(self: &Arc<Self>, batch: Vec<MessageContext>) {
        for context in batch {
            let filtered_out = self
                .topics
                .iter()
                .find(|t| t.topic == context.topic())
                .is_some_and(|t| !t.accepts(context.tags()));
            if filtered_out {
                debug!(
                    message_id = %context.message_id(),
                    topic = %context.topic(),
                    tags = ?context.tags(),
                    "Message filtered out by tags"
                );
                self.commit_offset(&context).await;
                continue;
            }

            let key = match context.key() {
                Some(key) if !key.is_empty() => key.to_string(),
                _ => context.message_id().to_string(),
            };
            let pipeline = Arc::clone(self);
            self.mailbox.process(key, async move {
                pipeline.consume_message(context).await;
            });
            self.message_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn consume_message(&self, context: MessageContext) -> Vec<HandlingOutcome> {
        let context = Arc::new(context);
        let handlers = self.registry.handlers_for(context.type_name());
        if handlers.is_empty() {
            debug!(
                message_id = %context.message_id(),
                type_name = %context.type_name(),
                "No handler registered"
            );
        }

        let mut outcomes = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let scoped = format!("{}.{}", self.subscription, handler.name());
            outcomes.push(self.handle_scope(&context, handler, &scoped).await);
        }

        self.commit_offset(&context).await;
        outcomes
    }

    #[tracing::instrument(
        name = "subscriber.handle",
        skip_all,
        fields(
            message_id = %context.message_id(),
            topic = %context.topic(),
            key = ?context.key(),
            subscription = %scoped
        )
    )]
    async fn handle_scope(
        &self,
        context: &Arc<MessageContext>,
        handler: &HandlerDescriptor,
        scoped: &str,
    ) -> HandlingOutcome {
        match self.store.has_handled(context.message_id(), scoped).await {
            Ok(true) => {
                debug!("Message already handled, skipping");
                return HandlingOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => {
                let outcome = HandlingOutcome::SystemFailure(e.to_string());
                return self.fail(context, scoped, EventBus::new(), outcome).await;
            }
        }

        let invoked = AssertUnwindSafe(handler.invoke(HandlerContext::new(Arc::clone(context))))
            .catch_unwind()
            .await;
        let (ctx, result) = match invoked {
            Ok(pair) => pair,
            Err(_) => {
                let outcome = HandlingOutcome::SystemFailure("handler panicked".to_string());
                return self.fail(context, scoped, EventBus::new(), outcome).await;
            }
        };
        let (bus, changes) = ctx.into_parts();

        if let Err(e) = result {
            return self.fail(context, scoped, bus, e.into()).await;
        }

        let commands: Vec<MessageContext> = bus
            .commands()
            .iter()
            .map(|command| self.wrap(command, context.saga_info()))
            .collect();
        let mut events: Vec<MessageContext> = bus
            .events()
            .iter()
            .map(|event| self.wrap(event, context.saga_info()))
            .collect();
        events.extend(saga_reply_contexts(
            context.saga_info(),
            bus.saga_results(),
            &self.producer,
            self.transport.as_ref(),
        ));

        // The handler's writes are staged in its context, so the store
        // transaction only spans the bookkeeping.
        let tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                let outcome = HandlingOutcome::SystemFailure(e.to_string());
                return self.fail(context, scoped, bus, outcome).await;
            }
        };
        if let Err(e) = write_handled(tx, context, scoped, &changes, &commands, &events).await {
            let outcome = HandlingOutcome::SystemFailure(e.to_string());
            return self.fail(context, scoped, bus, outcome).await;
        }

        debug!(
            commands = commands.len(),
            events = events.len(),
            "Message handled"
        );
        self.dispatch(self.command_sender.as_ref(), commands, "command");
        self.dispatch(self.publisher.as_ref(), events, "event");
        HandlingOutcome::Handled
    }

    /// Failure branch: everything but publish-anyway events and saga replies is
    /// discarded, the failure is recorded, and what is left is published.
    async fn fail(
        &self,
        context: &MessageContext,
        scoped: &str,
        mut bus: EventBus,
        outcome: HandlingOutcome,
    ) -> HandlingOutcome {
        let saga_info = context.saga_info();
        let mut outbox = Vec::new();

        let error = match &outcome {
            HandlingOutcome::DomainFailure(domain) => {
                warn!(error = %domain, "Handler rejected message");
                // The notification answers the inbound message, not its key or saga.
                if let Some(event) = &domain.event {
                    outbox.push(self.transport.wrap_message(
                        event.payload.clone(),
                        &event.topic,
                        None,
                        Some(context.message_id().to_string()),
                        None,
                        &self.producer,
                    ));
                }
                Some(domain.to_string())
            }
            HandlingOutcome::SystemFailure(cause) => {
                error!(error = %cause, "Handling message failed");
                if saga_info.is_some() {
                    if let Err(e) = finish_with_error(&mut bus, cause) {
                        error!(error = %e, "Failed to encode saga failure");
                    }
                }
                Some(cause.clone())
            }
            HandlingOutcome::Handled | HandlingOutcome::Skipped => None,
        };
        let Some(error) = error else {
            return outcome;
        };

        outbox.extend(
            bus.publish_anyway_events()
                .iter()
                .map(|event| self.wrap(event, saga_info)),
        );
        outbox.extend(saga_reply_contexts(
            saga_info,
            bus.saga_results(),
            &self.producer,
            self.transport.as_ref(),
        ));

        if let Err(e) = self
            .store
            .record_failure(context, scoped, &error, &outbox)
            .await
        {
            error!(critical = true, error = %e, "Failed to record handling failure");
        }

        self.dispatch(self.publisher.as_ref(), outbox, "event");
        outcome
    }

    fn wrap(
        &self,
        outgoing: &OutgoingMessage,
        saga_info: Option<&SagaInfo>,
    ) -> MessageContext {
        self.transport.wrap_message(
            outgoing.payload.clone(),
            &outgoing.topic,
            outgoing.key.clone(),
            None,
            saga_info.cloned(),
            &self.producer,
        )
    }

    fn dispatch(&self, sender: Option<&Arc<MessageSender>>, contexts: Vec<MessageContext>, kind: &str) {
        if contexts.is_empty() {
            return;
        }
        match sender {
            Some(sender) => sender.send_states(contexts.into_iter().map(MessageState::new).collect()),
            None => warn!(
                kind,
                count = contexts.len(),
                "No sender configured, messages stay in the outbox"
            ),
        }
    }

    async fn commit_offset(&self, context: &MessageContext) {
        let consumer = self.consumer.read().await;
        let Some(consumer) = consumer.as_ref() else {
            warn!(message_id = %context.message_id(), "No running consumer, offset not committed");
            return;
        };
        if let Err(e) = consumer.commit_offset(context).await {
            error!(
                critical = true,
                message_id = %context.message_id(),
                topic = %context.topic(),
                error = %e,
                "Failed to commit offset"
            );
        }
    }
}

/// Persist the handler's effects and commit. Rolls back on any failure.
async fn write_handled(
    mut tx: Box<dyn StoreTransaction>,
    context: &MessageContext,
    scoped: &str,
    changes: &[StateChange],
    commands: &[MessageContext],
    events: &[MessageContext],
) -> store::Result<()> {
    if let Err(e) = tx.apply_changes(changes).await {
        rollback(tx).await;
        return Err(e);
    }
    if let Err(e) = tx.record_handled(context, scoped, commands, events).await {
        rollback(tx).await;
        return Err(e);
    }
    tx.commit().await
}

async fn rollback(tx: Box<dyn StoreTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}
