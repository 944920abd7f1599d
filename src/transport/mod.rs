//! Topic/queue transport contract.
//!
//! The pipeline only needs four things from a transport: start a consumer that
//! hands over batches of messages, commit a consumed message's offset, stop the
//! consumer, and send an outbound message.
//!
//! Implementations:
//! - `channel`: in-process topic log for standalone mode
//! - `mock`: recording transport for tests

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::message::{MessageContext, Payload, SagaInfo};

pub mod channel;
pub mod mock;

pub use channel::ChannelTransport;
pub use mock::MockTransport;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    Send(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Consumer error: {0}")]
    Consumer(String),
}

/// Callback invoked with every batch a consumer receives.
///
/// The consumer awaits the returned future before polling again.
pub type OnMessagesReceived =
    Arc<dyn Fn(Vec<MessageContext>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Predicate over a message's tags.
pub type TagFilter = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;

/// A topic a subscription consumes, with an optional tag filter.
#[derive(Clone)]
pub struct TopicSubscription {
    pub topic: String,
    pub tag_filter: Option<TagFilter>,
}

impl TopicSubscription {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            tag_filter: None,
        }
    }

    pub fn with_tag_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.tag_filter = Some(Arc::new(filter));
        self
    }

    /// Whether a message with `tags` should be handled.
    pub fn accepts(&self, tags: &[String]) -> bool {
        self.tag_filter.as_ref().map_or(true, |filter| filter(tags))
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topic", &self.topic)
            .field("tag_filter", &self.tag_filter.is_some())
            .finish()
    }
}

/// Consumer tuning shared by the poll loop and the mailbox scheduler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Tasks a mailbox runs per drain cycle before yielding its worker.
    pub mailbox_batch_count: usize,
    /// Mailboxes drained concurrently.
    pub mailbox_worker_count: usize,
    /// How long an idle poll waits for new messages.
    pub receive_timeout_ms: u64,
    /// Unacknowledged messages at which the poll loop pauses.
    pub full_load_threshold: usize,
    /// Pause length while at full load.
    pub wait_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            mailbox_batch_count: 100,
            mailbox_worker_count: 16,
            receive_timeout_ms: 1000,
            full_load_threshold: 1000,
            wait_interval_ms: 1000,
        }
    }
}

impl ConsumerConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }
}

/// A running consumer.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    /// Acknowledge a consumed message.
    async fn commit_offset(&self, context: &MessageContext) -> Result<()>;

    /// Stop polling. Messages already handed over are unaffected.
    async fn stop(&self) -> Result<()>;
}

/// Topic/queue client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start polling `topics` on behalf of `subscription`.
    async fn start_consumer(
        &self,
        topics: &[String],
        subscription: &str,
        consumer_id: &str,
        on_messages: OnMessagesReceived,
        config: &ConsumerConfig,
    ) -> Result<Arc<dyn ConsumerHandle>>;

    /// Deliver one outbound message to its topic.
    async fn send(&self, context: &MessageContext) -> Result<()>;

    /// Build an outbound envelope.
    fn wrap_message(
        &self,
        payload: Payload,
        topic: &str,
        key: Option<String>,
        correlation_id: Option<String>,
        saga_info: Option<SagaInfo>,
        producer: &str,
    ) -> MessageContext {
        MessageContext::new(payload, topic)
            .with_key(key)
            .with_correlation_id(correlation_id)
            .with_saga_info(saga_info)
            .with_producer(producer)
    }
}
