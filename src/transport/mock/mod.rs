//! Mock transport for testing.
//!
//! Records sent and committed messages, fails a configurable number of sends, and
//! lets tests push batches straight into a started consumer's callback.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ConsumerConfig, ConsumerHandle, OnMessagesReceived, Result, Transport, TransportError};
use crate::message::{MessageContext, Offset};

#[derive(Default)]
struct Inner {
    sent: RwLock<Vec<MessageContext>>,
    committed: RwLock<Vec<MessageContext>>,
    consumer: RwLock<Option<OnMessagesReceived>>,
    send_attempts: AtomicUsize,
    commit_attempts: AtomicUsize,
    failures_remaining: AtomicUsize,
    fail_on_commit: AtomicBool,
    next_offset: AtomicU64,
    stopped: AtomicBool,
}

/// Mock transport for testing.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_on_commit(&self, fail: bool) {
        self.inner.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Sends attempted, including failed ones.
    pub fn send_attempts(&self) -> usize {
        self.inner.send_attempts.load(Ordering::SeqCst)
    }

    /// Offset commits attempted, including failed ones.
    pub fn commit_attempts(&self) -> usize {
        self.inner.commit_attempts.load(Ordering::SeqCst)
    }

    pub async fn sent(&self) -> Vec<MessageContext> {
        self.inner.sent.read().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.inner.sent.read().await.len()
    }

    pub async fn committed(&self) -> Vec<MessageContext> {
        self.inner.committed.read().await.clone()
    }

    pub async fn committed_count(&self) -> usize {
        self.inner.committed.read().await.len()
    }

    pub fn consumer_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Push a batch into the started consumer, stamping offsets on messages that
    /// lack one. Returns false if no consumer is running.
    pub async fn deliver(&self, messages: Vec<MessageContext>) -> bool {
        let Some(callback) = self.inner.consumer.read().await.clone() else {
            return false;
        };

        let batch = messages
            .into_iter()
            .map(|message| match message.offset() {
                Some(_) => message,
                None => {
                    let offset = self.inner.next_offset.fetch_add(1, Ordering::SeqCst);
                    message.with_offset(Offset {
                        partition: 0,
                        offset,
                    })
                }
            })
            .collect();

        callback(batch).await;
        true
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_consumer(
        &self,
        _topics: &[String],
        _subscription: &str,
        _consumer_id: &str,
        on_messages: OnMessagesReceived,
        _config: &ConsumerConfig,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        *self.inner.consumer.write().await = Some(on_messages);
        self.inner.stopped.store(false, Ordering::SeqCst);
        Ok(Arc::new(MockConsumer {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn send(&self, context: &MessageContext) -> Result<()> {
        self.inner.send_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Send("Mock send failure".to_string()));
        }

        self.inner.sent.write().await.push(context.clone());
        Ok(())
    }
}

struct MockConsumer {
    inner: Arc<Inner>,
}

#[async_trait]
impl ConsumerHandle for MockConsumer {
    async fn commit_offset(&self, context: &MessageContext) -> Result<()> {
        self.inner.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_on_commit.load(Ordering::SeqCst) {
            return Err(TransportError::Commit("Mock commit failure".to_string()));
        }
        self.inner.committed.write().await.push(context.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.inner.consumer.write().await = None;
        self.inner.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}
