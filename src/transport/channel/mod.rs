//! In-process transport for standalone mode.
//!
//! Each topic is an append-only log. Offsets are acknowledged per subscription;
//! the committed offset advances only over a contiguous run of acknowledged
//! messages, so a consumer restarted after a crash resumes at the first message
//! that was not fully handled.
//!
//! Consumers of the same subscription do not share a position: every consumer
//! started for a subscription reads from that subscription's committed offset.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ConsumerConfig, ConsumerHandle, OnMessagesReceived, Result, Transport, TransportError};
use crate::message::{MessageContext, Offset};

/// Committed position of one subscription on one topic.
#[derive(Debug, Default)]
struct Cursor {
    committed: u64,
    acked: BTreeSet<u64>,
}

impl Cursor {
    fn ack(&mut self, offset: u64) {
        if offset < self.committed {
            return;
        }
        self.acked.insert(offset);
        while self.acked.remove(&self.committed) {
            self.committed += 1;
        }
    }

    /// Messages delivered up to `next` that are not yet acknowledged.
    fn in_flight(&self, next: u64) -> u64 {
        next.saturating_sub(self.committed)
            .saturating_sub(self.acked.len() as u64)
    }
}

#[derive(Default)]
struct Shared {
    topics: HashMap<String, Vec<MessageContext>>,
    cursors: HashMap<(String, String), Cursor>,
}

impl Shared {
    fn committed(&self, subscription: &str, topic: &str) -> u64 {
        self.cursors
            .get(&(subscription.to_string(), topic.to_string()))
            .map_or(0, |cursor| cursor.committed)
    }

    fn in_flight(&self, subscription: &str, topic: &str, next: u64) -> u64 {
        match self.cursors.get(&(subscription.to_string(), topic.to_string())) {
            Some(cursor) => cursor.in_flight(next),
            None => next,
        }
    }
}

/// In-process transport backed by per-topic logs.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages ever appended to `topic`.
    pub async fn topic_len(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .await
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Messages appended to `topic`, in offset order.
    pub async fn messages(&self, topic: &str) -> Vec<MessageContext> {
        self.shared
            .lock()
            .await
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Committed offset of `subscription` on `topic`.
    pub async fn committed_offset(&self, subscription: &str, topic: &str) -> u64 {
        self.shared.lock().await.committed(subscription, topic)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start_consumer(
        &self,
        topics: &[String],
        subscription: &str,
        consumer_id: &str,
        on_messages: OnMessagesReceived,
        config: &ConsumerConfig,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        if topics.is_empty() {
            return Err(TransportError::Consumer(
                "consumer needs at least one topic".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll = PollLoop {
            shared: Arc::clone(&self.shared),
            notify: Arc::clone(&self.notify),
            topics: topics.to_vec(),
            subscription: subscription.to_string(),
            on_messages,
            config: config.clone(),
        };
        let task = tokio::spawn(poll.run(shutdown_rx));

        info!(
            subscription = %subscription,
            consumer_id = %consumer_id,
            topics = ?topics,
            "Channel consumer started"
        );

        Ok(Arc::new(ChannelConsumer {
            subscription: subscription.to_string(),
            shared: Arc::clone(&self.shared),
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }))
    }

    async fn send(&self, context: &MessageContext) -> Result<()> {
        if context.topic().is_empty() {
            return Err(TransportError::Send(format!(
                "message {} has no topic",
                context.message_id()
            )));
        }

        let offset = {
            let mut shared = self.shared.lock().await;
            let log = shared.topics.entry(context.topic().to_string()).or_default();
            let offset = log.len() as u64;
            log.push(context.clone().with_offset(Offset {
                partition: 0,
                offset,
            }));
            offset
        };
        self.notify.notify_waiters();

        debug!(
            topic = %context.topic(),
            message_id = %context.message_id(),
            offset,
            "Appended message to channel topic"
        );
        Ok(())
    }
}

struct PollLoop {
    shared: Arc<Mutex<Shared>>,
    notify: Arc<Notify>,
    topics: Vec<String>,
    subscription: String,
    on_messages: OnMessagesReceived,
    config: ConsumerConfig,
}

impl PollLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut next: HashMap<String, u64> = {
            let shared = self.shared.lock().await;
            self.topics
                .iter()
                .map(|topic| (topic.clone(), shared.committed(&self.subscription, topic)))
                .collect()
        };
        let threshold = self.config.full_load_threshold.max(1) as u64;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Register for wakeups before looking, so a send between the look and
            // the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, in_flight) = {
                let shared = self.shared.lock().await;
                let in_flight: u64 = self
                    .topics
                    .iter()
                    .map(|topic| {
                        let position = next.get(topic).copied().unwrap_or(0);
                        shared.in_flight(&self.subscription, topic, position)
                    })
                    .sum();

                let mut batch = Vec::new();
                let mut room = threshold.saturating_sub(in_flight);
                for topic in &self.topics {
                    let (Some(log), Some(position)) = (shared.topics.get(topic), next.get_mut(topic))
                    else {
                        continue;
                    };
                    while room > 0 && (*position as usize) < log.len() {
                        batch.push(log[*position as usize].clone());
                        *position += 1;
                        room -= 1;
                    }
                }
                (batch, in_flight)
            };

            if in_flight >= threshold {
                debug!(
                    subscription = %self.subscription,
                    in_flight,
                    "Consumer at full load, pausing"
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.config.wait_interval()) => {}
                }
                continue;
            }

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(self.config.receive_timeout()) => {}
                }
                continue;
            }

            debug!(
                subscription = %self.subscription,
                count = batch.len(),
                "Delivering batch"
            );
            (self.on_messages)(batch).await;
        }

        debug!(subscription = %self.subscription, "Channel poll loop exited");
    }
}

/// Handle of a running channel consumer.
pub struct ChannelConsumer {
    subscription: String,
    shared: Arc<Mutex<Shared>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl ConsumerHandle for ChannelConsumer {
    async fn commit_offset(&self, context: &MessageContext) -> Result<()> {
        let offset = context.offset().ok_or_else(|| {
            TransportError::Commit(format!("message {} has no offset", context.message_id()))
        })?;

        let mut shared = self.shared.lock().await;
        shared
            .cursors
            .entry((self.subscription.clone(), context.topic().to_string()))
            .or_default()
            .ack(offset.offset);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| TransportError::Consumer(e.to_string()))?;
        }
        info!(subscription = %self.subscription, "Channel consumer stopped");
        Ok(())
    }
}
