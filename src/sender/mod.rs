//! Outbound message sender.
//!
//! Messages go onto an unbounded queue and a single drain loop sends them one at
//! a time. A failed send is retried after a fixed interval, forever, and nothing
//! behind it is sent in the meantime; the queue order is the send order.
//!
//! The queue outlives the drain loop: `stop` hands the receiver (and a message
//! whose send was interrupted) back to the sender so a later `start` resumes
//! exactly where the previous loop left off.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use backon::Retryable;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mailbox::WorkerStatus;
use crate::message::{Message, MessageContext, MessageError, MessageResponse, MessageState, Payload};
use crate::store::{MessageStore, StoreError};
use crate::transport::Transport;
use crate::utils::retry::store_backoff;

/// Result type for sender operations.
pub type Result<T> = std::result::Result<T, SendError>;

/// Errors surfaced to callers of the sender.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Message sender is already running")]
    AlreadyRunning,

    #[error("Send cancelled; the message stays queued")]
    Cancelled,

    #[error("Sender shut down before the message was delivered")]
    Dropped,

    #[error("Failed to reload unsent messages: {0}")]
    Reload(#[from] StoreError),

    #[error("Drain loop failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Sender configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Pause between attempts to send the same message.
    pub retry_interval_ms: u64,
    /// Topic used for outbound messages that carry none.
    pub default_topic: Option<String>,
    /// Re-queue outbox entries not yet marked sent on first start.
    pub reload_unsent: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 2000,
            default_topic: None,
            reload_unsent: true,
        }
    }
}

impl SenderConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Queue state owned by whichever drain loop is running.
struct DrainSlot {
    receiver: mpsc::UnboundedReceiver<MessageState>,
    /// Messages to send before anything on the receiver: reloaded outbox entries
    /// and a message whose retries were interrupted by `stop`.
    backlog: VecDeque<MessageState>,
    reloaded: bool,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    pending: AtomicUsize,
}

/// Background sender with infinite retry.
pub struct MessageSender {
    name: String,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn MessageStore>>,
    config: SenderConfig,
    queue: mpsc::UnboundedSender<MessageState>,
    slot: Mutex<Option<DrainSlot>>,
    worker: Mutex<Option<(watch::Sender<bool>, JoinHandle<DrainSlot>)>>,
    status: std::sync::Mutex<WorkerStatus>,
    counters: Arc<Counters>,
}

impl MessageSender {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, config: SenderConfig) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            transport,
            store: None,
            config,
            queue,
            slot: Mutex::new(Some(DrainSlot {
                receiver,
                backlog: VecDeque::new(),
                reloaded: false,
            })),
            worker: Mutex::new(None),
            status: std::sync::Mutex::new(WorkerStatus::NotStarted),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Mark delivered messages sent in `store`, and reload its unsent entries on start.
    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launch the drain loop.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(SendError::AlreadyRunning);
        }

        let mut slot_guard = self.slot.lock().await;
        let Some(mut slot) = slot_guard.take() else {
            return Err(SendError::Worker("sender queue was lost".to_string()));
        };

        if !slot.reloaded && self.config.reload_unsent {
            if let Some(store) = &self.store {
                let unsent = match (|| async { store.load_unsent().await })
                    .retry(store_backoff())
                    .notify(|e, delay| {
                        warn!(sender = %self.name, error = %e, ?delay, "Reloading unsent messages failed, retrying");
                    })
                    .await
                {
                    Ok(unsent) => unsent,
                    Err(e) => {
                        *slot_guard = Some(slot);
                        return Err(e.into());
                    }
                };

                info!(sender = %self.name, count = unsent.len(), "Reloaded unsent messages");
                self.counters.pending.fetch_add(unsent.len(), Ordering::SeqCst);
                slot.backlog.extend(unsent.into_iter().map(MessageState::new));
            }
            slot.reloaded = true;
        }
        drop(slot_guard);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let drain = DrainLoop {
            name: self.name.clone(),
            transport: Arc::clone(&self.transport),
            store: self.store.clone(),
            retry_interval: self.config.retry_interval(),
            default_topic: self.config.default_topic.clone(),
            counters: Arc::clone(&self.counters),
        };
        *worker = Some((shutdown_tx, tokio::spawn(drain.run(slot, shutdown_rx))));
        self.set_status(WorkerStatus::Running);

        info!(sender = %self.name, "Message sender started");
        Ok(())
    }

    /// Signal the drain loop and wait for it to exit. Queued messages are kept.
    pub async fn stop(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        let Some((shutdown, handle)) = worker.take() else {
            return Ok(());
        };

        let _ = shutdown.send(true);
        let result = match handle.await {
            Ok(slot) => {
                *self.slot.lock().await = Some(slot);
                Ok(())
            }
            Err(e) => {
                error!(sender = %self.name, error = %e, "Drain loop failed");
                Err(SendError::Worker(e.to_string()))
            }
        };
        self.set_status(WorkerStatus::Stopped);

        info!(sender = %self.name, pending = self.pending_count(), "Message sender stopped");
        result
    }

    /// Queue messages without waiting for delivery.
    pub fn send_states(&self, states: Vec<MessageState>) {
        for state in states {
            self.enqueue(state);
        }
    }

    /// Queue messages and wait until each one has been delivered.
    ///
    /// The messages are queued before this returns; dropping the returned future
    /// does not unqueue them.
    pub fn send(
        &self,
        contexts: Vec<MessageContext>,
    ) -> impl Future<Output = Result<Vec<MessageResponse>>> + Send + 'static {
        let receivers: Vec<_> = contexts
            .into_iter()
            .map(|context| {
                let (state, completion) = MessageState::with_completion(context);
                self.enqueue(state);
                completion
            })
            .collect();

        async move {
            let mut responses = Vec::with_capacity(receivers.len());
            for completion in receivers {
                responses.push(completion.await.map_err(|_| SendError::Dropped)?);
            }
            Ok(responses)
        }
    }

    /// Wrap and send a single typed message, waiting for delivery.
    pub async fn send_message<M: Message>(&self, message: &M) -> Result<MessageResponse> {
        let context = self.transport.wrap_message(
            Payload::from_message(message)?,
            &message.topic(),
            message.key(),
            None,
            None,
            &self.name,
        );
        let mut responses = self.send(vec![context]).await?;
        responses.pop().ok_or(SendError::Dropped)
    }

    /// Like `send`, but gives up waiting when `cancel` resolves.
    ///
    /// Cancelling only abandons the wait; the messages are still delivered.
    pub async fn send_with_cancel<C>(
        &self,
        contexts: Vec<MessageContext>,
        cancel: C,
    ) -> Result<Vec<MessageResponse>>
    where
        C: Future<Output = ()>,
    {
        let delivery = self.send(contexts);
        tokio::select! {
            result = delivery => result,
            _ = cancel => Err(SendError::Cancelled),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Messages delivered since construction.
    pub fn sent_count(&self) -> u64 {
        self.counters.sent.load(Ordering::SeqCst)
    }

    /// Messages queued and not yet delivered.
    pub fn pending_count(&self) -> usize {
        self.counters.pending.load(Ordering::SeqCst)
    }

    fn enqueue(&self, state: MessageState) {
        let message_id = state.context().message_id().to_string();
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(state).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            error!(sender = %self.name, message_id = %message_id, "Sender queue closed, message dropped");
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

impl Drop for MessageSender {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.try_lock() {
            if let Some((shutdown, _)) = worker.take() {
                let _ = shutdown.send(true);
            }
        }
    }
}

struct DrainLoop {
    name: String,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn MessageStore>>,
    retry_interval: Duration,
    default_topic: Option<String>,
    counters: Arc<Counters>,
}

impl DrainLoop {
    async fn run(self, mut slot: DrainSlot, mut shutdown: watch::Receiver<bool>) -> DrainSlot {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut state = match slot.backlog.pop_front() {
                Some(state) => state,
                None => tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    state = slot.receiver.recv() => match state {
                        Some(state) => state,
                        None => break,
                    },
                },
            };

            if let Some(topic) = &self.default_topic {
                state.default_topic(topic);
            }

            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                let outbound = state.context();
                match self.transport.send(outbound).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            sender = %self.name,
                            message_id = %outbound.message_id(),
                            topic = %outbound.topic(),
                            attempt,
                            error = %e,
                            "Send failed, retrying"
                        );
                        let stopped = tokio::select! {
                            _ = shutdown.changed() => true,
                            _ = tokio::time::sleep(self.retry_interval) => false,
                        };
                        if stopped {
                            slot.backlog.push_front(state);
                            return slot;
                        }
                    }
                }
            }

            let response = state.complete();
            if let Some(store) = &self.store {
                if let Err(e) = store.mark_sent(&response.message_id).await {
                    warn!(
                        sender = %self.name,
                        message_id = %response.message_id,
                        error = %e,
                        "Failed to mark message sent"
                    );
                }
            }

            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            self.counters.sent.fetch_add(1, Ordering::SeqCst);
            debug!(
                sender = %self.name,
                message_id = %response.message_id,
                topic = %response.topic,
                attempts = attempt,
                "Message sent"
            );
        }
        slot
    }
}

#[cfg(test)]
mod tests;
