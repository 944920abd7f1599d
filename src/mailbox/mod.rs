//! Keyed mailbox scheduler.
//!
//! Tasks submitted under the same key run one at a time, in submission order.
//! Tasks under different keys run concurrently, bounded by the worker count.
//!
//! A mailbox is "scheduled" while its key sits in the ready queue or a worker is
//! draining it. Only the worker that drains a mailbox puts its key back on the
//! ready queue, which is what keeps a key from ever being drained twice at once.
//! A worker runs at most `batch_count` tasks per turn so that one busy key cannot
//! starve the others.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::transport::ConsumerConfig;

/// Result type for mailbox operations.
pub type Result<T> = std::result::Result<T, MailboxError>;

/// Errors that can occur controlling the mailbox processor.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox processor is already running")]
    AlreadyRunning,

    #[error("Worker pool closed")]
    PoolClosed,
}

/// A unit of work. Its output is not observed.
pub type Task = BoxFuture<'static, ()>;

/// Lifecycle of a background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    NotStarted,
    Running,
    Stopped,
}

/// Mailbox processor tuning.
#[derive(Debug, Clone)]
pub struct MailboxOptions {
    /// Tasks a worker runs from one mailbox before yielding.
    pub batch_count: usize,
    /// Mailboxes drained concurrently.
    pub worker_count: usize,
}

impl Default for MailboxOptions {
    fn default() -> Self {
        Self {
            batch_count: 100,
            worker_count: 16,
        }
    }
}

impl From<&ConsumerConfig> for MailboxOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            batch_count: config.mailbox_batch_count,
            worker_count: config.mailbox_worker_count,
        }
    }
}

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<Task>,
    scheduled: bool,
}

struct State {
    mailboxes: HashMap<String, Mailbox>,
    ready: Option<mpsc::UnboundedSender<String>>,
    status: WorkerStatus,
}

struct Inner {
    batch_count: usize,
    worker_count: usize,
    state: Mutex<State>,
    workers: Arc<Semaphore>,
    dispatcher: tokio::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run up to `batch_count` tasks from one mailbox, then hand the key back.
    async fn drain(&self, key: String) {
        for _ in 0..self.batch_count {
            let task = {
                let mut state = self.state();
                if state.status != WorkerStatus::Running {
                    break;
                }
                state
                    .mailboxes
                    .get_mut(&key)
                    .and_then(|mailbox| mailbox.queue.pop_front())
            };
            let Some(task) = task else {
                break;
            };

            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                error!(key = %key, "Mailbox task panicked");
            }
        }

        let mut state = self.state();
        let State {
            mailboxes, ready, ..
        } = &mut *state;
        let Some(mailbox) = mailboxes.get_mut(&key) else {
            return;
        };

        if mailbox.queue.is_empty() {
            mailboxes.remove(&key);
        } else if let Some(ready) = ready {
            if ready.send(key.clone()).is_err() {
                mailbox.scheduled = false;
            }
        } else {
            mailbox.scheduled = false;
        }
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    mut ready: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let key = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            key = ready.recv() => match key {
                Some(key) => key,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = Arc::clone(&inner.workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            worker.drain(key).await;
            drop(permit);
        });
    }
    debug!("Mailbox dispatcher exited");
}

/// Per-key sequential executor backed by a bounded worker pool.
pub struct MailboxProcessor {
    inner: Arc<Inner>,
}

impl MailboxProcessor {
    pub fn new(options: MailboxOptions) -> Self {
        let worker_count = options.worker_count.max(1);
        Self {
            inner: Arc::new(Inner {
                batch_count: options.batch_count.max(1),
                worker_count,
                state: Mutex::new(State {
                    mailboxes: HashMap::new(),
                    ready: None,
                    status: WorkerStatus::NotStarted,
                }),
                workers: Arc::new(Semaphore::new(worker_count)),
                dispatcher: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Start draining mailboxes, including any left queued by a previous stop.
    pub async fn start(&self) -> Result<()> {
        let mut dispatcher = self.inner.dispatcher.lock().await;

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let rescheduled = {
            let mut state = self.inner.state();
            if state.status == WorkerStatus::Running {
                return Err(MailboxError::AlreadyRunning);
            }

            let mut rescheduled = 0;
            for (key, mailbox) in state.mailboxes.iter_mut() {
                if !mailbox.queue.is_empty() && ready_tx.send(key.clone()).is_ok() {
                    mailbox.scheduled = true;
                    rescheduled += 1;
                }
            }
            state.ready = Some(ready_tx);
            state.status = WorkerStatus::Running;
            rescheduled
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatch(Arc::clone(&self.inner), ready_rx, shutdown_rx));
        *dispatcher = Some((shutdown_tx, handle));

        info!(
            workers = self.inner.worker_count,
            batch_count = self.inner.batch_count,
            rescheduled,
            "Mailbox processor started"
        );
        Ok(())
    }

    /// Stop draining. In-flight tasks finish; queued tasks stay queued.
    pub async fn stop(&self) -> Result<()> {
        let mut dispatcher = self.inner.dispatcher.lock().await;

        {
            let mut state = self.inner.state();
            if state.status != WorkerStatus::Running {
                return Ok(());
            }
            state.status = WorkerStatus::Stopped;
            state.ready = None;
        }

        if let Some((shutdown, handle)) = dispatcher.take() {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                error!(error = %e, "Mailbox dispatcher failed");
            }
        }

        // Every worker holds a permit while draining.
        let all = u32::try_from(self.inner.worker_count).unwrap_or(u32::MAX);
        let _idle = self
            .inner
            .workers
            .acquire_many(all)
            .await
            .map_err(|_| MailboxError::PoolClosed)?;

        let pending = {
            let mut state = self.inner.state();
            for mailbox in state.mailboxes.values_mut() {
                mailbox.scheduled = false;
            }
            state.mailboxes.values().map(|m| m.queue.len()).sum::<usize>()
        };

        info!(pending, "Mailbox processor stopped");
        Ok(())
    }

    /// Enqueue `task` on the mailbox for `key`.
    pub fn process<F>(&self, key: impl Into<String>, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let mut state = self.inner.state();
        let State {
            mailboxes, ready, ..
        } = &mut *state;

        let mailbox = mailboxes.entry(key.clone()).or_default();
        mailbox.queue.push_back(task.boxed());

        if mailbox.scheduled {
            return;
        }
        if let Some(ready) = ready {
            if ready.send(key).is_ok() {
                mailbox.scheduled = true;
            }
        }
    }

    /// Drop every queued task that has not started. Returns how many were dropped.
    pub fn purge(&self) -> usize {
        let mut state = self.inner.state();
        let mut purged = 0;
        for mailbox in state.mailboxes.values_mut() {
            purged += mailbox.queue.len();
            mailbox.queue.clear();
        }
        // A scheduled mailbox is owned by a worker or the ready queue, which
        // removes it once it finds it empty.
        state.mailboxes.retain(|_, mailbox| mailbox.scheduled);
        if purged > 0 {
            info!(purged, "Purged queued mailbox tasks");
        }
        purged
    }

    /// Tasks queued and not yet started, across all keys.
    pub fn pending(&self) -> usize {
        self.inner
            .state()
            .mailboxes
            .values()
            .map(|mailbox| mailbox.queue.len())
            .sum()
    }

    pub fn mailbox_count(&self) -> usize {
        self.inner.state().mailboxes.len()
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.state().status
    }
}

impl Drop for MailboxProcessor {
    fn drop(&mut self) {
        if let Ok(mut dispatcher) = self.inner.dispatcher.try_lock() {
            if let Some((shutdown, _)) = dispatcher.take() {
                let _ = shutdown.send(true);
            }
        }
    }
}

#[cfg(test)]
mod tests;
