//! In-memory message store.
//!
//! Transactions stage their writes privately and apply them under a single write
//! lock on commit. Used for standalone mode and tests; nothing survives a restart.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{FailureRecord, MessageStore, Result, StateChange, StoreError, StoreTransaction};
use crate::message::MessageContext;

/// Outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub context: MessageContext,
    pub sent: bool,
}

#[derive(Default)]
struct Inner {
    handled: HashSet<(String, String)>,
    failures: Vec<FailureRecord>,
    outbox: Vec<OutboxEntry>,
    outbox_ids: HashSet<String>,
    states: HashMap<String, serde_json::Value>,
}

impl Inner {
    fn push_outbox(&mut self, context: &MessageContext) {
        if self.outbox_ids.insert(context.message_id().to_string()) {
            self.outbox.push(OutboxEntry {
                context: context.clone(),
                sent: false,
            });
        }
    }
}

/// In-memory store.
#[derive(Default, Clone)]
pub struct InMemoryMessageStore {
    inner: Arc<RwLock<Inner>>,
    fail_on_commit: Arc<AtomicBool>,
    fail_on_record_failure: Arc<AtomicBool>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail, leaving the store untouched.
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `record_failure` fail.
    pub fn set_fail_on_record_failure(&self, fail: bool) {
        self.fail_on_record_failure.store(fail, Ordering::SeqCst);
    }

    /// Number of idempotency records.
    pub async fn handled_count(&self) -> usize {
        self.inner.read().await.handled.len()
    }

    pub async fn outbox(&self) -> Vec<OutboxEntry> {
        self.inner.read().await.outbox.clone()
    }

    pub async fn failures(&self) -> Vec<FailureRecord> {
        self.inner.read().await.failures.clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn has_handled(&self, message_id: &str, subscription: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        let key = (message_id.to_string(), subscription.to_string());
        Ok(inner.handled.contains(&key))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            fail_on_commit: Arc::clone(&self.fail_on_commit),
            changes: Vec::new(),
            handled: Vec::new(),
            outbox: Vec::new(),
        }))
    }

    async fn record_failure(
        &self,
        context: &MessageContext,
        subscription: &str,
        error: &str,
        outbox: &[MessageContext],
    ) -> Result<()> {
        if self.fail_on_record_failure.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "Mock record_failure failure".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        inner
            .handled
            .insert((context.message_id().to_string(), subscription.to_string()));
        for entry in outbox {
            inner.push_outbox(entry);
        }
        inner.failures.push(FailureRecord {
            message_id: context.message_id().to_string(),
            subscription: subscription.to_string(),
            error: error.to_string(),
            outbox: outbox.to_vec(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn load_unsent(&self) -> Result<Vec<MessageContext>> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|entry| !entry.sent)
            .map(|entry| entry.context.clone())
            .collect())
    }

    async fn mark_sent(&self, message_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner
            .outbox
            .iter_mut()
            .find(|entry| entry.context.message_id() == message_id)
        {
            entry.sent = true;
        }
        Ok(())
    }

    async fn state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.inner.read().await.states.get(key).cloned())
    }
}

/// Staged writes, applied atomically on commit.
struct InMemoryTransaction {
    inner: Arc<RwLock<Inner>>,
    fail_on_commit: Arc<AtomicBool>,
    changes: Vec<StateChange>,
    handled: Vec<(String, String)>,
    outbox: Vec<MessageContext>,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn apply_changes(&mut self, changes: &[StateChange]) -> Result<()> {
        self.changes.extend_from_slice(changes);
        Ok(())
    }

    async fn record_handled(
        &mut self,
        context: &MessageContext,
        subscription: &str,
        commands: &[MessageContext],
        events: &[MessageContext],
    ) -> Result<()> {
        self.handled
            .push((context.message_id().to_string(), subscription.to_string()));
        self.outbox.extend(commands.iter().cloned());
        self.outbox.extend(events.iter().cloned());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.fail_on_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Transaction("Mock commit failure".to_string()));
        }

        let mut inner = self.inner.write().await;
        for change in self.changes {
            match change {
                StateChange::Put { key, value } => {
                    inner.states.insert(key, value);
                }
                StateChange::Delete { key } => {
                    inner.states.remove(&key);
                }
            }
        }
        for record in self.handled {
            inner.handled.insert(record);
        }
        for context in &self.outbox {
            inner.push_outbox(context);
        }
        debug!(outbox = self.outbox.len(), "In-memory transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(
            staged_outbox = self.outbox.len(),
            "In-memory transaction rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests;
