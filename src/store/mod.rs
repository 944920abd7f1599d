//! Message store: idempotency records, outbox and failure records.
//!
//! The store is the single source of truth shared across restarts. Every write
//! describing a handled message (the idempotency record, the outbox entries and
//! the business-state changes the handler staged) goes through one
//! `StoreTransaction`, so they commit or vanish together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::message::MessageContext;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryMessageStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMessageStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown store type: {0}")]
    UnknownType(String),
}

/// Business-state mutation staged by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Put {
        key: String,
        value: serde_json::Value,
    },
    Delete {
        key: String,
    },
}

/// A message whose handling failed, with the outbound messages it still owes.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub message_id: String,
    pub subscription: String,
    pub error: String,
    pub outbox: Vec<MessageContext>,
    pub failed_at: DateTime<Utc>,
}

/// Persistence required by the consumption pipeline and the sender.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Whether `(message_id, subscription)` was already processed, successfully or not.
    async fn has_handled(&self, message_id: &str, subscription: &str) -> Result<bool>;

    /// Open a handling transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Persist a failure record and its outbox snapshot.
    async fn record_failure(
        &self,
        context: &MessageContext,
        subscription: &str,
        error: &str,
        outbox: &[MessageContext],
    ) -> Result<()>;

    /// Outbox entries not yet confirmed sent, in write order.
    async fn load_unsent(&self) -> Result<Vec<MessageContext>>;

    /// Mark an outbox entry delivered. Unknown ids are ignored.
    async fn mark_sent(&self, message_id: &str) -> Result<()>;

    /// Read committed business state.
    async fn state(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

/// Unit of work spanning business state, idempotency record and outbox.
///
/// Dropping a transaction without committing discards it.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Apply staged business-state changes.
    async fn apply_changes(&mut self, changes: &[StateChange]) -> Result<()>;

    /// Write the idempotency record and the outbox entries.
    async fn record_handled(
        &mut self,
        context: &MessageContext,
        subscription: &str,
        commands: &[MessageContext],
        events: &[MessageContext],
    ) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Store type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// Process-local store. Nothing survives a restart.
    #[default]
    Memory,
    /// SQLite file store.
    Sqlite,
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store type discriminator.
    #[serde(rename = "type")]
    pub store_type: StoreType,
    /// Database path for file-backed stores.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Memory,
            path: "./data/courier.db".to_string(),
        }
    }
}

/// Initialize the message store based on configuration.
pub async fn init_store(config: &StoreConfig) -> Result<Arc<dyn MessageStore>> {
    info!(store_type = ?config.store_type, path = %config.path, "Initializing message store");

    match config.store_type {
        StoreType::Memory => Ok(Arc::new(InMemoryMessageStore::new())),
        StoreType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let store = SqliteMessageStore::connect(&config.path).await?;
                store.init().await?;
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                tracing::error!("SQLite store requested but 'sqlite' feature is not enabled");
                Err(StoreError::UnknownType("sqlite".to_string()))
            }
        }
    }
}
