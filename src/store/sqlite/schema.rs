//! Table and column identifiers for the SQLite store.

use sea_query::Iden;

/// Idempotency records.
#[derive(Iden)]
pub enum HandledMessages {
    Table,
    #[iden = "message_id"]
    MessageId,
    #[iden = "subscription"]
    Subscription,
    #[iden = "handled_at"]
    HandledAt,
}

/// Failure records with their outbox snapshot.
#[derive(Iden)]
pub enum FailedMessages {
    Table,
    #[iden = "message_id"]
    MessageId,
    #[iden = "subscription"]
    Subscription,
    #[iden = "error"]
    Error,
    #[iden = "outbox_data"]
    OutboxData,
    #[iden = "failed_at"]
    FailedAt,
}

/// Outbound messages awaiting delivery.
#[derive(Iden)]
pub enum OutboxMessages {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "message_id"]
    MessageId,
    #[iden = "topic"]
    Topic,
    #[iden = "context_data"]
    ContextData,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "sent_at"]
    SentAt,
}

/// Business state written by handlers.
#[derive(Iden)]
pub enum EntityStates {
    Table,
    #[iden = "state_key"]
    StateKey,
    #[iden = "state_data"]
    StateData,
    #[iden = "updated_at"]
    UpdatedAt,
}

pub const CREATE_HANDLED_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS handled_messages (
    message_id TEXT NOT NULL,
    subscription TEXT NOT NULL,
    handled_at TEXT NOT NULL,
    PRIMARY KEY (message_id, subscription)
)
"#;

pub const CREATE_FAILED_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS failed_messages (
    message_id TEXT NOT NULL,
    subscription TEXT NOT NULL,
    error TEXT NOT NULL,
    outbox_data TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    PRIMARY KEY (message_id, subscription)
)
"#;

pub const CREATE_OUTBOX_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL UNIQUE,
    topic TEXT NOT NULL,
    context_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    sent_at TEXT
)
"#;

pub const CREATE_OUTBOX_UNSENT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_outbox_unsent ON outbox_messages(sent_at, id)";

pub const CREATE_ENTITY_STATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entity_states (
    state_key TEXT PRIMARY KEY,
    state_data TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;
