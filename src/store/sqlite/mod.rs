//! SQLite message store.
//!
//! Every handling transaction starts with `BEGIN IMMEDIATE` so concurrent mailbox
//! workers queue on the write lock instead of deadlocking on a shared-to-exclusive
//! upgrade.

mod schema;

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use self::schema::{EntityStates, FailedMessages, HandledMessages, OutboxMessages};
use super::{MessageStore, Result, StateChange, StoreError, StoreTransaction};
use crate::message::MessageContext;

/// SQLite implementation of `MessageStore`.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path)).await?;
        info!(path = %path, "Connected to SQLite message store");
        Ok(Self::new(pool))
    }

    /// Create tables if they do not exist.
    pub async fn init(&self) -> Result<()> {
        for statement in [
            schema::CREATE_HANDLED_MESSAGES_TABLE,
            schema::CREATE_FAILED_MESSAGES_TABLE,
            schema::CREATE_OUTBOX_MESSAGES_TABLE,
            schema::CREATE_OUTBOX_UNSENT_INDEX,
            schema::CREATE_ENTITY_STATES_TABLE,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn begin_immediate(&self) -> Result<SqliteTransaction> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(SqliteTransaction { conn: Some(conn) })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn has_handled(&self, message_id: &str, subscription: &str) -> Result<bool> {
        let query = Query::select()
            .column(HandledMessages::MessageId)
            .from(HandledMessages::Table)
            .and_where(Expr::col(HandledMessages::MessageId).eq(message_id))
            .and_where(Expr::col(HandledMessages::Subscription).eq(subscription))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(self.begin_immediate().await?))
    }

    async fn record_failure(
        &self,
        context: &MessageContext,
        subscription: &str,
        error: &str,
        outbox: &[MessageContext],
    ) -> Result<()> {
        let mut tx = self.begin_immediate().await?;
        let conn = tx.conn()?;

        let outbox_data = serde_json::to_string(outbox)?;
        let query = Query::insert()
            .into_table(FailedMessages::Table)
            .columns([
                FailedMessages::MessageId,
                FailedMessages::Subscription,
                FailedMessages::Error,
                FailedMessages::OutboxData,
                FailedMessages::FailedAt,
            ])
            .values_panic([
                context.message_id().into(),
                subscription.into(),
                error.into(),
                outbox_data.into(),
                Utc::now().to_rfc3339().into(),
            ])
            .on_conflict(
                OnConflict::columns([FailedMessages::MessageId, FailedMessages::Subscription])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;

        insert_handled(conn, context, subscription).await?;
        insert_outbox(conn, outbox).await?;

        Box::new(tx).commit().await
    }

    async fn load_unsent(&self) -> Result<Vec<MessageContext>> {
        let query = Query::select()
            .column(OutboxMessages::ContextData)
            .from(OutboxMessages::Table)
            .and_where(Expr::col(OutboxMessages::SentAt).is_null())
            .order_by(OutboxMessages::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut unsent = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.try_get("context_data")?;
            unsent.push(serde_json::from_str(&data)?);
        }
        Ok(unsent)
    }

    async fn mark_sent(&self, message_id: &str) -> Result<()> {
        let query = Query::update()
            .table(OutboxMessages::Table)
            .value(OutboxMessages::SentAt, Utc::now().to_rfc3339())
            .and_where(Expr::col(OutboxMessages::MessageId).eq(message_id))
            .and_where(Expr::col(OutboxMessages::SentAt).is_null())
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let query = Query::select()
            .column(EntityStates::StateData)
            .from(EntityStates::Table)
            .and_where(Expr::col(EntityStates::StateKey).eq(key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => {
                let data: String = row.try_get("state_data")?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }
}

async fn insert_handled(
    conn: &mut SqliteConnection,
    context: &MessageContext,
    subscription: &str,
) -> Result<()> {
    let query = Query::insert()
        .into_table(HandledMessages::Table)
        .columns([
            HandledMessages::MessageId,
            HandledMessages::Subscription,
            HandledMessages::HandledAt,
        ])
        .values_panic([
            context.message_id().into(),
            subscription.into(),
            Utc::now().to_rfc3339().into(),
        ])
        .on_conflict(
            OnConflict::columns([HandledMessages::MessageId, HandledMessages::Subscription])
                .do_nothing()
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder);

    sqlx::query(&query).execute(&mut *conn).await?;
    Ok(())
}

async fn insert_outbox(conn: &mut SqliteConnection, contexts: &[MessageContext]) -> Result<()> {
    if contexts.is_empty() {
        return Ok(());
    }

    let created_at = Utc::now().to_rfc3339();
    // The statement builder is not `Send`; render it before awaiting.
    let query = {
        let mut insert = Query::insert();
        insert.into_table(OutboxMessages::Table).columns([
            OutboxMessages::MessageId,
            OutboxMessages::Topic,
            OutboxMessages::ContextData,
            OutboxMessages::CreatedAt,
        ]);
        for context in contexts {
            insert.values_panic([
                context.message_id().into(),
                context.topic().into(),
                serde_json::to_string(context)?.into(),
                created_at.clone().into(),
            ]);
        }
        insert
            .on_conflict(
                OnConflict::column(OutboxMessages::MessageId)
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder)
    };

    sqlx::query(&query).execute(&mut *conn).await?;
    Ok(())
}

/// Open `BEGIN IMMEDIATE` transaction on a pooled connection.
///
/// Dropped without `commit` or `rollback`, the connection is rolled back in the
/// background before it can be reused.
pub struct SqliteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl SqliteTransaction {
    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| StoreError::Transaction("transaction already finished".to_string()))
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn apply_changes(&mut self, changes: &[StateChange]) -> Result<()> {
        let conn = self.conn()?;
        let updated_at = Utc::now().to_rfc3339();

        for change in changes {
            let query = match change {
                StateChange::Put { key, value } => Query::insert()
                    .into_table(EntityStates::Table)
                    .columns([
                        EntityStates::StateKey,
                        EntityStates::StateData,
                        EntityStates::UpdatedAt,
                    ])
                    .values_panic([
                        key.as_str().into(),
                        serde_json::to_string(value)?.into(),
                        updated_at.clone().into(),
                    ])
                    .on_conflict(
                        OnConflict::column(EntityStates::StateKey)
                            .update_columns([EntityStates::StateData, EntityStates::UpdatedAt])
                            .to_owned(),
                    )
                    .to_string(SqliteQueryBuilder),
                StateChange::Delete { key } => Query::delete()
                    .from_table(EntityStates::Table)
                    .and_where(Expr::col(EntityStates::StateKey).eq(key.as_str()))
                    .to_string(SqliteQueryBuilder),
            };
            sqlx::query(&query).execute(&mut *conn).await?;
        }
        Ok(())
    }

    async fn record_handled(
        &mut self,
        context: &MessageContext,
        subscription: &str,
        commands: &[MessageContext],
        events: &[MessageContext],
    ) -> Result<()> {
        let conn = self.conn()?;
        insert_handled(conn, context, subscription).await?;
        insert_outbox(conn, commands).await?;
        insert_outbox(conn, events).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Err(StoreError::Transaction("transaction already finished".to_string()));
        };

        if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
            warn!(error = %e, "SQLite commit failed, rolling back");
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(e.into());
        }
        debug!("SQLite transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("ROLLBACK").execute(&mut *conn).await?;
        }
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        warn!(error = %e, "Rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => {
                // No runtime to roll back on; closing the connection discards the transaction.
                drop(conn.detach());
            }
        }
    }
}
