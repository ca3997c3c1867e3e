//! The message repository.
//!
//! [`DataStorage`] is the interface the dispatch scheduler talks to: store
//! outbound and inbound messages, persist state transitions, find work to
//! retry and drop expired rows. [`SqliteStorage`] implements it on top of a
//! [`SqlitePool`].

use std::{future::Future, sync::Arc};

use chrono::{TimeDelta, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tokio_util::sync::CancellationToken;

use crate::{
    db::message::{self as queries, NewMessage, RetryFilter},
    error::Error,
    id::IdGenerator,
    message::{headers, Message, MessageKind, MessageRecord, StatusName, StoredMessage},
    retry::{RETRY_BACKOFF, RETRY_BATCH_SIZE},
    schema::TableNames,
    serializer::Serializer,
};

/// How long a message that failed before it could be parsed is kept around.
pub const FAILED_MESSAGE_RETENTION: TimeDelta = TimeDelta::days(15);

/// Transaction context for writes that may join the caller's unit of work.
pub enum DbTransaction<'c, C> {
    /// The store uses a connection of its own and commits immediately.
    None,
    /// The write runs on the caller's connection and commits or rolls back with it.
    Active(&'c mut C),
}

impl<'c, C> From<&'c mut C> for DbTransaction<'c, C> {
    fn from(conn: &'c mut C) -> Self {
        Self::Active(conn)
    }
}

/// Persistence operations for published and received messages.
///
/// Implementations hold no per-message state between calls and never retry
/// internally; every error is returned to the caller.
pub trait DataStorage: Send + Sync + 'static {
    /// Connection type a caller-supplied transaction runs on.
    type Connection: Send;

    /// Stores an outbound message in `Scheduled` status.
    fn store_message<'c>(
        &self,
        name: &str,
        content: Message,
        transaction: DbTransaction<'c, Self::Connection>,
    ) -> impl Future<Output = Result<StoredMessage, Error>> + Send;

    /// Stores an inbound message in `Scheduled` status, always on its own connection.
    fn store_received_message(
        &self,
        name: &str,
        content: Message,
    ) -> impl Future<Output = Result<StoredMessage, Error>> + Send;

    /// Records inbound content that could not be turned into a [`Message`].
    ///
    /// The row is written as `Failed` with retries exhausted, so it shows up in
    /// monitoring but is never picked up for retry.
    fn store_received_exception_message(
        &self,
        name: &str,
        content: &str,
        reason: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Persists content, retries, expiry and the new status of an existing row.
    ///
    /// Does nothing if the row no longer exists.
    fn change_state(
        &self,
        kind: MessageKind,
        message: &StoredMessage,
        state: StatusName,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn change_publish_state(
        &self,
        message: &StoredMessage,
        state: StatusName,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        self.change_state(MessageKind::Published, message, state)
    }

    fn change_receive_state(
        &self,
        message: &StoredMessage,
        state: StatusName,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        self.change_state(MessageKind::Received, message, state)
    }

    /// Deletes at most `batch_count` rows whose expiry lies before `timeout`.
    fn delete_expires(
        &self,
        kind: MessageKind,
        timeout: chrono::DateTime<Utc>,
        batch_count: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Returns up to [`RETRY_BATCH_SIZE`] messages eligible for another attempt.
    fn messages_of_need_retry(
        &self,
        kind: MessageKind,
    ) -> impl Future<Output = Result<Vec<StoredMessage>, Error>> + Send;
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    tables: TableNames,
    version: String,
    failed_retry_count: u32,
    id_generator: Arc<dyn IdGenerator>,
    serializer: Arc<dyn Serializer>,
}

#[bon::bon]
impl SqliteStorage {
    #[builder]
    pub fn new(
        pool: SqlitePool,
        tables: TableNames,
        #[builder(into)] version: String,
        failed_retry_count: u32,
        id_generator: Arc<dyn IdGenerator>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            pool,
            tables,
            version,
            failed_retry_count,
            id_generator,
            serializer,
        }
    }
}

impl SqliteStorage {
    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn failed_retry_count(&self) -> u32 {
        self.failed_retry_count
    }

    /// Rebuilds a [`StoredMessage`] from a row, decoding its content.
    pub fn decode(&self, record: MessageRecord) -> Result<StoredMessage, Error> {
        let content = record.content.unwrap_or_default();
        let origin = self.serializer.deserialize(&content)?;

        Ok(StoredMessage {
            db_id: record.id,
            origin,
            content,
            added: record.added,
            expires_at: record.expires_at,
            retries: record.retries.unwrap_or_default(),
        })
    }

    /// Serializes `content` and builds the row for a freshly stored message.
    fn prepare(&self, id: i64, content: Message) -> Result<StoredMessage, Error> {
        let serialized = self.serializer.serialize(&content)?;

        Ok(StoredMessage {
            db_id: id,
            origin: content,
            content: serialized,
            added: Utc::now(),
            expires_at: None,
            retries: 0,
        })
    }

    fn scheduled_row<'a>(&'a self, name: &'a str, message: &'a StoredMessage) -> NewMessage<'a> {
        NewMessage {
            id: message.db_id,
            version: &self.version,
            name,
            content: &message.content,
            retries: message.retries,
            added: message.added,
            expires_at: message.expires_at,
            status_name: StatusName::Scheduled,
        }
    }

    /// Id for an outbound message: taken from its header when present, minted otherwise.
    fn outbound_id(&self, content: &mut Message) -> Result<i64, Error> {
        match content.id() {
            Some(raw) => raw.parse::<i64>().map_err(|e| {
                Error::invalid_parameter(format!("{} header {raw:?}: {e}", headers::MESSAGE_ID))
            }),
            None => {
                let id = self.id_generator.next_id();
                content
                    .headers
                    .insert(headers::MESSAGE_ID.to_owned(), id.to_string());
                Ok(id)
            }
        }
    }
}

impl DataStorage for SqliteStorage {
    type Connection = SqliteConnection;

    #[tracing::instrument(skip_all, fields(name = %name))]
    async fn store_message<'c>(
        &self,
        name: &str,
        mut content: Message,
        transaction: DbTransaction<'c, SqliteConnection>,
    ) -> Result<StoredMessage, Error> {
        let id = self.outbound_id(&mut content)?;
        let message = self.prepare(id, content)?;
        let row = self.scheduled_row(name, &message);
        let table = self.tables.published();

        match transaction {
            DbTransaction::None => {
                let mut conn = self.pool.acquire().await?;
                row.insert(&mut conn, table).await?;
            }
            DbTransaction::Active(conn) => {
                row.insert(conn, table).await?;
            }
        }

        tracing::debug!(id, "Stored published message");

        Ok(message)
    }

    #[tracing::instrument(skip_all, fields(name = %name))]
    async fn store_received_message(
        &self,
        name: &str,
        content: Message,
    ) -> Result<StoredMessage, Error> {
        let id = self.id_generator.next_id();
        let message = self.prepare(id, content)?;

        let mut conn = self.pool.acquire().await?;
        self.scheduled_row(name, &message)
            .insert(&mut conn, self.tables.received())
            .await?;

        tracing::debug!(id, "Stored received message");

        Ok(message)
    }

    #[tracing::instrument(skip_all, fields(name = %name))]
    async fn store_received_exception_message(
        &self,
        name: &str,
        content: &str,
        reason: &str,
    ) -> Result<(), Error> {
        let id = self.id_generator.next_id();
        let now = Utc::now();
        let retries = i32::try_from(self.failed_retry_count).unwrap_or(i32::MAX);

        let row = NewMessage {
            id,
            version: &self.version,
            name,
            content,
            retries,
            added: now,
            expires_at: Some(now + FAILED_MESSAGE_RETENTION),
            status_name: StatusName::Failed,
        };

        let mut conn = self.pool.acquire().await?;
        row.insert(&mut conn, self.tables.received()).await?;

        tracing::warn!(id, reason, "Recorded received message that could not be processed");

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(%kind, id = message.db_id, %state))]
    async fn change_state(
        &self,
        kind: MessageKind,
        message: &StoredMessage,
        state: StatusName,
    ) -> Result<(), Error> {
        let content = self.serializer.serialize(&message.origin)?;

        let mut conn = self.pool.acquire().await?;
        let updated = queries::update_state(
            &mut conn,
            self.tables.for_kind(kind),
            message.db_id,
            &content,
            message.retries,
            message.expires_at,
            state,
        )
        .await?;

        if updated == 0 {
            tracing::debug!("No row to update, message was already removed");
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(%kind, batch_count = batch_count))]
    async fn delete_expires(
        &self,
        kind: MessageKind,
        timeout: chrono::DateTime<Utc>,
        batch_count: u32,
        cancel: &CancellationToken,
    ) -> Result<u64, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut conn = self.pool.acquire().await?;
        let deleted =
            queries::delete_expired(&mut conn, self.tables.for_kind(kind), timeout, batch_count)
                .await?;

        tracing::debug!(deleted, "Deleted expired messages");

        Ok(deleted)
    }

    #[tracing::instrument(skip_all, fields(%kind))]
    async fn messages_of_need_retry(&self, kind: MessageKind) -> Result<Vec<StoredMessage>, Error> {
        let filter = RetryFilter {
            max_retries: self.failed_retry_count,
            version: &self.version,
            added_before: Utc::now() - RETRY_BACKOFF,
            limit: RETRY_BATCH_SIZE,
        };

        let mut conn = self.pool.acquire().await?;
        let records = queries::list_need_retry(&mut conn, self.tables.for_kind(kind), &filter).await?;

        records
            .into_iter()
            .map(|record| self.decode(record))
            .collect()
    }
}
