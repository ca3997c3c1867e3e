//! Discovery of messages that need another delivery attempt.

use chrono::TimeDelta;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Error,
    message::{MessageKind, StoredMessage},
    storage::DataStorage,
};

/// Upper bound on messages returned per table and scan.
pub const RETRY_BATCH_SIZE: u32 = 200;

/// Minimum age before a message is eligible for retry, so the scanner does
/// not race the original attempt that is still in flight.
pub const RETRY_BACKOFF: TimeDelta = TimeDelta::minutes(4);

/// Messages found by one scan of both tables.
#[derive(Debug, Default)]
pub struct RetryBatch {
    pub published: Vec<StoredMessage>,
    pub received: Vec<StoredMessage>,
}

impl RetryBatch {
    pub fn len(&self) -> usize {
        self.published.len() + self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.is_empty() && self.received.is_empty()
    }
}

#[derive(Clone)]
pub struct RetryScanner<S> {
    storage: S,
}

impl<S: DataStorage> RetryScanner<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub async fn published(&self, cancel: &CancellationToken) -> Result<Vec<StoredMessage>, Error> {
        self.scan_kind(MessageKind::Published, cancel).await
    }

    pub async fn received(&self, cancel: &CancellationToken) -> Result<Vec<StoredMessage>, Error> {
        self.scan_kind(MessageKind::Received, cancel).await
    }

    /// Scans both tables, published first.
    #[tracing::instrument(skip_all)]
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<RetryBatch, Error> {
        let published = self.published(cancel).await?;
        let received = self.received(cancel).await?;

        let batch = RetryBatch {
            published,
            received,
        };

        tracing::debug!(found = batch.len(), "Scanned for messages needing retry");

        Ok(batch)
    }

    async fn scan_kind(
        &self,
        kind: MessageKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredMessage>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut messages = self.storage.messages_of_need_retry(kind).await?;
        messages.truncate(RETRY_BATCH_SIZE as usize);

        Ok(messages)
    }
}
