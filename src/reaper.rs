//! Garbage collection of messages past their expiry time.
//!
//! Every delete is bounded by the batch size so a tick never holds the
//! database for longer than one small statement. [`ExpiryReaper::spawn`]
//! runs the collector on an interval for processes that have no scheduler
//! of their own.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{error::Error, message::MessageKind, storage::DataStorage};

/// Pause between two batches of the same run.
const BATCH_PAUSE: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct ExpiryReaper<S> {
    storage: S,
    interval: Duration,
    batch_count: u32,
}

impl<S: DataStorage> ExpiryReaper<S> {
    /// Fails when `interval` or `batch_count` is zero.
    pub fn new(storage: S, interval: Duration, batch_count: u32) -> Result<Self, Error> {
        if interval.is_zero() {
            return Err(Error::invalid_parameter("reaper interval must be positive"));
        }
        if batch_count == 0 {
            return Err(Error::invalid_parameter("reaper batch count must be positive"));
        }

        Ok(Self {
            storage,
            interval,
            batch_count,
        })
    }

    pub fn batch_count(&self) -> u32 {
        self.batch_count
    }

    /// Deletes one batch of expired rows from the given table.
    pub async fn reap(&self, kind: MessageKind, cancel: &CancellationToken) -> Result<u64, Error> {
        self.storage
            .delete_expires(kind, Utc::now(), self.batch_count, cancel)
            .await
    }

    /// Deletes batches from both tables until each comes back short.
    ///
    /// Stops early, returning what was removed so far, once `cancel` fires.
    #[tracing::instrument(skip_all)]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<u64, Error> {
        let mut total = 0;

        for kind in MessageKind::ALL {
            loop {
                let deleted = match self.reap(kind, cancel).await {
                    Ok(deleted) => deleted,
                    Err(Error::Cancelled) => return Ok(total),
                    Err(e) => return Err(e),
                };

                total += deleted;

                if deleted < u64::from(self.batch_count) {
                    break;
                }

                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }

        if total > 0 {
            tracing::info!(total, "Removed expired messages");
        }

        Ok(total)
    }

    /// Runs [`ExpiryReaper::run_once`] every interval until `cancel` fires.
    ///
    /// A failed run is logged and the next tick tries again.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(&cancel).await {
                            tracing::error!("Failed to remove expired messages: {e}");
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("Expiry reaper stopped");
                        return;
                    }
                }
            }
        })
    }
}
