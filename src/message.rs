//! Message types and status management for the message store.
//!
//! This module defines the envelope handed in by the host application, the
//! bookkeeping kept alongside it once persisted, and the read model used by
//! monitoring queries.
//!
//! # Message Lifecycle
//!
//! 1. Messages are stored in `Scheduled` status with zero retries
//! 2. A successful dispatch moves them to `Succeeded` and sets `expires_at`
//! 3. A failed dispatch moves them to `Failed`; the scheduler puts them back
//!    to `Scheduled` while retries remain
//! 4. Once retries are exhausted they stay `Failed` with `expires_at` set
//!
//! Rows with `expires_at` in the past are removed by the expiry reaper.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use strum::{AsRefStr, Display, EnumString};

/// Well-known envelope header names.
pub mod headers {
    /// Id of the message; reused as the primary key of the published row.
    pub const MESSAGE_ID: &str = "parcel-msg-id";
    /// Logical topic or event name.
    pub const MESSAGE_NAME: &str = "parcel-msg-name";
}

/// Current delivery status of a stored message.
///
/// The status transitions follow:
/// `Scheduled` -> `Succeeded` (success case)
/// `Scheduled` -> `Failed`    (error case)
/// `Failed`    -> `Scheduled` (retry while attempts remain)
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    sqlx::Type,
)]
#[sqlx(type_name = "text")]
pub enum StatusName {
    /// Waiting for a dispatch attempt
    Scheduled,
    /// Delivered or handled successfully
    Succeeded,
    /// Last attempt failed
    Failed,
}

impl StatusName {
    /// Whether no further automatic transition will happen from this status.
    ///
    /// `Failed` is terminal only once `retries` reached `max_retries`.
    pub fn is_terminal(self, retries: i32, max_retries: u32) -> bool {
        match self {
            Self::Scheduled => false,
            Self::Succeeded => true,
            Self::Failed => i64::from(retries) >= i64::from(max_retries),
        }
    }
}

/// Which of the two message tables an operation targets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    /// Outbound messages written by the application (the outbox)
    Published,
    /// Inbound messages consumed from the broker (the inbox)
    Received,
}

impl MessageKind {
    pub const ALL: [MessageKind; 2] = [MessageKind::Published, MessageKind::Received];
}

/// Envelope handed to the store by the host application.
///
/// The store treats the value as opaque; only the headers listed in
/// [`headers`] are ever read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub headers: BTreeMap<String, String>,
    pub value: Option<serde_json::Value>,
}

impl Message {
    pub fn new(headers: BTreeMap<String, String>, value: Option<serde_json::Value>) -> Self {
        Self { headers, value }
    }

    pub fn id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID).map(String::as_str)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message together with the bookkeeping persisted next to it.
///
/// Returned by the store operations and handed back by the scheduler when it
/// records a state change. The scheduler mutates `retries` and `expires_at`
/// before calling `change_state`; `db_id` and `added` never change.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub db_id: i64,
    pub origin: Message,
    /// Serialized form of `origin` as written to the `content` column
    pub content: String,
    pub added: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retries: i32,
}

/// A row of either message table, as shown to monitoring consumers.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub version: Option<String>,
    pub name: String,
    pub content: Option<String>,
    pub retries: Option<i32>,
    pub added: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status_name: StatusName,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            StatusName::Scheduled,
            StatusName::Succeeded,
            StatusName::Failed,
        ] {
            assert_eq!(StatusName::from_str(status.as_ref()).unwrap(), status);
        }
        assert!(StatusName::from_str("Delivered").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!StatusName::Scheduled.is_terminal(100, 50));
        assert!(StatusName::Succeeded.is_terminal(0, 50));
        assert!(!StatusName::Failed.is_terminal(49, 50));
        assert!(StatusName::Failed.is_terminal(50, 50));
    }

    #[test]
    fn test_message_kind_names() {
        assert_eq!(MessageKind::Published.to_string(), "published");
        assert_eq!(
            MessageKind::from_str("received").unwrap(),
            MessageKind::Received
        );
    }

    #[test]
    fn test_headers() {
        let message = Message::default()
            .with_header(headers::MESSAGE_ID, "42")
            .with_header(headers::MESSAGE_NAME, "orders.created");

        assert_eq!(message.id(), Some("42"));
        assert_eq!(message.headers.len(), 2);
    }
}
