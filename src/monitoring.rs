//! Read-only queries backing dashboards and inspection tooling.

use std::{collections::BTreeMap, future::Future};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqlitePool};

use crate::{
    db::monitoring::{self as queries, HOUR_KEY_FORMAT},
    error::Error,
    message::{MessageKind, MessageRecord, StatusName},
    schema::TableNames,
};

/// Number of hourly buckets in a timeline.
pub const TIMELINE_HOURS: i64 = 24;

/// Point-in-time counts of finished messages.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub published_succeeded: i64,
    pub published_failed: i64,
    pub received_succeeded: i64,
    pub received_failed: i64,
}

/// Filter and page selection for [`MonitoringApi::messages`].
///
/// Empty strings are treated like absent filters. `content` matches any row
/// whose content contains it literally.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageQuery {
    pub kind: MessageKind,
    pub status_name: Option<StatusName>,
    pub name: Option<String>,
    pub content: Option<String>,
    /// Zero-based page index
    pub current_page: u32,
    pub page_size: u32,
}

impl MessageQuery {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            status_name: None,
            name: None,
            content: None,
            current_page: 0,
            page_size: 20,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PagedQueryResult<T> {
    pub items: Vec<T>,
    pub page_index: u32,
    pub page_size: u32,
    /// Rows matching the filter across all pages
    pub totals: i64,
}

/// Truncates a timestamp to the start of its UTC hour.
pub fn truncate_to_hour(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(TimeDelta::hours(1)).unwrap_or(time)
}

/// The [`TIMELINE_HOURS`] hour starts ending with the hour containing `end`, oldest first.
pub fn timeline_hours(end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let last = truncate_to_hour(end);
    (0..TIMELINE_HOURS)
        .rev()
        .map(|i| last - TimeDelta::hours(i))
        .collect()
}

pub trait MonitoringApi: Send + Sync + 'static {
    fn statistics(&self) -> impl Future<Output = Result<Statistics, Error>> + Send;

    /// Per-hour counts of rows in `status`, for the 24 hours ending at `end`.
    ///
    /// Always yields exactly 24 entries keyed by hour start; empty hours read 0.
    fn hourly_counts(
        &self,
        kind: MessageKind,
        status: StatusName,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<BTreeMap<DateTime<Utc>, i64>, Error>> + Send;

    fn hourly_succeeded_jobs(
        &self,
        kind: MessageKind,
    ) -> impl Future<Output = Result<BTreeMap<DateTime<Utc>, i64>, Error>> + Send {
        self.hourly_counts(kind, StatusName::Succeeded, Utc::now())
    }

    fn hourly_failed_jobs(
        &self,
        kind: MessageKind,
    ) -> impl Future<Output = Result<BTreeMap<DateTime<Utc>, i64>, Error>> + Send {
        self.hourly_counts(kind, StatusName::Failed, Utc::now())
    }

    /// One page of rows matching `query`, newest first.
    fn messages(
        &self,
        query: &MessageQuery,
    ) -> impl Future<Output = Result<PagedQueryResult<MessageRecord>, Error>> + Send;

    fn message_count(
        &self,
        kind: MessageKind,
        status: StatusName,
    ) -> impl Future<Output = Result<i64, Error>> + Send;

    fn published_succeeded_count(&self) -> impl Future<Output = Result<i64, Error>> + Send {
        self.message_count(MessageKind::Published, StatusName::Succeeded)
    }

    fn published_failed_count(&self) -> impl Future<Output = Result<i64, Error>> + Send {
        self.message_count(MessageKind::Published, StatusName::Failed)
    }

    fn received_succeeded_count(&self) -> impl Future<Output = Result<i64, Error>> + Send {
        self.message_count(MessageKind::Received, StatusName::Succeeded)
    }

    fn received_failed_count(&self) -> impl Future<Output = Result<i64, Error>> + Send {
        self.message_count(MessageKind::Received, StatusName::Failed)
    }

    fn get_message(
        &self,
        kind: MessageKind,
        id: i64,
    ) -> impl Future<Output = Result<Option<MessageRecord>, Error>> + Send;

    fn get_published_message(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<Option<MessageRecord>, Error>> + Send {
        self.get_message(MessageKind::Published, id)
    }

    fn get_received_message(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<Option<MessageRecord>, Error>> + Send {
        self.get_message(MessageKind::Received, id)
    }
}

#[derive(Clone)]
pub struct SqliteMonitoringApi {
    pool: SqlitePool,
    tables: TableNames,
}

impl SqliteMonitoringApi {
    pub fn new(pool: SqlitePool, tables: TableNames) -> Self {
        Self { pool, tables }
    }
}

impl MonitoringApi for SqliteMonitoringApi {
    async fn statistics(&self) -> Result<Statistics, Error> {
        let mut conn = self.pool.acquire().await?;
        Ok(queries::statistics(&mut conn, &self.tables).await?)
    }

    #[tracing::instrument(skip(self))]
    async fn hourly_counts(
        &self,
        kind: MessageKind,
        status: StatusName,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<DateTime<Utc>, i64>, Error> {
        let hours = timeline_hours(end);
        let since = hours.first().copied().unwrap_or_else(|| truncate_to_hour(end));

        let mut conn = self.pool.acquire().await?;
        let counts =
            queries::hourly_counts(&mut conn, self.tables.for_kind(kind), status, since).await?;

        Ok(hours
            .into_iter()
            .map(|hour| {
                let key = hour.format(HOUR_KEY_FORMAT).to_string();
                (hour, counts.get(&key).copied().unwrap_or(0))
            })
            .collect())
    }

    #[tracing::instrument(skip_all, fields(kind = %query.kind, page = query.current_page))]
    async fn messages(
        &self,
        query: &MessageQuery,
    ) -> Result<PagedQueryResult<MessageRecord>, Error> {
        if query.page_size == 0 {
            return Err(Error::invalid_parameter("page_size must be positive"));
        }

        let table = self.tables.for_kind(query.kind);
        let mut conn = self.pool.acquire().await?;

        let totals = queries::count_matching(&mut conn, table, query).await?;
        let items = queries::page_matching(&mut conn, table, query).await?;

        Ok(PagedQueryResult {
            items,
            page_index: query.current_page,
            page_size: query.page_size,
            totals,
        })
    }

    async fn message_count(&self, kind: MessageKind, status: StatusName) -> Result<i64, Error> {
        let mut conn = self.pool.acquire().await?;
        Ok(queries::count_by_status(&mut conn, self.tables.for_kind(kind), status).await?)
    }

    async fn get_message(&self, kind: MessageKind, id: i64) -> Result<Option<MessageRecord>, Error> {
        let mut conn = self.pool.acquire().await?;
        Ok(crate::db::message::get(&mut conn, self.tables.for_kind(kind), id).await?)
    }
}
