use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio_stream::StreamExt;

use crate::message::{MessageRecord, StatusName};

/// Values written by a single insert into either message table.
pub struct NewMessage<'a> {
    pub id: i64,
    pub version: &'a str,
    pub name: &'a str,
    pub content: &'a str,
    pub retries: i32,
    pub added: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status_name: StatusName,
}

impl NewMessage<'_> {
    pub async fn insert(&self, db: &mut SqliteConnection, table: &str) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            INSERT INTO "{table}" (id, version, name, content, retries, added, expires_at, status_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#
        ))
        .bind(self.id)
        .bind(self.version)
        .bind(self.name)
        .bind(self.content)
        .bind(self.retries)
        .bind(self.added)
        .bind(self.expires_at)
        .bind(self.status_name)
        .execute(db)
        .await?;

        Ok(())
    }
}

/// Writes the mutable columns of one row. Returns the number of rows touched (0 or 1).
pub async fn update_state(
    db: &mut SqliteConnection,
    table: &str,
    id: i64,
    content: &str,
    retries: i32,
    expires_at: Option<DateTime<Utc>>,
    status: StatusName,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE "{table}"
        SET content = $1, retries = MAX(COALESCE(retries, 0), $2), expires_at = $3, status_name = $4
        WHERE id = $5
        "#
    ))
    .bind(content)
    .bind(retries)
    .bind(expires_at)
    .bind(status)
    .bind(id)
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_expired(
    db: &mut SqliteConnection,
    table: &str,
    timeout: DateTime<Utc>,
    batch_count: u32,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&format!(
        r#"
        DELETE FROM "{table}"
        WHERE id IN (SELECT id FROM "{table}" WHERE expires_at < $1 LIMIT $2)
        "#
    ))
    .bind(timeout)
    .bind(i64::from(batch_count))
    .execute(db)
    .await?;

    Ok(result.rows_affected())
}

/// Filter for rows that may be dispatched again.
pub struct RetryFilter<'a> {
    pub max_retries: u32,
    pub version: &'a str,
    pub added_before: DateTime<Utc>,
    pub limit: u32,
}

pub async fn list_need_retry(
    db: &mut SqliteConnection,
    table: &str,
    filter: &RetryFilter<'_>,
) -> Result<Vec<MessageRecord>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT id, version, name, content, retries, added, expires_at, status_name
        FROM "{table}"
        WHERE retries < $1 AND version = $2 AND added < $3 AND status_name IN ($4, $5)
        LIMIT $6
        "#
    );

    let mut stream = sqlx::query_as::<_, MessageRecord>(&sql)
        .bind(i64::from(filter.max_retries))
        .bind(filter.version)
        .bind(filter.added_before)
        .bind(StatusName::Failed)
        .bind(StatusName::Scheduled)
        .bind(i64::from(filter.limit))
        .fetch(db);

    let mut messages = Vec::new();

    while let Some(res) = stream.next().await.transpose()? {
        messages.push(res);
    }

    Ok(messages)
}

pub async fn get(
    db: &mut SqliteConnection,
    table: &str,
    id: i64,
) -> Result<Option<MessageRecord>, sqlx::Error> {
    sqlx::query_as(&format!(
        r#"
        SELECT id, version, name, content, retries, added, expires_at, status_name
        FROM "{table}"
        WHERE id = $1
        "#
    ))
    .bind(id)
    .fetch_optional(db)
    .await
}
