use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    message::{MessageRecord, StatusName},
    monitoring::{MessageQuery, Statistics},
    schema::TableNames,
};

/// Format of the hour keys produced by [`hourly_counts`].
pub const HOUR_KEY_FORMAT: &str = "%Y-%m-%d-%H";

pub async fn statistics(
    db: &mut SqliteConnection,
    tables: &TableNames,
) -> Result<Statistics, sqlx::Error> {
    let published = tables.published();
    let received = tables.received();

    sqlx::query_as(&format!(
        r#"
        SELECT
            (SELECT COUNT(id) FROM "{published}" WHERE status_name = $1) AS published_succeeded,
            (SELECT COUNT(id) FROM "{received}" WHERE status_name = $2) AS received_succeeded,
            (SELECT COUNT(id) FROM "{published}" WHERE status_name = $3) AS published_failed,
            (SELECT COUNT(id) FROM "{received}" WHERE status_name = $4) AS received_failed
        "#
    ))
    .bind(StatusName::Succeeded)
    .bind(StatusName::Succeeded)
    .bind(StatusName::Failed)
    .bind(StatusName::Failed)
    .fetch_one(db)
    .await
}

pub async fn count_by_status(
    db: &mut SqliteConnection,
    table: &str,
    status: StatusName,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(&format!(
        r#"SELECT COUNT(id) FROM "{table}" WHERE status_name = $1"#
    ))
    .bind(status)
    .fetch_one(db)
    .await
}

/// Counts rows per hour of `added` for rows added at or after `since`.
///
/// Keys use [`HOUR_KEY_FORMAT`]; hours without rows are absent.
pub async fn hourly_counts(
    db: &mut SqliteConnection,
    table: &str,
    status: StatusName,
    since: DateTime<Utc>,
) -> Result<HashMap<String, i64>, sqlx::Error> {
    let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
        r#"
        SELECT strftime('{HOUR_KEY_FORMAT}', added) AS hour_key, COUNT(id) AS count
        FROM "{table}"
        WHERE status_name = $1 AND added >= $2
        GROUP BY hour_key
        "#
    ))
    .bind(status)
    .bind(since)
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().collect())
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &MessageQuery) {
    builder.push(" WHERE 1 = 1");

    if let Some(status) = query.status_name {
        builder.push(" AND status_name = ").push_bind(status);
    }

    if let Some(name) = query.name.as_ref().filter(|n| !n.is_empty()) {
        builder.push(" AND name = ").push_bind(name.clone());
    }

    if let Some(content) = query.content.as_ref().filter(|c| !c.is_empty()) {
        builder
            .push(" AND instr(content, ")
            .push_bind(content.clone())
            .push(") > 0");
    }
}

pub async fn count_matching(
    db: &mut SqliteConnection,
    table: &str,
    query: &MessageQuery,
) -> Result<i64, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(r#"SELECT COUNT(id) FROM "{table}""#));
    push_filters(&mut builder, query);

    builder.build_query_scalar::<i64>().fetch_one(db).await
}

pub async fn page_matching(
    db: &mut SqliteConnection,
    table: &str,
    query: &MessageQuery,
) -> Result<Vec<MessageRecord>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        r#"SELECT id, version, name, content, retries, added, expires_at, status_name FROM "{table}""#
    ));
    push_filters(&mut builder, query);

    let limit = i64::from(query.page_size);
    let offset = i64::from(query.current_page) * limit;

    builder
        .push(" ORDER BY added DESC, id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    builder.build_query_as::<MessageRecord>().fetch_all(db).await
}
