//! Table layout and idempotent schema creation.

use snafu::ResultExt;
use sqlx::{SqliteConnection, SqlitePool};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, SchemaSnafu},
    message::MessageKind,
};

/// Names of the two message tables for one prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableNames {
    published: String,
    received: String,
}

impl TableNames {
    pub fn new(prefix: &str) -> Self {
        Self {
            published: format!("{prefix}.published"),
            received: format!("{prefix}.received"),
        }
    }

    pub fn published(&self) -> &str {
        &self.published
    }

    pub fn received(&self) -> &str {
        &self.received
    }

    pub fn for_kind(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Published => &self.published,
            MessageKind::Received => &self.received,
        }
    }
}

#[derive(Clone)]
pub struct StorageInitializer {
    pool: SqlitePool,
    tables: TableNames,
}

impl StorageInitializer {
    pub fn new(pool: SqlitePool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Creates both message tables and their expiry indexes if they are missing.
    ///
    /// Safe to call on every start and from several processes at once.
    #[tracing::instrument(skip_all)]
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for kind in MessageKind::ALL {
            create_table(&mut *tx, self.tables.for_kind(kind)).await?;
        }

        tx.commit().await?;

        tracing::debug!("Ensuring all create database tables script are applied.");

        Ok(())
    }
}

async fn create_table(db: &mut SqliteConnection, table: &str) -> Result<(), Error> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id INTEGER NOT NULL PRIMARY KEY,
            version VARCHAR(20),
            name VARCHAR(200) NOT NULL,
            content TEXT,
            retries INT,
            added TIMESTAMP NOT NULL,
            expires_at TIMESTAMP,
            status_name VARCHAR(40) NOT NULL
        )
        "#
    ))
    .execute(&mut *db)
    .await
    .context(SchemaSnafu { table })?;

    sqlx::query(&format!(
        r#"CREATE INDEX IF NOT EXISTS "IX_{table}_expires_at" ON "{table}" (expires_at)"#
    ))
    .execute(&mut *db)
    .await
    .context(SchemaSnafu { table })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_db() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn test_table_names() {
        let tables = TableNames::new("orders");

        assert_eq!(tables.published(), "orders.published");
        assert_eq!(tables.received(), "orders.received");
        assert_eq!(tables.for_kind(MessageKind::Received), "orders.received");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let db = setup_db().await;
        let initializer = StorageInitializer::new(db.clone(), TableNames::new("parcel"));
        let cancel = CancellationToken::new();

        initializer.initialize(&cancel).await.unwrap();
        initializer.initialize(&cancel).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&db)
        .await
        .unwrap();

        assert_eq!(tables, vec!["parcel.published", "parcel.received"]);

        let indexes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'IX_%'",
        )
        .fetch_one(&db)
        .await
        .unwrap();

        assert_eq!(indexes, 2);
    }

    #[tokio::test]
    async fn test_cancelled_initialize_does_nothing() {
        let db = setup_db().await;
        let initializer = StorageInitializer::new(db.clone(), TableNames::new("parcel"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        initializer.initialize(&cancel).await.unwrap();

        let tables: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&db)
                .await
                .unwrap();

        assert_eq!(tables, 0);
    }
}
