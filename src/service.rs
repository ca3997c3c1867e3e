use std::{str::FromStr, sync::Arc};

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::Error,
    id::{IdGenerator, SnowflakeId},
    monitoring::SqliteMonitoringApi,
    reaper::ExpiryReaper,
    retry::RetryScanner,
    schema::{StorageInitializer, TableNames},
    serializer::{JsonSerializer, Serializer},
    storage::SqliteStorage,
};

/// Everything needed to persist and inspect messages, wired from one [`Config`].
pub struct Service {
    db: SqlitePool,
    config: Config,
    storage: SqliteStorage,
    monitoring: SqliteMonitoringApi,
    initializer: StorageInitializer,
}

#[bon::bon]
impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with().call().await
    }

    /// Opens the database and, unless disabled, creates the message tables.
    #[builder]
    pub async fn connect_with(
        #[builder(default)] config: Config,
        id_generator: Option<Arc<dyn IdGenerator>>,
        serializer: Option<Arc<dyn Serializer>>,
        #[builder(default = true)] initialize_schema: bool,
    ) -> Result<Self, Error> {
        config.validate()?;

        let (opts, pool_opts) = match config.db_path() {
            Some(path) => (
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true),
                SqlitePoolOptions::new(),
            ),
            // An in-memory database lives as long as its last connection.
            None => (
                SqliteConnectOptions::from_str("sqlite::memory:")?,
                SqlitePoolOptions::new()
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None),
            ),
        };

        let opts = opts
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = pool_opts.connect_with(opts).await?;

        let tables = TableNames::new(&config.table_name_prefix);

        let id_generator = id_generator.unwrap_or_else(|| {
            Arc::new(match config.worker_id {
                Some(worker_id) => SnowflakeId::new(worker_id),
                None => SnowflakeId::random(),
            })
        });

        let storage = SqliteStorage::builder()
            .pool(pool.clone())
            .tables(tables.clone())
            .version(config.version.clone())
            .failed_retry_count(config.failed_retry_count)
            .id_generator(id_generator)
            .serializer(serializer.unwrap_or_else(|| Arc::new(JsonSerializer)))
            .build();

        let monitoring = SqliteMonitoringApi::new(pool.clone(), tables.clone());
        let initializer = StorageInitializer::new(pool.clone(), tables);

        if initialize_schema {
            initializer.initialize(&CancellationToken::new()).await?;
        }

        Ok(Self {
            db: pool,
            config,
            storage,
            monitoring,
            initializer,
        })
    }
}

impl Service {
    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn monitoring(&self) -> &SqliteMonitoringApi {
        &self.monitoring
    }

    pub fn initializer(&self) -> &StorageInitializer {
        &self.initializer
    }

    pub fn retry_scanner(&self) -> RetryScanner<SqliteStorage> {
        RetryScanner::new(self.storage.clone())
    }

    pub fn expiry_reaper(&self) -> Result<ExpiryReaper<SqliteStorage>, Error> {
        ExpiryReaper::new(
            self.storage.clone(),
            self.config.collector_interval(),
            self.config.collector_batch_size,
        )
    }
}
