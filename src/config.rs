use std::time::Duration;

use serde::Deserialize;

use crate::{error::Error, id::MAX_WORKER_ID};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the SQLite database file. When unset an in-memory database is used.
    pub db_path: Option<String>,
    /// Prefix of the `published` and `received` table names.
    pub table_name_prefix: String,
    /// Version stamped on every stored row; retry scans skip other versions.
    pub version: String,
    /// Delivery attempts after which a message is no longer picked up for retry.
    pub failed_retry_count: u32,
    /// Worker id for the snowflake generator. Random when unset.
    pub worker_id: Option<u16>,
    /// Seconds between two expiry collection runs.
    pub collector_interval_secs: u64,
    /// Rows deleted per statement by the expiry collector.
    pub collector_batch_size: u32,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        let config = envy::prefixed("PARCELMQ_").from_env::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn collector_interval(&self) -> Duration {
        Duration::from_secs(self.collector_interval_secs)
    }

    /// Checks the values that end up in SQL text or bit-packed ids.
    pub fn validate(&self) -> Result<(), Error> {
        if self.table_name_prefix.is_empty() {
            return Err(Error::invalid_parameter("table_name_prefix must not be empty"));
        }
        if self
            .table_name_prefix
            .chars()
            .any(|c| c == '"' || c == '\0')
        {
            return Err(Error::invalid_parameter(
                "table_name_prefix must not contain quotes or NUL characters",
            ));
        }
        if self.version.len() > 20 {
            return Err(Error::invalid_parameter(
                "version must be at most 20 characters",
            ));
        }
        if let Some(worker_id) = self.worker_id {
            if i64::from(worker_id) > MAX_WORKER_ID {
                return Err(Error::invalid_parameter(format!(
                    "worker_id must be at most {MAX_WORKER_ID}"
                )));
            }
        }
        if self.collector_interval_secs == 0 {
            return Err(Error::invalid_parameter(
                "collector_interval_secs must be positive",
            ));
        }
        if self.collector_batch_size == 0 {
            return Err(Error::invalid_parameter(
                "collector_batch_size must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            table_name_prefix: "parcel".to_owned(),
            version: "v1".to_owned(),
            failed_retry_count: 50,
            worker_id: None,
            collector_interval_secs: 300,
            collector_batch_size: 1000,
        }
    }
}
