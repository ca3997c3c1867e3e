use config::Config;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod message;
pub mod monitoring;
pub mod reaper;
pub mod retry;
pub mod schema;
pub mod serializer;
pub mod service;
pub mod storage;

/// Returns a builder for the maintenance daemon.
///
/// Without an explicit config, settings are read from `PARCELMQ_*` variables.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("PARCELMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("PARCELMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    if config.db_path().is_none() {
        tracing::warn!("PARCELMQ_DB_PATH is not set, messages are kept in memory only");
    }

    let service = service::Service::connect_with()
        .config(config)
        .call()
        .await?;

    tracing::info!(
        published = service.initializer().tables().published(),
        received = service.initializer().tables().received(),
        "Message tables ready"
    );

    let cancel = CancellationToken::new();
    let reaper = service.expiry_reaper()?.spawn(cancel.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    cancel.cancel();
    reaper.await?;

    service.db().close().await;

    Ok(())
}
