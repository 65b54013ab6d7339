//! Ledger applier daemon
//!
//! Opens the ledger store, starts the partitioned consumer pool and applies
//! engine events until interrupted. The event-source bridge publishes into
//! the dispatcher; partitioning and worker sizing come from configuration.

use event_stream::PartitionedDispatcher;
use ledger_core::{applier::LedgerApplier, metrics::Metrics, Config, Storage};
use std::error::Error;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting ledger applier daemon");

    let config = match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::from_env()?,
    };

    let storage = Arc::new(Storage::open(&config)?);
    let stats = storage.get_stats()?;
    tracing::info!(
        orders = stats.total_orders,
        trades = stats.total_trades,
        "Ledger store opened"
    );

    let applier = Arc::new(LedgerApplier::new(
        storage,
        config.fees.clone(),
        Metrics::new()?,
    ));

    let dispatcher =
        PartitionedDispatcher::start(config.consumer.to_dispatcher_config(), applier);
    tracing::info!(
        partitions = config.consumer.num_partitions,
        "Consumer pool started"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger applier daemon");
    dispatcher.shutdown().await;
    Ok(())
}
