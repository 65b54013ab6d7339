//! Settlement pipeline daemon
//!
//! Opens the ledger (read side) and settlement stores and runs the
//! scheduler: daily runs for yesterday, monthly settlements for the prior
//! month, until interrupted.

use settlement::{Config, SettlementAggregator, SettlementRunner, SettlementScheduler, SettlementStore};
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

    tracing::info!("Starting settlement daemon");

    let config = match std::env::var("SETTLEMENT_CONFIG") {
        Ok(path) => Config::from_file(path)?,
        Err(_) => Config::default(),
    };

    let ledger_config = match std::env::var("LEDGER_CONFIG") {
        Ok(path) => ledger_core::Config::from_file(path)?,
        Err(_) => ledger_core::Config::from_env()?,
    };
    let ledger = Arc::new(ledger_core::Storage::open(&ledger_config)?);
    let store = Arc::new(SettlementStore::open(&config)?);

    let runner = Arc::new(SettlementRunner::new(
        ledger.clone(),
        store.clone(),
        config.clone(),
    ));
    let aggregator = Arc::new(SettlementAggregator::new(
        ledger,
        store,
        config.clone(),
    ));

    let scheduler = Arc::new(SettlementScheduler::new(runner, aggregator, config));

    tokio::select! {
        _ = scheduler.start() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down settlement daemon");
        }
    }

    Ok(())
}
