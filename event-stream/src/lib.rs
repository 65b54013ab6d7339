//! Engine event stream
//!
//! Boundary crate for the matching engine's event log:
//! - Event shapes (`trade_executed`, `order_cancelled`) as a closed sum type
//! - Partitioning by blake3 hash of the account id (all events for one
//!   account land on one partition, totally ordered)
//! - A partitioned dispatcher with one in-order worker per partition,
//!   at-least-once redelivery with exponential backoff
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod types;

pub use dispatcher::{DispatcherConfig, EventHandler, PartitionedDispatcher};
pub use error::{Error, Result};
pub use types::{
    BalanceFigures, BalanceSnapshots, EngineEvent, OrderCancelled, PartitionKey, TradeExecuted,
};
