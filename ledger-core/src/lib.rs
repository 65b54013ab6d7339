//! Clearline Ledger Core
//!
//! Durable ledger state for a trading venue whose matching runs elsewhere:
//! orders, trades, balances, positions and fees, mutated only by the
//! event-driven applier.
//!
//! # Architecture
//!
//! - **Partitioned application**: one in-order worker per account partition
//! - **Ordered locking**: multi-row locks acquired in one canonical order
//! - **Atomic units of work**: one applied event = one RocksDB write batch
//!
//! # Invariants
//!
//! - Balances never negative: `available >= 0 && locked >= 0` after every event
//! - Fill bound: `filled_amount <= amount` for every order, always
//! - Exactly-once trades: redelivered events are detected and skipped
//! - Terminal orders (`Filled`/`Cancelled`/`Rejected`) accept no further fills

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod applier;
pub mod config;
pub mod error;
pub mod fees;
pub mod locks;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports
pub use applier::LedgerApplier;
pub use config::Config;
pub use error::{Error, Result};
pub use fees::FeeSchedule;
pub use storage::Storage;
pub use types::{
    AccountId, Asset, AssetPair, Balance, Fee, Order, OrderKind, OrderSide, OrderStatus,
    Position, Trade,
};
