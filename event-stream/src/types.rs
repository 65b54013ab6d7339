//! Event shapes at the matching-engine boundary
//!
//! Two event kinds arrive on one ordered, partitioned channel. The kinds are
//! a closed sum type so that downstream matching is exhaustive: adding an
//! event type is a compile-time-checked change, not a string comparison.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event emitted by the matching engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A match was executed
    TradeExecuted(TradeExecuted),
    /// An open order was cancelled
    OrderCancelled(OrderCancelled),
}

impl EngineEvent {
    /// Event ID (unique per engine emission; redeliveries reuse it)
    pub fn event_id(&self) -> Uuid {
        match self {
            EngineEvent::TradeExecuted(e) => e.event_id,
            EngineEvent::OrderCancelled(e) => e.event_id,
        }
    }

    /// Partition key: the account whose partition carries this event
    pub fn partition_key(&self) -> PartitionKey {
        match self {
            EngineEvent::TradeExecuted(e) => PartitionKey::Account(e.buyer_id.clone()),
            EngineEvent::OrderCancelled(e) => PartitionKey::Account(e.account_id.clone()),
        }
    }

    /// Emission timestamp
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::TradeExecuted(e) => e.timestamp,
            EngineEvent::OrderCancelled(e) => e.timestamp,
        }
    }
}

/// Available/locked figures for one balance row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceFigures {
    /// Available funds
    pub available: Decimal,
    /// Locked funds
    pub locked: Decimal,
}

/// Authoritative resulting balances carried by newer engine builds
///
/// When present, these are the engine's own post-trade balance values for
/// both participants' base and quote assets. The applier overwrites base
/// rows with them outright and subtracts its independently-computed fee
/// from the quote rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshots {
    /// Buyer's base-asset balance after the trade
    pub buyer_base: BalanceFigures,
    /// Buyer's quote-asset balance after the trade (pre-fee)
    pub buyer_quote: BalanceFigures,
    /// Seller's base-asset balance after the trade
    pub seller_base: BalanceFigures,
    /// Seller's quote-asset balance after the trade (pre-fee)
    pub seller_quote: BalanceFigures,
}

/// A `trade_executed` event
///
/// The `balances` field distinguishes the two supported wire formats:
/// `None` is the legacy delta form, `Some` the snapshot form. Both must
/// converge to the same ledger state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecuted {
    /// Execution event ID
    pub event_id: Uuid,

    /// Buy order
    pub buy_order_id: Uuid,

    /// Sell order
    pub sell_order_id: Uuid,

    /// Buyer account
    pub buyer_id: String,

    /// Seller account
    pub seller_id: String,

    /// Base asset symbol
    pub base_asset: String,

    /// Quote asset symbol
    pub quote_asset: String,

    /// Execution price
    pub price: Decimal,

    /// Executed amount (base asset)
    pub amount: Decimal,

    /// Execution timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional authoritative resulting balances (snapshot form)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balances: Option<BalanceSnapshots>,
}

/// An `order_cancelled` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelled {
    /// Cancellation event ID
    pub event_id: Uuid,

    /// Cancelled order
    pub order_id: Uuid,

    /// Owning account
    pub account_id: String,

    /// Base asset symbol
    pub base_asset: String,

    /// Quote asset symbol
    pub quote_asset: String,

    /// Cancellation timestamp
    pub timestamp: DateTime<Utc>,
}

/// Partition key for routing events
///
/// Partitions are keyed by account id: all events for one account are
/// totally ordered, cross-account ordering is unspecified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionKey {
    /// Partition by account ID
    Account(String),
}

impl PartitionKey {
    /// Compute partition number for load balancing
    pub fn partition_number(&self, num_partitions: u32) -> u32 {
        let PartitionKey::Account(id) = self;
        let hash = blake3::hash(id.as_bytes());
        let hash_bytes = hash.as_bytes();
        let hash_u32 =
            u32::from_le_bytes([hash_bytes[0], hash_bytes[1], hash_bytes[2], hash_bytes[3]]);
        hash_u32 % num_partitions
    }
}
