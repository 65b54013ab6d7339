//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Mutation through checked methods that uphold the ledger invariants

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Account identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asset symbol (e.g. "BTC", "USD")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Asset(String);

impl Asset {
    /// Create new asset symbol
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Traded asset pair (base priced in quote)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetPair {
    /// Base asset (the one being bought/sold)
    pub base: Asset,

    /// Quote asset (the one prices are denominated in)
    pub quote: Asset,
}

impl AssetPair {
    /// Create new pair
    pub fn new(base: Asset, quote: Asset) -> Self {
        Self { base, quote }
    }

    /// Canonical symbol, e.g. "BTC/USD"
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderSide {
    /// Buy base with quote
    Buy = 1,
    /// Sell base for quote
    Sell = 2,
}

/// Order kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderKind {
    /// Limit order with a price cap
    Limit = 1,
    /// Market order, price determined by the engine
    Market = 2,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderStatus {
    /// Accepted, no fills yet
    Pending = 1,
    /// Partially filled
    Partial = 2,
    /// Fully filled (terminal)
    Filled = 3,
    /// Cancelled (terminal)
    Cancelled = 4,
    /// Rejected (terminal)
    Rejected = 5,
}

impl OrderStatus {
    /// Terminal statuses accept no further fills
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// An order as recorded in the ledger
///
/// Created on submission (outside this core); mutated only by the applier
/// in response to fill/cancel events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Order ID
    pub order_id: Uuid,

    /// Owning account
    pub account_id: AccountId,

    /// Side
    pub side: OrderSide,

    /// Kind
    pub kind: OrderKind,

    /// Asset pair
    pub pair: AssetPair,

    /// Limit price (None for market orders)
    pub limit_price: Option<Decimal>,

    /// Requested amount (base asset)
    pub amount: Decimal,

    /// Filled amount so far (base asset)
    pub filled_amount: Decimal,

    /// Filled notional so far (quote asset)
    pub filled_notional: Decimal,

    /// Status
    pub status: OrderStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Unfilled remainder (base asset)
    pub fn remaining_amount(&self) -> Decimal {
        self.amount - self.filled_amount
    }

    /// Whether a fill of `amount` can be applied without violating
    /// the fill-bound invariant or touching a terminal order
    pub fn can_fill(&self, amount: Decimal) -> bool {
        !self.status.is_terminal() && self.filled_amount + amount <= self.amount
    }

    /// Apply a fill, updating amounts and status
    ///
    /// Callers must have checked `can_fill` first; this returns an
    /// invariant violation otherwise rather than clamping.
    pub fn apply_fill(
        &mut self,
        amount: Decimal,
        notional: Decimal,
        at: DateTime<Utc>,
    ) -> crate::Result<()> {
        if !self.can_fill(amount) {
            return Err(crate::Error::InvariantViolation(format!(
                "fill of {} on order {} would exceed amount {} (filled {}) or touch terminal status {:?}",
                amount, self.order_id, self.amount, self.filled_amount, self.status
            )));
        }

        self.filled_amount += amount;
        self.filled_notional += notional;
        self.status = if self.filled_amount == self.amount {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        self.updated_at = at;

        Ok(())
    }
}

/// Immutable record of one match, keyed by the execution event ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Execution event ID (from the matching engine)
    pub event_id: Uuid,

    /// Buy order
    pub buy_order_id: Uuid,

    /// Sell order
    pub sell_order_id: Uuid,

    /// Buyer account
    pub buyer_id: AccountId,

    /// Seller account
    pub seller_id: AccountId,

    /// Asset pair
    pub pair: AssetPair,

    /// Execution price (quote per base)
    pub price: Decimal,

    /// Executed amount (base asset)
    pub amount: Decimal,

    /// Execution timestamp (nanoseconds since Unix epoch)
    pub timestamp_nanos: i64,
}

impl Trade {
    /// Notional value (quote asset)
    pub fn notional(&self) -> Decimal {
        self.price * self.amount
    }
}

/// Per-account, per-asset balance row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Owning account
    pub account_id: AccountId,

    /// Asset
    pub asset: Asset,

    /// Available funds
    pub available: Decimal,

    /// Funds locked against open orders
    pub locked: Decimal,
}

impl Balance {
    /// Zero balance row for (account, asset)
    pub fn zero(account_id: AccountId, asset: Asset) -> Self {
        Self {
            account_id,
            asset,
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }

    /// Total funds (available + locked)
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }

    /// Apply deltas to available/locked, rejecting any negative result
    ///
    /// A balance that would go negative is a hard error, never clamped.
    pub fn apply_delta(
        &mut self,
        available_delta: Decimal,
        locked_delta: Decimal,
    ) -> crate::Result<()> {
        let available = self.available + available_delta;
        let locked = self.locked + locked_delta;

        if available < Decimal::ZERO || locked < Decimal::ZERO {
            return Err(crate::Error::InvariantViolation(format!(
                "balance for {}/{} would go negative (available {} -> {}, locked {} -> {})",
                self.account_id, self.asset, self.available, available, self.locked, locked
            )));
        }

        self.available = available;
        self.locked = locked;
        Ok(())
    }

    /// Overwrite with authoritative values, rejecting negatives
    pub fn overwrite(&mut self, available: Decimal, locked: Decimal) -> crate::Result<()> {
        if available < Decimal::ZERO || locked < Decimal::ZERO {
            return Err(crate::Error::InvariantViolation(format!(
                "snapshot for {}/{} carries negative figures (available {}, locked {})",
                self.account_id, self.asset, available, locked
            )));
        }

        self.available = available;
        self.locked = locked;
        Ok(())
    }
}

/// Per-account, per-pair position row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Owning account
    pub account_id: AccountId,

    /// Asset pair
    pub pair: AssetPair,

    /// Signed position amount (base asset); never negative, shorts unsupported
    pub amount: Decimal,

    /// Volume-weighted average entry price
    pub avg_entry_price: Decimal,

    /// Current mark price
    pub mark_price: Decimal,
}

impl Position {
    /// Flat position for (account, pair)
    pub fn flat(account_id: AccountId, pair: AssetPair) -> Self {
        Self {
            account_id,
            pair,
            amount: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
        }
    }

    /// Unrealized P&L at the current mark
    pub fn unrealized_pnl(&self) -> Decimal {
        (self.mark_price - self.avg_entry_price) * self.amount
    }

    /// Grow the position by a buy of `amount` at `price`
    ///
    /// Entry price is recomputed as the volume-weighted average since the
    /// position grows in the same direction.
    pub fn apply_buy(&mut self, amount: Decimal, price: Decimal) {
        let new_amount = self.amount + amount;
        self.avg_entry_price =
            (self.amount * self.avg_entry_price + amount * price) / new_amount;
        self.amount = new_amount;
        self.mark_price = price;
    }

    /// Reduce the position by a sell of `amount` at `price`
    ///
    /// Entry price is preserved on reduction and reset to the trade price
    /// when the position returns to exactly zero. A sell exceeding the held
    /// position would open a short and is rejected.
    pub fn apply_sell(&mut self, amount: Decimal, price: Decimal) -> crate::Result<()> {
        if amount > self.amount {
            return Err(crate::Error::InvalidEvent(format!(
                "sell of {} {} by {} would open a short (position {})",
                amount, self.pair, self.account_id, self.amount
            )));
        }

        self.amount -= amount;
        if self.amount == Decimal::ZERO {
            self.avg_entry_price = price;
        }
        self.mark_price = price;
        Ok(())
    }
}

/// Fee charged to one side of a trade
///
/// Written exactly once per (trade, side) in the same unit of work as the
/// trade and balance writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fee {
    /// Trade this fee belongs to (execution event ID)
    pub trade_id: Uuid,

    /// Charged account
    pub account_id: AccountId,

    /// Which side of the trade was charged
    pub side: OrderSide,

    /// Rate applied
    pub rate: Decimal,

    /// Fee amount (in `asset`)
    pub amount: Decimal,

    /// Fee asset (the pair's quote asset)
    pub asset: Asset,

    /// Trade notional the rate was applied to
    pub notional: Decimal,

    /// Trade timestamp (nanoseconds since Unix epoch)
    pub timestamp_nanos: i64,
}
