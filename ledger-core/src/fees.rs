//! Fee schedule
//!
//! Fees are computed locally from configuration, never trusted from the
//! event stream: rate × trade notional, once per side, denominated in the
//! pair's quote asset.

use crate::types::{AccountId, Fee, OrderSide, Trade};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-side fee rates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Rate charged to the buyer
    pub buyer_rate: Decimal,

    /// Rate charged to the seller
    pub seller_rate: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            buyer_rate: Decimal::new(1, 3),  // 0.001
            seller_rate: Decimal::new(1, 3), // 0.001
        }
    }
}

impl FeeSchedule {
    /// Rate for one side
    pub fn rate(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => self.buyer_rate,
            OrderSide::Sell => self.seller_rate,
        }
    }

    /// Fee amount for one side of a trade
    pub fn fee_amount(&self, side: OrderSide, notional: Decimal) -> Decimal {
        self.rate(side) * notional
    }

    /// Build the fee row for one side of a trade
    pub fn fee_for(&self, trade: &Trade, side: OrderSide, account_id: &AccountId) -> Fee {
        let notional = trade.notional();
        Fee {
            trade_id: trade.event_id,
            account_id: account_id.clone(),
            side,
            rate: self.rate(side),
            amount: self.fee_amount(side, notional),
            asset: trade.pair.quote.clone(),
            notional,
            timestamp_nanos: trade.timestamp_nanos,
        }
    }
}
