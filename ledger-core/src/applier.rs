//! Event-driven ledger applier
//!
//! Consumes one engine event at a time per partition and applies its full
//! effect - order fills, balance movement, position update, fee rows - as a
//! single atomic unit of work against the ledger store.
//!
//! Delivery is at-least-once, so application is idempotent: before mutating
//! anything the applier loads the touched rows under ordered locks and runs
//! the duplicate/stale checks. A detected redelivery is logged and skipped.
//! An invariant violation (negative balance, over-fill) is a hard error
//! that aborts the unit of work and surfaces to the dispatcher for
//! redelivery.

use crate::{
    fees::FeeSchedule,
    locks::{LockKey, LockTable},
    metrics::Metrics,
    types::{AccountId, Asset, AssetPair, Balance, Order, OrderSide, OrderStatus, Trade},
    Result, Storage,
};
use async_trait::async_trait;
use event_stream::{EngineEvent, EventHandler, OrderCancelled, TradeExecuted};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Applies engine events to the ledger store
pub struct LedgerApplier {
    /// Ledger store
    storage: Arc<Storage>,

    /// Row-lock table shared by all partitions
    locks: LockTable,

    /// Fee schedule (fees are computed here, never trusted from events)
    fees: FeeSchedule,

    /// Metrics collector
    metrics: Metrics,
}

impl LedgerApplier {
    /// Create new applier over the given store
    pub fn new(storage: Arc<Storage>, fees: FeeSchedule, metrics: Metrics) -> Self {
        Self {
            storage,
            locks: LockTable::new(),
            fees,
            metrics,
        }
    }

    /// Log and count a stale/duplicate event
    ///
    /// Skipped events are never retried; the log line carries the ids
    /// needed to replay manually.
    fn skip(&self, event_id: Uuid, reason: &str) {
        self.metrics.record_event_skipped();
        tracing::warn!(%event_id, reason, "Event skipped as stale or duplicate");
    }

    /// Apply a `trade_executed` event
    pub async fn apply_trade(&self, event: &TradeExecuted) -> Result<()> {
        let buyer = AccountId::new(&event.buyer_id);
        let seller = AccountId::new(&event.seller_id);
        let base = Asset::new(&event.base_asset);
        let quote = Asset::new(&event.quote_asset);
        let pair = AssetPair::new(base.clone(), quote.clone());

        if buyer == seller {
            self.skip(event.event_id, "self-trade");
            return Ok(());
        }

        // Every row this event touches, locked in canonical order.
        let _guards = self
            .locks
            .acquire(&[
                LockKey::Order(event.buy_order_id),
                LockKey::Order(event.sell_order_id),
                LockKey::Balance(buyer.clone(), base.clone()),
                LockKey::Balance(buyer.clone(), quote.clone()),
                LockKey::Balance(seller.clone(), base.clone()),
                LockKey::Balance(seller.clone(), quote.clone()),
                LockKey::Position(buyer.clone(), pair.clone()),
                LockKey::Position(seller.clone(), pair.clone()),
            ])
            .await;

        // Duplicate/stale detection. Any violation means redelivery or a
        // stale event: skip, never apply twice.
        if self.storage.trade_exists(event.event_id)? {
            self.skip(event.event_id, "trade already recorded");
            return Ok(());
        }

        let mut buy_order = match self.storage.get_order(event.buy_order_id)? {
            Some(order) => order,
            None => {
                self.skip(event.event_id, "buy order missing");
                return Ok(());
            }
        };
        let mut sell_order = match self.storage.get_order(event.sell_order_id)? {
            Some(order) => order,
            None => {
                self.skip(event.event_id, "sell order missing");
                return Ok(());
            }
        };

        if buy_order.side != OrderSide::Buy
            || sell_order.side != OrderSide::Sell
            || buy_order.account_id != buyer
            || sell_order.account_id != seller
        {
            self.skip(event.event_id, "order/account mismatch");
            return Ok(());
        }

        if buy_order.status.is_terminal() || !buy_order.can_fill(event.amount) {
            self.skip(event.event_id, "buy order terminal or fill exceeds amount");
            return Ok(());
        }
        if sell_order.status.is_terminal() || !sell_order.can_fill(event.amount) {
            self.skip(event.event_id, "sell order terminal or fill exceeds amount");
            return Ok(());
        }

        // Shorting is unsupported: a sell beyond the held position is
        // skipped, not retried.
        let mut seller_position = self.storage.get_position_or_flat(&seller, &pair)?;
        if event.amount > seller_position.amount {
            self.skip(event.event_id, "sell would open a short position");
            return Ok(());
        }

        // Checks passed. From here on every failure aborts the unit of
        // work; nothing below is committed until the final batch.
        let started = Instant::now();
        let notional = event.price * event.amount;

        let trade = Trade {
            event_id: event.event_id,
            buy_order_id: event.buy_order_id,
            sell_order_id: event.sell_order_id,
            buyer_id: buyer.clone(),
            seller_id: seller.clone(),
            pair: pair.clone(),
            price: event.price,
            amount: event.amount,
            timestamp_nanos: event.timestamp.timestamp_nanos_opt().unwrap_or(0),
        };

        let buyer_fee = self.fees.fee_for(&trade, OrderSide::Buy, &buyer);
        let seller_fee = self.fees.fee_for(&trade, OrderSide::Sell, &seller);

        buy_order.apply_fill(event.amount, notional, event.timestamp)?;
        sell_order.apply_fill(event.amount, notional, event.timestamp)?;

        let mut buyer_base = self.storage.get_balance_or_zero(&buyer, &base)?;
        let mut buyer_quote = self.storage.get_balance_or_zero(&buyer, &quote)?;
        let mut seller_base = self.storage.get_balance_or_zero(&seller, &base)?;
        let mut seller_quote = self.storage.get_balance_or_zero(&seller, &quote)?;

        if let Err(e) = self.apply_balances(
            event,
            notional,
            buyer_fee.amount,
            seller_fee.amount,
            &mut buyer_base,
            &mut buyer_quote,
            &mut seller_base,
            &mut seller_quote,
        ) {
            self.metrics.record_invariant_abort();
            return Err(e);
        }

        let mut buyer_position = self.storage.get_position_or_flat(&buyer, &pair)?;
        buyer_position.apply_buy(event.amount, event.price);
        seller_position.apply_sell(event.amount, event.price)?;

        self.storage.commit_trade(
            &trade,
            &[&buy_order, &sell_order],
            &[&buyer_base, &buyer_quote, &seller_base, &seller_quote],
            &[&buyer_position, &seller_position],
            &[&buyer_fee, &seller_fee],
        )?;

        self.metrics.record_trade_applied();
        self.metrics
            .record_apply_duration(started.elapsed().as_secs_f64());

        tracing::debug!(
            event_id = %event.event_id,
            pair = %pair,
            amount = %event.amount,
            price = %event.price,
            snapshot_form = event.balances.is_some(),
            "Trade applied"
        );

        Ok(())
    }

    /// Move balances for one trade, via whichever wire form the event uses
    ///
    /// The snapshot form is authoritative when present: base rows are
    /// overwritten outright, quote rows overwritten and then reduced by the
    /// locally computed fee. The legacy delta form must converge to the
    /// same end state.
    #[allow(clippy::too_many_arguments)]
    fn apply_balances(
        &self,
        event: &TradeExecuted,
        notional: Decimal,
        buyer_fee: Decimal,
        seller_fee: Decimal,
        buyer_base: &mut Balance,
        buyer_quote: &mut Balance,
        seller_base: &mut Balance,
        seller_quote: &mut Balance,
    ) -> Result<()> {
        match &event.balances {
            Some(snaps) => {
                buyer_base.overwrite(snaps.buyer_base.available, snaps.buyer_base.locked)?;
                seller_base.overwrite(snaps.seller_base.available, snaps.seller_base.locked)?;

                buyer_quote.overwrite(snaps.buyer_quote.available, snaps.buyer_quote.locked)?;
                buyer_quote.apply_delta(Decimal::ZERO, -buyer_fee)?;

                seller_quote.overwrite(snaps.seller_quote.available, snaps.seller_quote.locked)?;
                seller_quote.apply_delta(-seller_fee, Decimal::ZERO)?;
            }
            None => {
                // Buyer receives base into available, pays notional + fee
                // from locked quote; seller gives base from locked,
                // receives notional - fee into available quote.
                buyer_base.apply_delta(event.amount, Decimal::ZERO)?;
                buyer_quote.apply_delta(Decimal::ZERO, -(notional + buyer_fee))?;
                seller_base.apply_delta(Decimal::ZERO, -event.amount)?;
                seller_quote.apply_delta(notional - seller_fee, Decimal::ZERO)?;
            }
        }

        Ok(())
    }

    /// Apply an `order_cancelled` event
    pub async fn apply_cancel(&self, event: &OrderCancelled) -> Result<()> {
        let account = AccountId::new(&event.account_id);
        let base = Asset::new(&event.base_asset);
        let quote = Asset::new(&event.quote_asset);

        let _guards = self
            .locks
            .acquire(&[
                LockKey::Order(event.order_id),
                LockKey::Balance(account.clone(), base.clone()),
                LockKey::Balance(account.clone(), quote.clone()),
            ])
            .await;

        let mut order = match self.storage.get_order(event.order_id)? {
            Some(order) => order,
            None => {
                self.skip(event.event_id, "cancelled order missing");
                return Ok(());
            }
        };

        if order.account_id != account {
            self.skip(event.event_id, "cancel account mismatch");
            return Ok(());
        }

        if order.status.is_terminal() {
            // Already cancelled (or filled/rejected): nothing left to release.
            self.skip(event.event_id, "order already terminal");
            return Ok(());
        }

        let remaining = order.remaining_amount();
        order.status = OrderStatus::Cancelled;
        order.updated_at = event.timestamp;

        // Release the unfilled portion's locked funds: base amount for a
        // sell, quote notional for a buy.
        let released = match order.side {
            OrderSide::Sell => {
                let mut balance = self.storage.get_balance_or_zero(&account, &base)?;
                balance.apply_delta(remaining, -remaining)?;
                Some(balance)
            }
            OrderSide::Buy => match order.limit_price {
                Some(price) => {
                    let locked_notional = remaining * price;
                    let mut balance = self.storage.get_balance_or_zero(&account, &quote)?;
                    balance.apply_delta(locked_notional, -locked_notional)?;
                    Some(balance)
                }
                None => {
                    // A market buy carries no limit price, so the locked
                    // notional of the remainder is not derivable from the
                    // order row; the placement flow owns it.
                    tracing::warn!(
                        order_id = %order.order_id,
                        "Cancelled market buy releases no locked balance"
                    );
                    None
                }
            },
        };

        self.storage.commit_cancel(&order, released.as_ref())?;
        self.metrics.record_cancel_applied();

        tracing::debug!(
            event_id = %event.event_id,
            order_id = %order.order_id,
            remaining = %remaining,
            "Order cancelled"
        );

        Ok(())
    }
}

#[async_trait]
impl EventHandler for LedgerApplier {
    async fn handle(&self, event: EngineEvent) -> anyhow::Result<()> {
        match event {
            EngineEvent::TradeExecuted(e) => self.apply_trade(&e).await?,
            EngineEvent::OrderCancelled(e) => self.apply_cancel(&e).await?,
        }
        Ok(())
    }
}
