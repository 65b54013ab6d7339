//! Settlement aggregation
//!
//! Computes per-day and per-month trade/volume/fee/user totals from raw
//! trade and fee rows, plus one immutable per-trade item row for
//! audit/reproducibility. Fees for the window are fetched in a single bulk
//! scan and grouped by trade id in memory, never one query per trade.

use crate::{
    audit::AuditTrail,
    store::SettlementStore,
    types::{
        AuditAction, Settlement, SettlementItem, SettlementKind, SettlementScope, UserSettlement,
        ValidationStatus,
    },
    Config, Error, Result,
};
use chrono::{NaiveDate, Utc};
use ledger_core::types::{AccountId, Fee, OrderSide};
use ledger_core::Storage;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Settlement aggregator
pub struct SettlementAggregator {
    ledger: Arc<Storage>,
    store: Arc<SettlementStore>,
    audit: AuditTrail,
    config: Config,
}

impl SettlementAggregator {
    /// Create aggregator over the ledger and settlement stores
    pub fn new(ledger: Arc<Storage>, store: Arc<SettlementStore>, config: Config) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            ledger,
            store,
            audit,
            config,
        }
    }

    /// Aggregate one business day
    ///
    /// Re-running without `force_recreate` returns the existing settlement
    /// unchanged. With it, the prior settlement and its dependent rows are
    /// destroyed first - the only destructive path in the pipeline.
    pub fn create_daily_settlement(
        &self,
        date: NaiveDate,
        force_recreate: bool,
    ) -> Result<Settlement> {
        let window = self.config.day_window_nanos(date)?;
        self.create_settlement(date, SettlementKind::Daily, window, force_recreate)
    }

    /// Aggregate one calendar month, keyed by its first day
    pub fn create_monthly_settlement(
        &self,
        year: i32,
        month: u32,
        force_recreate: bool,
    ) -> Result<Settlement> {
        let date = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| Error::Config(format!("Invalid month: {}-{}", year, month)))?;
        let window = self.config.month_window_nanos(year, month)?;
        self.create_settlement(date, SettlementKind::Monthly, window, force_recreate)
    }

    fn create_settlement(
        &self,
        date: NaiveDate,
        kind: SettlementKind,
        window: (i64, i64),
        force_recreate: bool,
    ) -> Result<Settlement> {
        let scope = SettlementScope::All;
        let mut version = 1u32;
        let mut recreated_from: Option<Settlement> = None;

        if let Some(existing) = self.store.get_settlement(date, kind, &scope)? {
            if !force_recreate {
                tracing::debug!(%date, "Settlement already exists, returning unchanged");
                return Ok(existing);
            }

            self.store.delete_settlement_cascade(&existing)?;
            version = existing.version + 1;
            recreated_from = Some(existing);
        }

        let (start, end) = window;
        let trades = self.ledger.trades_in_window(start, end)?;
        let fees = self.ledger.fees_in_window(start, end)?;

        let mut volume = Decimal::ZERO;
        let mut users: BTreeSet<AccountId> = BTreeSet::new();
        for trade in &trades {
            volume += trade.notional();
            users.insert(trade.buyer_id.clone());
            users.insert(trade.seller_id.clone());
        }
        let fee_revenue: Decimal = fees.iter().map(|f| f.amount).sum();

        let now = Utc::now();
        let mut settlement = Settlement {
            settlement_id: Uuid::now_v7(),
            date,
            kind,
            scope,
            trade_count: trades.len() as u64,
            volume,
            fee_revenue,
            user_count: users.len() as u64,
            status: ValidationStatus::Calculating,
            version,
            created_at: now,
            updated_at: now,
        };
        self.store.put_settlement(&settlement)?;

        // The recreation marker is recorded under the new settlement, after
        // the cascade, so the trail of the destruction itself survives it.
        if let Some(old) = &recreated_from {
            self.audit.record(
                settlement.settlement_id,
                date,
                AuditAction::SettlementRecreated,
                "aggregator",
                Some(Settlement::totals_json(
                    old.volume,
                    old.fee_revenue,
                    old.trade_count as i64,
                )),
                Some(Settlement::totals_json(
                    volume,
                    fee_revenue,
                    trades.len() as i64,
                )),
            )?;
        }

        self.audit.record(
            settlement.settlement_id,
            date,
            AuditAction::SettlementCreated,
            "aggregator",
            None,
            Some(Settlement::totals_json(
                volume,
                fee_revenue,
                trades.len() as i64,
            )),
        )?;

        // One bulk fetch of the window's fees, grouped by trade in memory
        let fees_by_trade = group_fees_by_trade(&fees);
        for trade in &trades {
            let (buyer_fee, seller_fee) = fees_by_trade
                .get(&trade.event_id)
                .copied()
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));

            self.store.put_item(&SettlementItem {
                item_id: Uuid::now_v7(),
                settlement_id: settlement.settlement_id,
                trade_id: trade.event_id,
                volume: trade.notional(),
                buyer_fee,
                seller_fee,
            })?;
        }

        settlement.status = ValidationStatus::Calculated;
        settlement.updated_at = Utc::now();
        self.store.put_settlement(&settlement)?;

        tracing::info!(
            %date,
            kind = ?kind,
            trades = settlement.trade_count,
            volume = %settlement.volume,
            fees = %settlement.fee_revenue,
            users = settlement.user_count,
            "Settlement calculated"
        );

        Ok(settlement)
    }

    /// Aggregate one account's day, independently retryable per account
    pub fn create_user_daily_settlement(
        &self,
        account: &AccountId,
        date: NaiveDate,
        force_recreate: bool,
    ) -> Result<UserSettlement> {
        if let Some(existing) =
            self.store
                .get_user_settlement(date, SettlementKind::Daily, account)?
        {
            if !force_recreate {
                return Ok(existing);
            }
        }

        let (start, end) = self.config.day_window_nanos(date)?;
        let trades = self.ledger.trades_in_window(start, end)?;
        let fees = self.ledger.fees_in_window(start, end)?;

        let mut trade_count = 0u64;
        let mut volume = Decimal::ZERO;
        for trade in &trades {
            if trade.buyer_id == *account || trade.seller_id == *account {
                trade_count += 1;
                volume += trade.notional();
            }
        }
        let fee_paid: Decimal = fees
            .iter()
            .filter(|f| f.account_id == *account)
            .map(|f| f.amount)
            .sum();

        let row = UserSettlement {
            user_settlement_id: Uuid::now_v7(),
            account_id: account.clone(),
            date,
            kind: SettlementKind::Daily,
            trade_count,
            volume,
            fee_paid,
            created_at: Utc::now(),
        };
        self.store.put_user_settlement(&row)?;

        tracing::debug!(
            %date,
            account = %account,
            trades = trade_count,
            "User settlement calculated"
        );

        Ok(row)
    }

    /// Distinct participants of a day: buyers union sellers
    pub fn eligible_accounts(&self, date: NaiveDate) -> Result<Vec<AccountId>> {
        let (start, end) = self.config.day_window_nanos(date)?;
        let trades = self.ledger.trades_in_window(start, end)?;

        let mut accounts: BTreeSet<AccountId> = BTreeSet::new();
        for trade in trades {
            accounts.insert(trade.buyer_id);
            accounts.insert(trade.seller_id);
        }
        Ok(accounts.into_iter().collect())
    }
}

/// Group fee rows by trade id: (buyer_fee, seller_fee) per trade
fn group_fees_by_trade(fees: &[Fee]) -> HashMap<Uuid, (Decimal, Decimal)> {
    let mut grouped: HashMap<Uuid, (Decimal, Decimal)> = HashMap::new();
    for fee in fees {
        let entry = grouped.entry(fee.trade_id).or_default();
        match fee.side {
            OrderSide::Buy => entry.0 += fee.amount,
            OrderSide::Sell => entry.1 += fee.amount,
        }
    }
    grouped
}
