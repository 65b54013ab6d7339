//! Point-in-time snapshots of balances and positions
//!
//! Snapshots freeze ledger state for a calendar date, upstream of and
//! independent from settlement aggregation. Balance and position
//! snapshotting are independent failure domains: a failure in one is caught
//! and logged without blocking the other, since both feed later,
//! independently-retryable steps.

use crate::{store::SettlementStore, types::{BalanceSnapshot, PositionSnapshot}, Result};
use chrono::{NaiveDate, Utc};
use ledger_core::Storage;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Snapshot orchestrator
pub struct SnapshotOrchestrator {
    ledger: Arc<Storage>,
    store: Arc<SettlementStore>,
}

impl SnapshotOrchestrator {
    /// Create orchestrator over the ledger and settlement stores
    pub fn new(ledger: Arc<Storage>, store: Arc<SettlementStore>) -> Self {
        Self { ledger, store }
    }

    /// Freeze all balances and non-zero positions for `date`
    ///
    /// Idempotent: a date that already has snapshots is a no-op, never an
    /// error. Each domain's failure is absorbed here and surfaced via logs.
    pub fn create_daily_snapshots(&self, date: NaiveDate) -> Result<()> {
        if let Err(e) = self.snapshot_balances(date) {
            tracing::error!(%date, error = %e, "Balance snapshotting failed");
        }
        if let Err(e) = self.snapshot_positions(date) {
            tracing::error!(%date, error = %e, "Position snapshotting failed");
        }
        Ok(())
    }

    fn snapshot_balances(&self, date: NaiveDate) -> Result<()> {
        if self.store.has_balance_snapshots(date)? {
            tracing::debug!(%date, "Balance snapshots already exist");
            return Ok(());
        }

        let captured_at = Utc::now();
        let balances = self.ledger.all_balances()?;
        let count = balances.len();

        for balance in balances {
            self.store.put_balance_snapshot(&BalanceSnapshot {
                account_id: balance.account_id,
                asset: balance.asset.as_str().to_string(),
                date,
                available: balance.available,
                locked: balance.locked,
                captured_at,
            })?;
        }

        tracing::info!(%date, count, "Balance snapshots created");
        Ok(())
    }

    fn snapshot_positions(&self, date: NaiveDate) -> Result<()> {
        if self.store.has_position_snapshots(date)? {
            tracing::debug!(%date, "Position snapshots already exist");
            return Ok(());
        }

        let captured_at = Utc::now();
        let mut count = 0usize;

        for position in self.ledger.all_positions()? {
            if position.amount == Decimal::ZERO {
                continue;
            }
            self.store.put_position_snapshot(&PositionSnapshot {
                account_id: position.account_id.clone(),
                pair: position.pair.clone(),
                date,
                amount: position.amount,
                avg_entry_price: position.avg_entry_price,
                mark_price: position.mark_price,
                unrealized_pnl: position.unrealized_pnl(),
                captured_at,
            })?;
            count += 1;
        }

        tracing::info!(%date, count, "Position snapshots created");
        Ok(())
    }
}
