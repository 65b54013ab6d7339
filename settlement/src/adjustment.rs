//! Adjustment ledger
//!
//! Non-destructive corrections layered on finalized settlements. Original
//! totals are never mutated: each correction is an immutable delta row with
//! a computed before/after snapshot, and the effective value of a
//! settlement is recomputed on read as original plus the sum of its
//! adjustments. Every adjustment is mirrored into the audit trail.

use crate::{
    audit::AuditTrail,
    store::SettlementStore,
    types::{
        AdjustedSettlement, AdjustmentKind, AuditAction, Settlement, SettlementAdjustment,
        SettlementKind, SettlementScope, ValidationStatus,
    },
    Error, Result,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Adjustment ledger over daily settlements
pub struct AdjustmentLedger {
    store: Arc<SettlementStore>,
    audit: AuditTrail,
}

impl AdjustmentLedger {
    /// Create the adjustment ledger
    pub fn new(store: Arc<SettlementStore>) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self { store, audit }
    }

    /// Apply a correction to the daily settlement for `date`
    ///
    /// Records the delta with its before/after effective totals and flips
    /// the settlement to `Adjusted`. The original totals stay untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_adjustment(
        &self,
        date: NaiveDate,
        kind: AdjustmentKind,
        reason: &str,
        actor: &str,
        volume_delta: Decimal,
        fee_delta: Decimal,
        trade_count_delta: i64,
    ) -> Result<SettlementAdjustment> {
        let mut settlement = self.get_daily(date)?;

        if !settlement.status.is_post_calculated() {
            return Err(Error::InvalidState(format!(
                "settlement for {} is still calculating, cannot adjust",
                date
            )));
        }

        // Effective totals before this adjustment
        let current = self.effective_totals(&settlement)?;
        let before = Settlement::totals_json(current.0, current.1, current.2);
        let after = Settlement::totals_json(
            current.0 + volume_delta,
            current.1 + fee_delta,
            current.2 + trade_count_delta,
        );

        let adjustment = SettlementAdjustment {
            adjustment_id: Uuid::now_v7(),
            settlement_id: settlement.settlement_id,
            date,
            kind,
            reason: reason.to_string(),
            actor: actor.to_string(),
            volume_delta,
            fee_delta,
            trade_count_delta,
            before: before.to_string(),
            after: after.to_string(),
            created_at: Utc::now(),
        };
        self.store.put_adjustment(&adjustment)?;

        settlement.status = ValidationStatus::Adjusted;
        settlement.version += 1;
        settlement.updated_at = Utc::now();
        self.store.put_settlement(&settlement)?;

        self.audit.record(
            settlement.settlement_id,
            date,
            AuditAction::AdjustmentApplied,
            actor,
            Some(before),
            Some(after),
        )?;

        tracing::info!(
            %date,
            kind = ?kind,
            actor,
            volume_delta = %volume_delta,
            fee_delta = %fee_delta,
            trade_count_delta,
            "Adjustment applied"
        );

        Ok(adjustment)
    }

    /// Read the settlement with its adjustments folded in
    pub fn get_adjusted_settlement(&self, date: NaiveDate) -> Result<AdjustedSettlement> {
        let settlement = self.get_daily(date)?;
        let adjustments = self.store.adjustments_for(settlement.settlement_id)?;
        let (volume, fees, trades) = self.effective_totals(&settlement)?;

        Ok(AdjustedSettlement {
            settlement,
            adjustments,
            effective_volume: volume,
            effective_fee_revenue: fees,
            effective_trade_count: trades,
        })
    }

    fn get_daily(&self, date: NaiveDate) -> Result<Settlement> {
        self.store
            .get_settlement(date, SettlementKind::Daily, &SettlementScope::All)?
            .ok_or_else(|| Error::SettlementNotFound(date.to_string()))
    }

    /// Original totals plus the sum of all adjustments
    fn effective_totals(&self, settlement: &Settlement) -> Result<(Decimal, Decimal, i64)> {
        let adjustments = self.store.adjustments_for(settlement.settlement_id)?;

        let mut volume = settlement.volume;
        let mut fees = settlement.fee_revenue;
        let mut trades = settlement.trade_count as i64;
        for adjustment in &adjustments {
            volume += adjustment.volume_delta;
            fees += adjustment.fee_delta;
            trades += adjustment.trade_count_delta;
        }
        Ok((volume, fees, trades))
    }
}
