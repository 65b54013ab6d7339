//! Double-entry validation
//!
//! Recomputes buyer/seller flows and fee sums independently from the raw
//! trade and fee rows and compares them against each other and against the
//! aggregated settlement totals. The validator is a detector of
//! already-committed drift, not a preventer: it never mutates the
//! settlement record - callers transition status via
//! [`update_validation_status`].

use crate::{
    audit::AuditTrail,
    store::SettlementStore,
    types::{AuditAction, Settlement, SettlementKind, SettlementScope, ValidationStatus},
    Config, Error, Result,
};
use chrono::{NaiveDate, Utc};
use ledger_core::types::OrderSide;
use ledger_core::Storage;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One double-entry check with its numeric delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    /// Check name
    pub name: String,

    /// Whether the delta is within tolerance
    pub passed: bool,

    /// Expected value (left-hand side)
    pub expected: Decimal,

    /// Actual value (right-hand side)
    pub actual: Decimal,

    /// Absolute difference
    pub delta: Decimal,
}

/// Summary totals reported for audit alongside the checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    /// Notional recomputed from the buyer side of the trade rows
    pub buyer_notional: Decimal,

    /// Notional recomputed from the sell-side fee rows
    pub seller_notional: Decimal,

    /// Fee total recomputed from the raw fee rows
    pub fee_total: Decimal,

    /// Volume as aggregated into the settlement
    pub aggregated_volume: Decimal,

    /// Fee revenue as aggregated into the settlement
    pub aggregated_fees: Decimal,

    /// Sum of all account balances (available + locked) across assets.
    /// Report-only: full inflow/outflow reconciliation needs
    /// deposit/withdrawal tracking outside this core.
    pub system_balance_total: Decimal,
}

/// Result of validating one settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Validated date
    pub date: NaiveDate,

    /// `Validated` when every check passed, `Failed` otherwise
    pub status: ValidationStatus,

    /// All checks, passed and failed
    pub checks: Vec<ValidationCheck>,

    /// Summary totals
    pub summary: ValidationSummary,
}

impl ValidationReport {
    /// The failed checks only
    pub fn mismatches(&self) -> Vec<&ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }
}

/// Double-entry validator
pub struct DoubleEntryValidator {
    ledger: Arc<Storage>,
    store: Arc<SettlementStore>,
    config: Config,
}

impl DoubleEntryValidator {
    /// Create validator over the ledger and settlement stores
    pub fn new(ledger: Arc<Storage>, store: Arc<SettlementStore>, config: Config) -> Self {
        Self {
            ledger,
            store,
            config,
        }
    }

    /// Validate the daily settlement for `date`
    ///
    /// A mismatch is a normal, reportable outcome (`Failed` status with
    /// itemized deltas), not an error; errors mean the validation itself
    /// could not run.
    pub fn validate(&self, date: NaiveDate) -> Result<ValidationReport> {
        let settlement = self
            .store
            .get_settlement(date, SettlementKind::Daily, &SettlementScope::All)?
            .ok_or_else(|| Error::SettlementNotFound(date.to_string()))?;

        let (start, end) = self.config.day_window_nanos(date)?;
        let trades = self.ledger.trades_in_window(start, end)?;
        let fees = self.ledger.fees_in_window(start, end)?;

        // Independent recomputation of both flows: the buyer side from the
        // trade rows, the seller side from the sell-side fee rows, which
        // carry the notional each seller received as separately written
        // records. A trade missing its seller fee row, or a drifted
        // notional on either row, breaks the symmetry.
        let mut buyer_notional = Decimal::ZERO;
        for trade in &trades {
            buyer_notional += trade.price * trade.amount;
        }
        let seller_notional: Decimal = fees
            .iter()
            .filter(|f| f.side == OrderSide::Sell)
            .map(|f| f.notional)
            .sum();

        let buyer_fees: Decimal = fees
            .iter()
            .filter(|f| f.side == OrderSide::Buy)
            .map(|f| f.amount)
            .sum();
        let seller_fees: Decimal = fees
            .iter()
            .filter(|f| f.side == OrderSide::Sell)
            .map(|f| f.amount)
            .sum();
        let fee_total: Decimal = fees.iter().map(|f| f.amount).sum();

        let system_balance_total: Decimal = self
            .ledger
            .all_balances()?
            .iter()
            .map(|b| b.total())
            .sum();

        let epsilon = self.config.validation_epsilon;
        let checks = vec![
            check("trade_symmetry", buyer_notional, seller_notional, epsilon),
            check(
                "volume_consistency",
                buyer_notional,
                settlement.volume,
                epsilon,
            ),
            check("fee_symmetry", buyer_fees + seller_fees, fee_total, epsilon),
            check(
                "fee_consistency",
                fee_total,
                settlement.fee_revenue,
                epsilon,
            ),
        ];

        let status = if checks.iter().all(|c| c.passed) {
            ValidationStatus::Validated
        } else {
            ValidationStatus::Failed
        };

        let report = ValidationReport {
            date,
            status,
            checks,
            summary: ValidationSummary {
                buyer_notional,
                seller_notional,
                fee_total,
                aggregated_volume: settlement.volume,
                aggregated_fees: settlement.fee_revenue,
                system_balance_total,
            },
        };

        for mismatch in report.mismatches() {
            tracing::warn!(
                %date,
                check = %mismatch.name,
                expected = %mismatch.expected,
                actual = %mismatch.actual,
                delta = %mismatch.delta,
                "Double-entry mismatch"
            );
        }

        tracing::info!(
            %date,
            status = ?report.status,
            system_balance_total = %report.summary.system_balance_total,
            fee_total = %report.summary.fee_total,
            "Validation complete"
        );

        Ok(report)
    }
}

fn check(name: &str, expected: Decimal, actual: Decimal, epsilon: Decimal) -> ValidationCheck {
    let delta = (expected - actual).abs();
    ValidationCheck {
        name: name.to_string(),
        passed: delta <= epsilon,
        expected,
        actual,
        delta,
    }
}

/// Transition a settlement's validation status, with audit
///
/// Transitioning to `Validated` from a state other than
/// `Calculated`/`Validating` is logged as an out-of-order transition but
/// not blocked: a soft invariant.
pub fn update_validation_status(
    store: &SettlementStore,
    audit: &AuditTrail,
    date: NaiveDate,
    kind: SettlementKind,
    new_status: ValidationStatus,
    actor: &str,
) -> Result<Settlement> {
    let mut settlement = store
        .get_settlement(date, kind, &SettlementScope::All)?
        .ok_or_else(|| Error::SettlementNotFound(date.to_string()))?;

    let old_status = settlement.status;
    if new_status == ValidationStatus::Validated
        && !matches!(
            old_status,
            ValidationStatus::Calculated | ValidationStatus::Validating
        )
    {
        tracing::warn!(
            %date,
            from = ?old_status,
            to = ?new_status,
            "Out-of-order validation status transition"
        );
    }

    settlement.status = new_status;
    settlement.updated_at = Utc::now();
    store.put_settlement(&settlement)?;

    audit.record(
        settlement.settlement_id,
        date,
        AuditAction::ValidationStatusChanged,
        actor,
        Some(serde_json::json!({ "status": format!("{:?}", old_status) })),
        Some(serde_json::json!({ "status": format!("{:?}", new_status) })),
    )?;

    Ok(settlement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::SettlementAggregator;
    use ledger_core::types::{AccountId, Asset, AssetPair, Fee, Trade};
    use ledger_core::FeeSchedule;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    struct Fixture {
        validator: DoubleEntryValidator,
        aggregator: SettlementAggregator,
        ledger: Arc<Storage>,
        store: Arc<SettlementStore>,
        audit: AuditTrail,
        _temp: TempDir,
    }

    fn setup() -> Fixture {
        let temp = TempDir::new().unwrap();

        let mut ledger_config = ledger_core::Config::default();
        ledger_config.data_dir = temp.path().join("ledger");
        let ledger = Arc::new(Storage::open(&ledger_config).unwrap());

        let mut config = Config::default();
        config.data_dir = temp.path().join("settlement");
        let store = Arc::new(SettlementStore::open(&config).unwrap());

        Fixture {
            validator: DoubleEntryValidator::new(ledger.clone(), store.clone(), config.clone()),
            aggregator: SettlementAggregator::new(ledger.clone(), store.clone(), config),
            audit: AuditTrail::new(store.clone()),
            ledger,
            store,
            _temp: temp,
        }
    }

    fn seed_trade(ledger: &Storage, price: &str, amount: &str, ts: i64) {
        let trade = Trade {
            event_id: Uuid::now_v7(),
            buy_order_id: Uuid::new_v4(),
            sell_order_id: Uuid::new_v4(),
            buyer_id: AccountId::new("a"),
            seller_id: AccountId::new("b"),
            pair: AssetPair::new(Asset::new("BTC"), Asset::new("USD")),
            price: dec(price),
            amount: dec(amount),
            timestamp_nanos: ts,
        };
        let schedule = FeeSchedule::default();
        let buyer_fee = schedule.fee_for(&trade, OrderSide::Buy, &trade.buyer_id);
        let seller_fee = schedule.fee_for(&trade, OrderSide::Sell, &trade.seller_id);
        ledger
            .commit_trade(&trade, &[], &[], &[], &[&buyer_fee, &seller_fee])
            .unwrap();
    }

    fn noon(date: NaiveDate) -> i64 {
        date.and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_nanos_opt()
            .unwrap()
    }

    #[test]
    fn test_consistent_day_validates() {
        let fixture = setup();
        let date: NaiveDate = "2024-03-15".parse().unwrap();

        seed_trade(&fixture.ledger, "100", "10", noon(date));
        seed_trade(&fixture.ledger, "50", "4", noon(date) + 1);
        fixture.aggregator.create_daily_settlement(date, false).unwrap();

        let report = fixture.validator.validate(date).unwrap();
        assert_eq!(report.status, ValidationStatus::Validated);
        assert!(report.mismatches().is_empty());
        assert_eq!(report.summary.buyer_notional, dec("1200"));
        assert_eq!(report.summary.buyer_notional, report.summary.seller_notional);
    }

    #[test]
    fn test_missing_seller_fee_breaks_trade_symmetry() {
        let fixture = setup();
        let date: NaiveDate = "2024-03-15".parse().unwrap();

        seed_trade(&fixture.ledger, "100", "10", noon(date));

        // A trade committed without its seller fee row: the buyer side sees
        // the notional, the seller side never records receiving it.
        let trade = Trade {
            event_id: Uuid::now_v7(),
            buy_order_id: Uuid::new_v4(),
            sell_order_id: Uuid::new_v4(),
            buyer_id: AccountId::new("a"),
            seller_id: AccountId::new("b"),
            pair: AssetPair::new(Asset::new("BTC"), Asset::new("USD")),
            price: dec("50"),
            amount: dec("4"),
            timestamp_nanos: noon(date) + 1,
        };
        let schedule = FeeSchedule::default();
        let buyer_fee = schedule.fee_for(&trade, OrderSide::Buy, &trade.buyer_id);
        fixture
            .ledger
            .commit_trade(&trade, &[], &[], &[], &[&buyer_fee])
            .unwrap();

        fixture.aggregator.create_daily_settlement(date, false).unwrap();

        let report = fixture.validator.validate(date).unwrap();
        assert_eq!(report.status, ValidationStatus::Failed);

        let mismatches = report.mismatches();
        assert!(mismatches.iter().any(|c| c.name == "trade_symmetry"));
        // The missing seller leg is exactly the second trade's notional
        assert_eq!(report.summary.buyer_notional, dec("1200"));
        assert_eq!(report.summary.seller_notional, dec("1000"));
    }

    #[test]
    fn test_drifted_totals_fail_with_deltas() {
        let fixture = setup();
        let date: NaiveDate = "2024-03-15".parse().unwrap();

        seed_trade(&fixture.ledger, "100", "10", noon(date));
        let mut settlement = fixture
            .aggregator
            .create_daily_settlement(date, false)
            .unwrap();

        // Corrupt the aggregated volume to simulate drift
        settlement.volume += dec("7");
        fixture.store.put_settlement(&settlement).unwrap();

        let report = fixture.validator.validate(date).unwrap();
        assert_eq!(report.status, ValidationStatus::Failed);

        let mismatches = report.mismatches();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].name, "volume_consistency");
        assert_eq!(mismatches[0].delta, dec("7"));
    }

    #[test]
    fn test_extra_fee_row_breaks_fee_consistency() {
        let fixture = setup();
        let date: NaiveDate = "2024-03-15".parse().unwrap();

        seed_trade(&fixture.ledger, "100", "10", noon(date));
        fixture.aggregator.create_daily_settlement(date, false).unwrap();

        // A fee row written after aggregation drifts the fee totals
        let stray = Fee {
            trade_id: Uuid::now_v7(),
            account_id: AccountId::new("a"),
            side: OrderSide::Buy,
            rate: dec("0.001"),
            amount: dec("5"),
            asset: Asset::new("USD"),
            notional: dec("5000"),
            timestamp_nanos: noon(date) + 2,
        };
        let trade = Trade {
            event_id: stray.trade_id,
            buy_order_id: Uuid::new_v4(),
            sell_order_id: Uuid::new_v4(),
            buyer_id: AccountId::new("a"),
            seller_id: AccountId::new("b"),
            pair: AssetPair::new(Asset::new("BTC"), Asset::new("USD")),
            price: dec("100"),
            amount: dec("50"),
            timestamp_nanos: noon(date) + 2,
        };
        fixture
            .ledger
            .commit_trade(&trade, &[], &[], &[], &[&stray])
            .unwrap();

        let report = fixture.validator.validate(date).unwrap();
        assert_eq!(report.status, ValidationStatus::Failed);
        assert!(report
            .mismatches()
            .iter()
            .any(|c| c.name == "fee_consistency"));
    }

    #[test]
    fn test_validation_never_mutates_settlement() {
        let fixture = setup();
        let date: NaiveDate = "2024-03-15".parse().unwrap();

        seed_trade(&fixture.ledger, "100", "10", noon(date));
        let before = fixture
            .aggregator
            .create_daily_settlement(date, false)
            .unwrap();

        fixture.validator.validate(date).unwrap();

        let after = fixture
            .store
            .get_settlement(date, SettlementKind::Daily, &SettlementScope::All)
            .unwrap()
            .unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn test_status_transition_with_audit() {
        let fixture = setup();
        let date: NaiveDate = "2024-03-15".parse().unwrap();

        seed_trade(&fixture.ledger, "100", "10", noon(date));
        fixture.aggregator.create_daily_settlement(date, false).unwrap();

        let updated = update_validation_status(
            &fixture.store,
            &fixture.audit,
            date,
            SettlementKind::Daily,
            ValidationStatus::Validating,
            "runner",
        )
        .unwrap();
        assert_eq!(updated.status, ValidationStatus::Validating);

        let records = fixture.store.audit_for(updated.settlement_id).unwrap();
        assert!(records
            .iter()
            .any(|r| r.action == AuditAction::ValidationStatusChanged));
    }
}
