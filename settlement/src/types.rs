//! Core types for the settlement pipeline

use chrono::{DateTime, NaiveDate, Utc};
use ledger_core::types::{AccountId, AssetPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Settlement kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SettlementKind {
    /// One business day
    Daily = 1,
    /// One calendar month (keyed by its first day)
    Monthly = 2,
}

/// Settlement scope: the whole venue or one asset pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementScope {
    /// All pairs
    All,
    /// One pair, by canonical symbol
    Pair(String),
}

impl SettlementScope {
    /// Storage key segment
    pub fn key_segment(&self) -> &str {
        match self {
            SettlementScope::All => "ALL",
            SettlementScope::Pair(symbol) => symbol,
        }
    }
}

/// Validation status state machine
///
/// `Calculating -> Calculated -> Validating -> {Validated | Failed} -> Adjusted`.
/// `Adjusted` is entered only via the adjustment ledger, from any
/// post-`Calculated` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValidationStatus {
    /// Aggregation in progress
    Calculating = 1,
    /// Aggregation complete
    Calculated = 2,
    /// Validation in progress
    Validating = 3,
    /// Double-entry checks passed
    Validated = 4,
    /// Double-entry checks found mismatches
    Failed = 5,
    /// Corrected via the adjustment ledger
    Adjusted = 6,
}

impl ValidationStatus {
    /// Whether aggregation has completed
    pub fn is_post_calculated(&self) -> bool {
        !matches!(self, ValidationStatus::Calculating)
    }
}

/// Aggregated settlement record
///
/// One record per (date, kind, scope). Totals are never mutated after
/// calculation; corrections layer on as adjustments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    /// Settlement ID
    pub settlement_id: Uuid,

    /// Key date (first of month for monthly settlements)
    pub date: NaiveDate,

    /// Kind
    pub kind: SettlementKind,

    /// Scope
    pub scope: SettlementScope,

    /// Number of trades in the window
    pub trade_count: u64,

    /// Notional volume (sum of price * amount)
    pub volume: Decimal,

    /// Fee revenue (sum of fee amounts, both sides)
    pub fee_revenue: Decimal,

    /// Distinct participants (buyers union sellers)
    pub user_count: u64,

    /// Validation status
    pub status: ValidationStatus,

    /// Version, bumped on recreation and adjustment
    pub version: u32,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Per-account settlement record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettlement {
    /// Record ID
    pub user_settlement_id: Uuid,

    /// Account
    pub account_id: AccountId,

    /// Key date
    pub date: NaiveDate,

    /// Kind
    pub kind: SettlementKind,

    /// Trades the account took part in
    pub trade_count: u64,

    /// Notional volume across those trades
    pub volume: Decimal,

    /// Fees the account paid
    pub fee_paid: Decimal,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Immutable per-trade settlement item, written for audit/reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementItem {
    /// Item ID
    pub item_id: Uuid,

    /// Owning settlement
    pub settlement_id: Uuid,

    /// Trade (execution event ID)
    pub trade_id: Uuid,

    /// Trade notional
    pub volume: Decimal,

    /// Buyer-side fee for this trade
    pub buyer_fee: Decimal,

    /// Seller-side fee for this trade
    pub seller_fee: Decimal,
}

/// Adjustment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AdjustmentKind {
    /// Operator-entered correction
    ManualCorrection = 1,
    /// Fee recomputation after a schedule fix
    FeeRecalculation = 2,
    /// Busted trade backed out of the totals
    TradeBust = 3,
}

/// Non-destructive correction layered on a finalized settlement
///
/// Original totals are never mutated; the effective value of a settlement
/// is original plus the sum of its adjustments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementAdjustment {
    /// Adjustment ID
    pub adjustment_id: Uuid,

    /// Adjusted settlement
    pub settlement_id: Uuid,

    /// Settlement key date
    pub date: NaiveDate,

    /// Kind
    pub kind: AdjustmentKind,

    /// Human-readable reason
    pub reason: String,

    /// Actor who applied it
    pub actor: String,

    /// Volume delta
    pub volume_delta: Decimal,

    /// Fee delta
    pub fee_delta: Decimal,

    /// Trade-count delta
    pub trade_count_delta: i64,

    /// Effective totals before this adjustment, as compact JSON text
    /// (bincode rows cannot hold self-describing values)
    pub before: String,

    /// Effective totals after this adjustment, as compact JSON text
    pub after: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// A settlement with its adjustments folded in, computed on read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustedSettlement {
    /// The original record, totals untouched
    pub settlement: Settlement,

    /// All adjustments, oldest first
    pub adjustments: Vec<SettlementAdjustment>,

    /// Effective volume (original + deltas)
    pub effective_volume: Decimal,

    /// Effective fee revenue
    pub effective_fee_revenue: Decimal,

    /// Effective trade count
    pub effective_trade_count: i64,
}

/// Terminal and in-flight run states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunStatus {
    /// Pipeline executing
    Running = 1,
    /// All steps complete
    Completed = 2,
    /// A fatal step failed; re-invocation resumes
    Failed = 3,
    /// Run-level retries exhausted; operational attention needed
    RetriesExhausted = 4,
}

/// One settlement pipeline execution for a date
///
/// Tracks the highest completed step so a crashed run resumes from the
/// next incomplete step instead of restarting from zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRun {
    /// Run ID
    pub run_id: Uuid,

    /// Settled date
    pub date: NaiveDate,

    /// Invocation attempt count
    pub attempt: u32,

    /// Highest completed step (0 = none, 4 = all)
    pub last_completed_step: u8,

    /// Status
    pub status: RunStatus,

    /// Accounts whose per-user aggregation failed this attempt
    pub failed_accounts: Vec<AccountId>,

    /// Started timestamp
    pub started_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Granular failure record behind a run's summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementFailure {
    /// Failure ID
    pub failure_id: Uuid,

    /// Settled date
    pub date: NaiveDate,

    /// Failed step (0 = run-level)
    pub step: u8,

    /// Failed account, if the failure was account-scoped
    pub account_id: Option<AccountId>,

    /// Error description
    pub error: String,

    /// Occurrence timestamp
    pub occurred_at: DateTime<Utc>,
}

/// Audited action on a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AuditAction {
    /// Settlement created
    SettlementCreated = 1,
    /// Prior settlement destroyed and recreated (force)
    SettlementRecreated = 2,
    /// Validation status transition
    ValidationStatusChanged = 3,
    /// Adjustment applied
    AdjustmentApplied = 4,
}

/// Append-only audit record for every mutating settlement action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record ID (UUIDv7, time-ordered)
    pub audit_id: Uuid,

    /// Settlement the action targeted
    pub settlement_id: Uuid,

    /// Settlement key date
    pub date: NaiveDate,

    /// Action
    pub action: AuditAction,

    /// Actor
    pub actor: String,

    /// State before the action, as compact JSON text
    pub before: Option<String>,

    /// State after the action, as compact JSON text
    pub after: Option<String>,

    /// Recorded timestamp
    pub recorded_at: DateTime<Utc>,
}

/// Frozen balance copy for one calendar date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Account
    pub account_id: AccountId,

    /// Asset symbol
    pub asset: String,

    /// Snapshot date
    pub date: NaiveDate,

    /// Available funds at capture
    pub available: Decimal,

    /// Locked funds at capture
    pub locked: Decimal,

    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
}

/// Frozen position copy for one calendar date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Account
    pub account_id: AccountId,

    /// Asset pair
    pub pair: AssetPair,

    /// Snapshot date
    pub date: NaiveDate,

    /// Position amount at capture
    pub amount: Decimal,

    /// Average entry price at capture
    pub avg_entry_price: Decimal,

    /// Mark price at capture
    pub mark_price: Decimal,

    /// Unrealized P&L at capture
    pub unrealized_pnl: Decimal,

    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
}

impl Settlement {
    /// Effective totals as structured data (used for adjustment audit)
    pub fn totals_json(
        volume: Decimal,
        fee_revenue: Decimal,
        trade_count: i64,
    ) -> serde_json::Value {
        serde_json::json!({
            "volume": volume.to_string(),
            "fee_revenue": fee_revenue.to_string(),
            "trade_count": trade_count,
        })
    }
}
