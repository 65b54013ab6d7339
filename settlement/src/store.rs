//! Settlement-side storage using RocksDB
//!
//! # Column Families
//!
//! - `settlements` - Settlement rows (key: date|kind|scope)
//! - `user_settlements` - Per-account rows (key: date|kind|account)
//! - `items` - Per-trade settlement items (key: settlement_id || item_id)
//! - `adjustments` - Adjustment rows (key: settlement_id || adjustment_id)
//! - `runs` - Pipeline runs (key: date)
//! - `failures` - Granular failure records (key: date || failure_id)
//! - `audit` - Append-only audit trail (key: settlement_id || audit_id)
//! - `balance_snapshots` - Frozen balances (key: date|account|asset)
//! - `position_snapshots` - Frozen positions (key: date|account|pair)

use crate::{
    error::{Error, Result},
    types::{
        AuditRecord, BalanceSnapshot, PositionSnapshot, Settlement, SettlementAdjustment,
        SettlementFailure, SettlementItem, SettlementKind, SettlementRun, SettlementScope,
        UserSettlement,
    },
    Config,
};
use chrono::NaiveDate;
use ledger_core::types::AccountId;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_SETTLEMENTS: &str = "settlements";
const CF_USER_SETTLEMENTS: &str = "user_settlements";
const CF_ITEMS: &str = "items";
const CF_ADJUSTMENTS: &str = "adjustments";
const CF_RUNS: &str = "runs";
const CF_FAILURES: &str = "failures";
const CF_AUDIT: &str = "audit";
const CF_BALANCE_SNAPSHOTS: &str = "balance_snapshots";
const CF_POSITION_SNAPSHOTS: &str = "position_snapshots";

/// Storage wrapper for the settlement RocksDB
pub struct SettlementStore {
    db: Arc<DB>,
}

impl SettlementStore {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_SETTLEMENTS, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_USER_SETTLEMENTS, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_ITEMS, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_ADJUSTMENTS, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_RUNS, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_FAILURES, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_AUDIT, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_BALANCE_SNAPSHOTS, Self::cf_options()),
            ColumnFamilyDescriptor::new(CF_POSITION_SNAPSHOTS, Self::cf_options()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!("Opened settlement RocksDB at {:?}", path);

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_options() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Key helpers

    fn date_segment(date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    fn settlement_key(date: NaiveDate, kind: SettlementKind, scope: &SettlementScope) -> Vec<u8> {
        format!(
            "{}|{}|{}",
            Self::date_segment(date),
            kind as u8,
            scope.key_segment()
        )
        .into_bytes()
    }

    fn user_settlement_key(date: NaiveDate, kind: SettlementKind, account: &AccountId) -> Vec<u8> {
        format!(
            "{}|{}|{}",
            Self::date_segment(date),
            kind as u8,
            account.as_str()
        )
        .into_bytes()
    }

    fn child_key(parent: &Uuid, child: &Uuid) -> Vec<u8> {
        let mut key = parent.as_bytes().to_vec();
        key.extend_from_slice(child.as_bytes());
        key
    }

    fn dated_key(date: NaiveDate, id: &Uuid) -> Vec<u8> {
        let mut key = Self::date_segment(date).into_bytes();
        key.push(b'|');
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Scan all rows under a key prefix
    fn scan_prefix<T: DeserializeOwned>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    fn prefix_is_empty(&self, cf_name: &str, prefix: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(cf_name)?;
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(!key.starts_with(prefix))
            }
            None => Ok(true),
        }
    }

    // Settlement operations

    /// Put settlement row
    pub fn put_settlement(&self, settlement: &Settlement) -> Result<()> {
        let cf = self.cf_handle(CF_SETTLEMENTS)?;
        let key = Self::settlement_key(settlement.date, settlement.kind, &settlement.scope);
        let value = bincode::serialize(settlement)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// Get settlement by (date, kind, scope)
    pub fn get_settlement(
        &self,
        date: NaiveDate,
        kind: SettlementKind,
        scope: &SettlementScope,
    ) -> Result<Option<Settlement>> {
        let cf = self.cf_handle(CF_SETTLEMENTS)?;
        let key = Self::settlement_key(date, kind, scope);
        match self.db.get_cf(cf, &key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Destroy a settlement and its dependent items, adjustments and audit
    /// rows; the only destructive path in the pipeline, used by explicit
    /// force-recreate only. Returns the number of rows deleted.
    pub fn delete_settlement_cascade(&self, settlement: &Settlement) -> Result<usize> {
        let mut batch = WriteBatch::default();
        let mut deleted = 1usize;

        let cf_settlements = self.cf_handle(CF_SETTLEMENTS)?;
        batch.delete_cf(
            cf_settlements,
            Self::settlement_key(settlement.date, settlement.kind, &settlement.scope),
        );

        let cf_items = self.cf_handle(CF_ITEMS)?;
        deleted += self.delete_prefix(&mut batch, cf_items, settlement.settlement_id.as_bytes())?;

        let cf_adjustments = self.cf_handle(CF_ADJUSTMENTS)?;
        deleted +=
            self.delete_prefix(&mut batch, cf_adjustments, settlement.settlement_id.as_bytes())?;

        // Audit rows are keyed by settlement_id, so only the destroyed
        // settlement's trail goes with it; records for other settlements
        // on the same date survive.
        let cf_audit = self.cf_handle(CF_AUDIT)?;
        deleted += self.delete_prefix(&mut batch, cf_audit, settlement.settlement_id.as_bytes())?;

        self.db.write(batch)?;

        tracing::warn!(
            settlement_id = %settlement.settlement_id,
            date = %settlement.date,
            rows = deleted,
            "Settlement destroyed for forced recreation"
        );

        Ok(deleted)
    }

    fn delete_prefix(
        &self,
        batch: &mut WriteBatch,
        cf: &ColumnFamily,
        prefix: &[u8],
    ) -> Result<usize> {
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut count = 0usize;
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }
        Ok(count)
    }

    // User settlement operations

    /// Put per-account settlement row
    pub fn put_user_settlement(&self, row: &UserSettlement) -> Result<()> {
        let cf = self.cf_handle(CF_USER_SETTLEMENTS)?;
        let key = Self::user_settlement_key(row.date, row.kind, &row.account_id);
        let value = bincode::serialize(row)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// Get per-account settlement row
    pub fn get_user_settlement(
        &self,
        date: NaiveDate,
        kind: SettlementKind,
        account: &AccountId,
    ) -> Result<Option<UserSettlement>> {
        let cf = self.cf_handle(CF_USER_SETTLEMENTS)?;
        let key = Self::user_settlement_key(date, kind, account);
        match self.db.get_cf(cf, &key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// All per-account rows for a (date, kind)
    pub fn user_settlements_for(
        &self,
        date: NaiveDate,
        kind: SettlementKind,
    ) -> Result<Vec<UserSettlement>> {
        let prefix = format!("{}|{}|", Self::date_segment(date), kind as u8).into_bytes();
        self.scan_prefix(CF_USER_SETTLEMENTS, &prefix)
    }

    // Settlement item operations

    /// Put per-trade settlement item
    pub fn put_item(&self, item: &SettlementItem) -> Result<()> {
        let cf = self.cf_handle(CF_ITEMS)?;
        let key = Self::child_key(&item.settlement_id, &item.item_id);
        let value = bincode::serialize(item)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// All items for a settlement
    pub fn items_for(&self, settlement_id: Uuid) -> Result<Vec<SettlementItem>> {
        self.scan_prefix(CF_ITEMS, settlement_id.as_bytes())
    }

    // Adjustment operations

    /// Put adjustment row (append-only)
    pub fn put_adjustment(&self, adjustment: &SettlementAdjustment) -> Result<()> {
        let cf = self.cf_handle(CF_ADJUSTMENTS)?;
        let key = Self::child_key(&adjustment.settlement_id, &adjustment.adjustment_id);
        let value = bincode::serialize(adjustment)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// All adjustments for a settlement, oldest first
    pub fn adjustments_for(&self, settlement_id: Uuid) -> Result<Vec<SettlementAdjustment>> {
        // adjustment_id is a UUIDv7, so key order is creation order
        self.scan_prefix(CF_ADJUSTMENTS, settlement_id.as_bytes())
    }

    // Run operations

    /// Put run row (one per date; re-invocations update it)
    pub fn put_run(&self, run: &SettlementRun) -> Result<()> {
        let cf = self.cf_handle(CF_RUNS)?;
        let key = Self::date_segment(run.date).into_bytes();
        let value = bincode::serialize(run)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// Get run row for a date
    pub fn get_run(&self, date: NaiveDate) -> Result<Option<SettlementRun>> {
        let cf = self.cf_handle(CF_RUNS)?;
        let key = Self::date_segment(date).into_bytes();
        match self.db.get_cf(cf, &key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Failure operations

    /// Put granular failure record (append-only)
    pub fn put_failure(&self, failure: &SettlementFailure) -> Result<()> {
        let cf = self.cf_handle(CF_FAILURES)?;
        let key = Self::dated_key(failure.date, &failure.failure_id);
        let value = bincode::serialize(failure)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// All failures recorded for a date
    pub fn failures_for(&self, date: NaiveDate) -> Result<Vec<SettlementFailure>> {
        let mut prefix = Self::date_segment(date).into_bytes();
        prefix.push(b'|');
        self.scan_prefix(CF_FAILURES, &prefix)
    }

    // Audit operations

    /// Append audit record
    pub fn put_audit(&self, record: &AuditRecord) -> Result<()> {
        let cf = self.cf_handle(CF_AUDIT)?;
        let key = Self::child_key(&record.settlement_id, &record.audit_id);
        let value = bincode::serialize(record)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// All audit records for a settlement, oldest first
    pub fn audit_for(&self, settlement_id: Uuid) -> Result<Vec<AuditRecord>> {
        // audit_id is a UUIDv7, so key order is recording order
        self.scan_prefix(CF_AUDIT, settlement_id.as_bytes())
    }

    // Snapshot operations

    /// Put frozen balance row
    pub fn put_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let cf = self.cf_handle(CF_BALANCE_SNAPSHOTS)?;
        let key = format!(
            "{}|{}|{}",
            Self::date_segment(snapshot.date),
            snapshot.account_id.as_str(),
            snapshot.asset
        )
        .into_bytes();
        let value = bincode::serialize(snapshot)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// Whether any balance snapshot exists for a date
    pub fn has_balance_snapshots(&self, date: NaiveDate) -> Result<bool> {
        let mut prefix = Self::date_segment(date).into_bytes();
        prefix.push(b'|');
        Ok(!self.prefix_is_empty(CF_BALANCE_SNAPSHOTS, &prefix)?)
    }

    /// All balance snapshots for a date
    pub fn balance_snapshots_for(&self, date: NaiveDate) -> Result<Vec<BalanceSnapshot>> {
        let mut prefix = Self::date_segment(date).into_bytes();
        prefix.push(b'|');
        self.scan_prefix(CF_BALANCE_SNAPSHOTS, &prefix)
    }

    /// Put frozen position row
    pub fn put_position_snapshot(&self, snapshot: &PositionSnapshot) -> Result<()> {
        let cf = self.cf_handle(CF_POSITION_SNAPSHOTS)?;
        let key = format!(
            "{}|{}|{}",
            Self::date_segment(snapshot.date),
            snapshot.account_id.as_str(),
            snapshot.pair.symbol()
        )
        .into_bytes();
        let value = bincode::serialize(snapshot)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// Whether any position snapshot exists for a date
    pub fn has_position_snapshots(&self, date: NaiveDate) -> Result<bool> {
        let mut prefix = Self::date_segment(date).into_bytes();
        prefix.push(b'|');
        Ok(!self.prefix_is_empty(CF_POSITION_SNAPSHOTS, &prefix)?)
    }

    /// All position snapshots for a date
    pub fn position_snapshots_for(&self, date: NaiveDate) -> Result<Vec<PositionSnapshot>> {
        let mut prefix = Self::date_segment(date).into_bytes();
        prefix.push(b'|');
        self.scan_prefix(CF_POSITION_SNAPSHOTS, &prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunStatus, ValidationStatus};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_store() -> (SettlementStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (SettlementStore::open(&config).unwrap(), temp_dir)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn test_settlement(d: &str) -> Settlement {
        Settlement {
            settlement_id: Uuid::new_v4(),
            date: date(d),
            kind: SettlementKind::Daily,
            scope: SettlementScope::All,
            trade_count: 5,
            volume: Decimal::new(100_000, 2),
            fee_revenue: Decimal::new(100, 2),
            user_count: 3,
            status: ValidationStatus::Calculated,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_settlement_roundtrip() {
        let (store, _temp) = test_store();
        let settlement = test_settlement("2024-03-15");

        store.put_settlement(&settlement).unwrap();

        let retrieved = store
            .get_settlement(date("2024-03-15"), SettlementKind::Daily, &SettlementScope::All)
            .unwrap()
            .unwrap();
        assert_eq!(retrieved.settlement_id, settlement.settlement_id);
        assert_eq!(retrieved.volume, settlement.volume);

        // Different kind is a different record
        assert!(store
            .get_settlement(date("2024-03-15"), SettlementKind::Monthly, &SettlementScope::All)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_items_scanned_by_settlement() {
        let (store, _temp) = test_store();
        let settlement = test_settlement("2024-03-15");
        let other = test_settlement("2024-03-16");

        for _ in 0..3 {
            store
                .put_item(&SettlementItem {
                    item_id: Uuid::now_v7(),
                    settlement_id: settlement.settlement_id,
                    trade_id: Uuid::now_v7(),
                    volume: Decimal::new(1000, 2),
                    buyer_fee: Decimal::ONE,
                    seller_fee: Decimal::ONE,
                })
                .unwrap();
        }
        store
            .put_item(&SettlementItem {
                item_id: Uuid::now_v7(),
                settlement_id: other.settlement_id,
                trade_id: Uuid::now_v7(),
                volume: Decimal::new(1000, 2),
                buyer_fee: Decimal::ONE,
                seller_fee: Decimal::ONE,
            })
            .unwrap();

        assert_eq!(store.items_for(settlement.settlement_id).unwrap().len(), 3);
        assert_eq!(store.items_for(other.settlement_id).unwrap().len(), 1);
    }

    #[test]
    fn test_cascade_delete() {
        let (store, _temp) = test_store();
        let settlement = test_settlement("2024-03-15");
        store.put_settlement(&settlement).unwrap();

        store
            .put_item(&SettlementItem {
                item_id: Uuid::now_v7(),
                settlement_id: settlement.settlement_id,
                trade_id: Uuid::now_v7(),
                volume: Decimal::ONE,
                buyer_fee: Decimal::ZERO,
                seller_fee: Decimal::ZERO,
            })
            .unwrap();
        store
            .put_audit(&AuditRecord {
                audit_id: Uuid::now_v7(),
                settlement_id: settlement.settlement_id,
                date: settlement.date,
                action: crate::types::AuditAction::SettlementCreated,
                actor: "test".to_string(),
                before: None,
                after: None,
                recorded_at: Utc::now(),
            })
            .unwrap();

        // A record for another settlement on the same date must survive
        let other = test_settlement("2024-03-15");
        store
            .put_audit(&AuditRecord {
                audit_id: Uuid::now_v7(),
                settlement_id: other.settlement_id,
                date: other.date,
                action: crate::types::AuditAction::SettlementCreated,
                actor: "test".to_string(),
                before: None,
                after: None,
                recorded_at: Utc::now(),
            })
            .unwrap();

        let deleted = store.delete_settlement_cascade(&settlement).unwrap();
        assert_eq!(deleted, 3); // settlement + 1 item + 1 audit row

        assert!(store
            .get_settlement(settlement.date, settlement.kind, &settlement.scope)
            .unwrap()
            .is_none());
        assert!(store.items_for(settlement.settlement_id).unwrap().is_empty());
        assert!(store.audit_for(settlement.settlement_id).unwrap().is_empty());
        assert_eq!(store.audit_for(other.settlement_id).unwrap().len(), 1);
    }

    #[test]
    fn test_run_resume_roundtrip() {
        let (store, _temp) = test_store();

        let mut run = SettlementRun {
            run_id: Uuid::now_v7(),
            date: date("2024-03-15"),
            attempt: 1,
            last_completed_step: 2,
            status: RunStatus::Failed,
            failed_accounts: vec![AccountId::new("acct-1")],
            started_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.put_run(&run).unwrap();

        let loaded = store.get_run(date("2024-03-15")).unwrap().unwrap();
        assert_eq!(loaded.last_completed_step, 2);
        assert_eq!(loaded.status, RunStatus::Failed);

        // Re-invocation updates the same row
        run.attempt = 2;
        run.status = RunStatus::Completed;
        run.last_completed_step = 4;
        store.put_run(&run).unwrap();

        let loaded = store.get_run(date("2024-03-15")).unwrap().unwrap();
        assert_eq!(loaded.attempt, 2);
        assert_eq!(loaded.status, RunStatus::Completed);
    }

    #[test]
    fn test_snapshot_presence_check() {
        let (store, _temp) = test_store();
        let d = date("2024-03-15");

        assert!(!store.has_balance_snapshots(d).unwrap());

        store
            .put_balance_snapshot(&BalanceSnapshot {
                account_id: AccountId::new("acct-1"),
                asset: "USD".to_string(),
                date: d,
                available: Decimal::new(1000, 2),
                locked: Decimal::ZERO,
                captured_at: Utc::now(),
            })
            .unwrap();

        assert!(store.has_balance_snapshots(d).unwrap());
        // Neighboring date unaffected
        assert!(!store.has_balance_snapshots(date("2024-03-16")).unwrap());
        assert_eq!(store.balance_snapshots_for(d).unwrap().len(), 1);
    }
}
