//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `orders` - Order rows (key: order_id)
//! - `trades` - Immutable trade rows (key: execution event_id)
//! - `balances` - Balance rows (key: account|asset)
//! - `positions` - Position rows (key: account|pair)
//! - `fees` - Fee rows (key: ts_nanos || trade_id || side), range-scannable
//! - `indices` - Trade time index (key: ts_nanos || event_id)
//!
//! One applied event = one `WriteBatch`: order, trade, balance, position and
//! fee writes commit together or not at all.

use crate::{
    error::{Error, Result},
    types::{AccountId, Asset, AssetPair, Balance, Fee, Order, OrderSide, Position, Trade},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ORDERS: &str = "orders";
const CF_TRADES: &str = "trades";
const CF_BALANCES: &str = "balances";
const CF_POSITIONS: &str = "positions";
const CF_FEES: &str = "fees";
const CF_INDICES: &str = "indices";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Universal compaction for write-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ORDERS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_TRADES, Self::cf_options_append_only()),
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_POSITIONS, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_FEES, Self::cf_options_append_only()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!("Opened ledger RocksDB at {:?}", path);

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_options_append_only() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_state() -> Options {
        let mut opts = Options::default();
        // State rows are frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Key helpers

    /// Order-preserving byte encoding for signed timestamps: flipping the
    /// sign bit makes unsigned byte order match numeric order.
    fn ts_bytes(timestamp_nanos: i64) -> [u8; 8] {
        (timestamp_nanos as u64 ^ (1 << 63)).to_be_bytes()
    }

    fn ts_from_bytes(bytes: &[u8]) -> i64 {
        let raw = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        (raw ^ (1 << 63)) as i64
    }

    fn balance_key(account_id: &AccountId, asset: &Asset) -> Vec<u8> {
        let mut key = account_id.as_str().as_bytes().to_vec();
        key.push(b'|');
        key.extend_from_slice(asset.as_str().as_bytes());
        key
    }

    fn position_key(account_id: &AccountId, pair: &AssetPair) -> Vec<u8> {
        let mut key = account_id.as_str().as_bytes().to_vec();
        key.push(b'|');
        key.extend_from_slice(pair.symbol().as_bytes());
        key
    }

    fn fee_key(timestamp_nanos: i64, trade_id: &Uuid, side: OrderSide) -> Vec<u8> {
        let mut key = Self::ts_bytes(timestamp_nanos).to_vec();
        key.extend_from_slice(trade_id.as_bytes());
        key.push(side as u8);
        key
    }

    fn trade_time_key(timestamp_nanos: i64, event_id: &Uuid) -> Vec<u8> {
        let mut key = Self::ts_bytes(timestamp_nanos).to_vec();
        key.extend_from_slice(event_id.as_bytes());
        key
    }

    // Order operations

    /// Put order (order creation happens outside this core; the applier
    /// mutates via the atomic commit paths)
    pub fn put_order(&self, order: &Order) -> Result<()> {
        let cf = self.cf_handle(CF_ORDERS)?;
        let value = bincode::serialize(order)?;
        self.db.put_cf(cf, order.order_id.as_bytes(), &value)?;
        Ok(())
    }

    /// Get order by ID
    pub fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let cf = self.cf_handle(CF_ORDERS)?;
        match self.db.get_cf(cf, order_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Trade operations

    /// Get trade by execution event ID
    pub fn get_trade(&self, event_id: Uuid) -> Result<Option<Trade>> {
        let cf = self.cf_handle(CF_TRADES)?;
        match self.db.get_cf(cf, event_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Whether a trade for this execution event is already recorded
    pub fn trade_exists(&self, event_id: Uuid) -> Result<bool> {
        let cf = self.cf_handle(CF_TRADES)?;
        Ok(self.db.get_cf(cf, event_id.as_bytes())?.is_some())
    }

    /// Scan trades in `[start_nanos, end_nanos]` via the time index
    pub fn trades_in_window(&self, start_nanos: i64, end_nanos: i64) -> Result<Vec<Trade>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let start_key = Self::ts_bytes(start_nanos);

        let iter = self.db.iterator_cf(
            cf_indices,
            IteratorMode::From(&start_key, Direction::Forward),
        );

        let mut trades = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if key.len() < 24 {
                continue;
            }

            let ts = Self::ts_from_bytes(&key);
            if ts > end_nanos {
                break;
            }

            let event_id_bytes: [u8; 16] = key[8..24].try_into().unwrap();
            let event_id = Uuid::from_bytes(event_id_bytes);
            let trade = self
                .get_trade(event_id)?
                .ok_or_else(|| Error::TradeNotFound(event_id.to_string()))?;
            trades.push(trade);
        }

        Ok(trades)
    }

    // Fee operations

    /// Scan all fee rows in `[start_nanos, end_nanos]` in one pass
    pub fn fees_in_window(&self, start_nanos: i64, end_nanos: i64) -> Result<Vec<Fee>> {
        let cf = self.cf_handle(CF_FEES)?;
        let start_key = Self::ts_bytes(start_nanos);

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut fees = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.len() < 8 {
                continue;
            }

            let ts = Self::ts_from_bytes(&key);
            if ts > end_nanos {
                break;
            }

            fees.push(bincode::deserialize(&value)?);
        }

        Ok(fees)
    }

    // Balance operations

    /// Put balance row
    pub fn put_balance(&self, balance: &Balance) -> Result<()> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let key = Self::balance_key(&balance.account_id, &balance.asset);
        let value = bincode::serialize(balance)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// Get balance row, if present
    pub fn get_balance(&self, account_id: &AccountId, asset: &Asset) -> Result<Option<Balance>> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let key = Self::balance_key(account_id, asset);
        match self.db.get_cf(cf, &key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get balance row, defaulting to a zero row
    pub fn get_balance_or_zero(&self, account_id: &AccountId, asset: &Asset) -> Result<Balance> {
        Ok(self
            .get_balance(account_id, asset)?
            .unwrap_or_else(|| Balance::zero(account_id.clone(), asset.clone())))
    }

    /// All balance rows (used by snapshots and system-wide totals)
    pub fn all_balances(&self) -> Result<Vec<Balance>> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);

        let mut balances = Vec::new();
        for item in iter {
            let (_, value) = item?;
            balances.push(bincode::deserialize(&value)?);
        }
        Ok(balances)
    }

    // Position operations

    /// Put position row
    pub fn put_position(&self, position: &Position) -> Result<()> {
        let cf = self.cf_handle(CF_POSITIONS)?;
        let key = Self::position_key(&position.account_id, &position.pair);
        let value = bincode::serialize(position)?;
        self.db.put_cf(cf, &key, &value)?;
        Ok(())
    }

    /// Get position row, defaulting to flat
    pub fn get_position_or_flat(
        &self,
        account_id: &AccountId,
        pair: &AssetPair,
    ) -> Result<Position> {
        let cf = self.cf_handle(CF_POSITIONS)?;
        let key = Self::position_key(account_id, pair);
        match self.db.get_cf(cf, &key)? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(Position::flat(account_id.clone(), pair.clone())),
        }
    }

    /// All position rows (used by snapshots)
    pub fn all_positions(&self) -> Result<Vec<Position>> {
        let cf = self.cf_handle(CF_POSITIONS)?;
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);

        let mut positions = Vec::new();
        for item in iter {
            let (_, value) = item?;
            positions.push(bincode::deserialize(&value)?);
        }
        Ok(positions)
    }

    // Atomic unit-of-work commits

    /// Commit one applied trade event: both orders, the touched balances
    /// and positions, the trade row, both fee rows and the time index,
    /// as a single atomic batch.
    pub fn commit_trade(
        &self,
        trade: &Trade,
        orders: &[&Order],
        balances: &[&Balance],
        positions: &[&Position],
        fees: &[&Fee],
    ) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_orders = self.cf_handle(CF_ORDERS)?;
        for order in orders {
            let value = bincode::serialize(*order)?;
            batch.put_cf(cf_orders, order.order_id.as_bytes(), &value);
        }

        let cf_balances = self.cf_handle(CF_BALANCES)?;
        for balance in balances {
            let key = Self::balance_key(&balance.account_id, &balance.asset);
            let value = bincode::serialize(*balance)?;
            batch.put_cf(cf_balances, &key, &value);
        }

        let cf_positions = self.cf_handle(CF_POSITIONS)?;
        for position in positions {
            let key = Self::position_key(&position.account_id, &position.pair);
            let value = bincode::serialize(*position)?;
            batch.put_cf(cf_positions, &key, &value);
        }

        let cf_trades = self.cf_handle(CF_TRADES)?;
        let trade_value = bincode::serialize(trade)?;
        batch.put_cf(cf_trades, trade.event_id.as_bytes(), &trade_value);

        let cf_fees = self.cf_handle(CF_FEES)?;
        for fee in fees {
            let key = Self::fee_key(fee.timestamp_nanos, &fee.trade_id, fee.side);
            let value = bincode::serialize(*fee)?;
            batch.put_cf(cf_fees, &key, &value);
        }

        let cf_indices = self.cf_handle(CF_INDICES)?;
        let time_key = Self::trade_time_key(trade.timestamp_nanos, &trade.event_id);
        batch.put_cf(cf_indices, &time_key, &[]);

        self.db.write(batch)?;

        tracing::debug!(
            event_id = %trade.event_id,
            pair = %trade.pair,
            amount = %trade.amount,
            price = %trade.price,
            "Trade committed"
        );

        Ok(())
    }

    /// Commit one applied cancellation: the cancelled order plus the
    /// balance row its unfilled remainder was released into.
    pub fn commit_cancel(&self, order: &Order, balance: Option<&Balance>) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_orders = self.cf_handle(CF_ORDERS)?;
        let value = bincode::serialize(order)?;
        batch.put_cf(cf_orders, order.order_id.as_bytes(), &value);

        if let Some(balance) = balance {
            let cf_balances = self.cf_handle(CF_BALANCES)?;
            let key = Self::balance_key(&balance.account_id, &balance.asset);
            let value = bincode::serialize(balance)?;
            batch.put_cf(cf_balances, &key, &value);
        }

        self.db.write(batch)?;
        Ok(())
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_orders: self.approximate_count(CF_ORDERS)?,
            total_trades: self.approximate_count(CF_TRADES)?,
            total_fees: self.approximate_count(CF_FEES)?,
        })
    }

    fn approximate_count(&self, cf_name: &str) -> Result<u64> {
        let cf = self.cf_handle(cf_name)?;
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub total_orders: u64,
    pub total_trades: u64,
    pub total_fees: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderKind, OrderStatus};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn btc_usd() -> AssetPair {
        AssetPair::new(Asset::new("BTC"), Asset::new("USD"))
    }

    fn test_order(account: &str, side: OrderSide) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            account_id: AccountId::new(account),
            side,
            kind: OrderKind::Limit,
            pair: btc_usd(),
            limit_price: Some(dec("100")),
            amount: dec("10"),
            filled_amount: Decimal::ZERO,
            filled_notional: Decimal::ZERO,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_trade(buy: &Order, sell: &Order, ts: i64) -> Trade {
        Trade {
            event_id: Uuid::now_v7(),
            buy_order_id: buy.order_id,
            sell_order_id: sell.order_id,
            buyer_id: buy.account_id.clone(),
            seller_id: sell.account_id.clone(),
            pair: btc_usd(),
            price: dec("100"),
            amount: dec("10"),
            timestamp_nanos: ts,
        }
    }

    #[test]
    fn test_order_roundtrip() {
        let (storage, _temp) = test_storage();
        let order = test_order("a", OrderSide::Buy);

        storage.put_order(&order).unwrap();
        let retrieved = storage.get_order(order.order_id).unwrap().unwrap();
        assert_eq!(retrieved.order_id, order.order_id);
        assert_eq!(retrieved.amount, order.amount);

        assert!(storage.get_order(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_balance_default_zero() {
        let (storage, _temp) = test_storage();
        let account = AccountId::new("a");
        let asset = Asset::new("USD");

        let balance = storage.get_balance_or_zero(&account, &asset).unwrap();
        assert_eq!(balance.available, Decimal::ZERO);
        assert_eq!(balance.locked, Decimal::ZERO);
    }

    #[test]
    fn test_commit_trade_atomic() {
        let (storage, _temp) = test_storage();

        let buy = test_order("buyer", OrderSide::Buy);
        let sell = test_order("seller", OrderSide::Sell);
        let trade = test_trade(&buy, &sell, 1_000);

        let buyer_base = Balance {
            account_id: buy.account_id.clone(),
            asset: Asset::new("BTC"),
            available: dec("10"),
            locked: Decimal::ZERO,
        };
        let position = Position::flat(buy.account_id.clone(), btc_usd());
        let fee = Fee {
            trade_id: trade.event_id,
            account_id: buy.account_id.clone(),
            side: OrderSide::Buy,
            rate: dec("0.001"),
            amount: dec("1"),
            asset: Asset::new("USD"),
            notional: dec("1000"),
            timestamp_nanos: trade.timestamp_nanos,
        };

        storage
            .commit_trade(
                &trade,
                &[&buy, &sell],
                &[&buyer_base],
                &[&position],
                &[&fee],
            )
            .unwrap();

        assert!(storage.trade_exists(trade.event_id).unwrap());
        assert!(storage.get_order(buy.order_id).unwrap().is_some());
        assert_eq!(
            storage
                .get_balance(&buy.account_id, &Asset::new("BTC"))
                .unwrap()
                .unwrap()
                .available,
            dec("10")
        );
    }

    #[test]
    fn test_window_scans() {
        let (storage, _temp) = test_storage();

        // Three trades at ts 100, 200, 300
        for ts in [100i64, 200, 300] {
            let buy = test_order("buyer", OrderSide::Buy);
            let sell = test_order("seller", OrderSide::Sell);
            let trade = test_trade(&buy, &sell, ts);
            let fee = Fee {
                trade_id: trade.event_id,
                account_id: buy.account_id.clone(),
                side: OrderSide::Buy,
                rate: dec("0.001"),
                amount: dec("1"),
                asset: Asset::new("USD"),
                notional: dec("1000"),
                timestamp_nanos: ts,
            };
            storage
                .commit_trade(&trade, &[&buy, &sell], &[], &[], &[&fee])
                .unwrap();
        }

        // Window [100, 200] is inclusive on both ends
        let trades = storage.trades_in_window(100, 200).unwrap();
        assert_eq!(trades.len(), 2);

        let fees = storage.fees_in_window(100, 200).unwrap();
        assert_eq!(fees.len(), 2);

        let all = storage.trades_in_window(0, 1_000).unwrap();
        assert_eq!(all.len(), 3);
    }
}
