//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Idempotency: redelivered trade events change nothing
//! - Non-negative balances: available >= 0 and locked >= 0 after every event
//! - Fill bound: filled_amount <= amount, violations rejected not clamped
//! - Path convergence: delta and snapshot wire forms reach the same state

use chrono::Utc;
use event_stream::{BalanceFigures, BalanceSnapshots, TradeExecuted};
use ledger_core::{
    applier::LedgerApplier,
    metrics::Metrics,
    types::{
        AccountId, Asset, AssetPair, Balance, Order, OrderKind, OrderSide, OrderStatus, Position,
    },
    Config, FeeSchedule, Storage,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Strategy for trade amounts (0.01 .. 1000.00 base units)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1u64..100_000u64).prop_map(|cents| Decimal::new(cents as i64, 2))
}

/// Strategy for prices (0.01 .. 10000.00 quote units)
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1u64..1_000_000u64).prop_map(|cents| Decimal::new(cents as i64, 2))
}

fn btc_usd() -> AssetPair {
    AssetPair::new(Asset::new("BTC"), Asset::new("USD"))
}

/// A fully funded trade scenario: orders, balances and seller position
/// seeded so the trade is applicable.
struct Scenario {
    storage: Arc<Storage>,
    applier: LedgerApplier,
    event: TradeExecuted,
    _temp: tempfile::TempDir,
}

fn build_scenario(amount: Decimal, price: Decimal) -> Scenario {
    let temp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp.path().to_path_buf();

    let storage = Arc::new(Storage::open(&config).unwrap());
    let fees = FeeSchedule::default();
    let applier = LedgerApplier::new(storage.clone(), fees.clone(), Metrics::new().unwrap());

    let notional = price * amount;
    let buyer_fee = fees.fee_amount(OrderSide::Buy, notional);

    let buy_order = Order {
        order_id: Uuid::new_v4(),
        account_id: AccountId::new("buyer"),
        side: OrderSide::Buy,
        kind: OrderKind::Limit,
        pair: btc_usd(),
        limit_price: Some(price),
        amount,
        filled_amount: Decimal::ZERO,
        filled_notional: Decimal::ZERO,
        status: OrderStatus::Pending,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let sell_order = Order {
        order_id: Uuid::new_v4(),
        account_id: AccountId::new("seller"),
        side: OrderSide::Sell,
        ..buy_order.clone()
    };
    storage.put_order(&buy_order).unwrap();
    storage.put_order(&sell_order).unwrap();

    // Exact funding: buyer's locked quote covers notional + fee, seller's
    // locked base covers the amount.
    storage
        .put_balance(&Balance {
            account_id: AccountId::new("buyer"),
            asset: Asset::new("USD"),
            available: Decimal::ZERO,
            locked: notional + buyer_fee,
        })
        .unwrap();
    storage
        .put_balance(&Balance {
            account_id: AccountId::new("seller"),
            asset: Asset::new("BTC"),
            available: Decimal::ZERO,
            locked: amount,
        })
        .unwrap();

    let mut seller_position = Position::flat(AccountId::new("seller"), btc_usd());
    seller_position.amount = amount;
    seller_position.avg_entry_price = price;
    storage.put_position(&seller_position).unwrap();

    let event = TradeExecuted {
        event_id: Uuid::now_v7(),
        buy_order_id: buy_order.order_id,
        sell_order_id: sell_order.order_id,
        buyer_id: "buyer".to_string(),
        seller_id: "seller".to_string(),
        base_asset: "BTC".to_string(),
        quote_asset: "USD".to_string(),
        price,
        amount,
        timestamp: Utc::now(),
        balances: None,
    };

    Scenario {
        storage,
        applier,
        event,
        _temp: temp,
    }
}

/// Observable ledger state for equality checks
#[derive(Debug, PartialEq)]
struct LedgerState {
    balances: Vec<Balance>,
    positions: Vec<Position>,
    buy_filled: Decimal,
    sell_filled: Decimal,
    fee_count: usize,
}

fn capture_state(scenario: &Scenario) -> LedgerState {
    let mut balances = scenario.storage.all_balances().unwrap();
    balances.sort_by(|a, b| {
        (a.account_id.clone(), a.asset.clone()).cmp(&(b.account_id.clone(), b.asset.clone()))
    });
    let mut positions = scenario.storage.all_positions().unwrap();
    positions.sort_by(|a, b| a.account_id.cmp(&b.account_id));

    LedgerState {
        balances,
        positions,
        buy_filled: scenario
            .storage
            .get_order(scenario.event.buy_order_id)
            .unwrap()
            .unwrap()
            .filled_amount,
        sell_filled: scenario
            .storage
            .get_order(scenario.event.sell_order_id)
            .unwrap()
            .unwrap()
            .filled_amount,
        fee_count: scenario
            .storage
            .fees_in_window(i64::MIN, i64::MAX)
            .unwrap()
            .len(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: applying the same trade event twice produces identical
    /// ledger state as applying it once.
    #[test]
    fn prop_idempotent_trade_application(
        amount in amount_strategy(),
        price in price_strategy(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let scenario = build_scenario(amount, price);

            scenario.applier.apply_trade(&scenario.event).await.unwrap();
            let first = capture_state(&scenario);

            scenario.applier.apply_trade(&scenario.event).await.unwrap();
            let second = capture_state(&scenario);

            prop_assert_eq!(first, second);
            Ok(())
        })?;
    }

    /// Property: balances are non-negative after every applied event.
    #[test]
    fn prop_non_negative_balances(
        amount in amount_strategy(),
        price in price_strategy(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let scenario = build_scenario(amount, price);
            scenario.applier.apply_trade(&scenario.event).await.unwrap();

            for balance in scenario.storage.all_balances().unwrap() {
                prop_assert!(balance.available >= Decimal::ZERO);
                prop_assert!(balance.locked >= Decimal::ZERO);
            }
            Ok(())
        })?;
    }

    /// Property: a fill that would exceed the order amount is rejected
    /// (skipped), never clamped, and leaves the ledger untouched.
    #[test]
    fn prop_fill_bound_enforced(
        amount in amount_strategy(),
        price in price_strategy(),
        excess in (1u64..10_000u64).prop_map(|cents| Decimal::new(cents as i64, 2)),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let scenario = build_scenario(amount, price);

            // An event for more than the orders' amount
            let mut oversized = scenario.event.clone();
            oversized.amount = amount + excess;

            scenario.applier.apply_trade(&oversized).await.unwrap();

            let buy = scenario
                .storage
                .get_order(scenario.event.buy_order_id)
                .unwrap()
                .unwrap();
            prop_assert_eq!(buy.filled_amount, Decimal::ZERO);
            prop_assert!(!scenario.storage.trade_exists(oversized.event_id).unwrap());
            Ok(())
        })?;
    }

    /// Property: the snapshot wire form converges to the same end state as
    /// the delta form.
    #[test]
    fn prop_delta_and_snapshot_paths_converge(
        amount in amount_strategy(),
        price in price_strategy(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let delta = build_scenario(amount, price);
            let snapshot = build_scenario(amount, price);

            delta.applier.apply_trade(&delta.event).await.unwrap();

            // The engine's authoritative post-trade figures, pre-fee on the
            // quote side: derived from the same seeded starting state.
            let notional = price * amount;
            let fees = FeeSchedule::default();
            let buyer_fee = fees.fee_amount(OrderSide::Buy, notional);

            let mut event = snapshot.event.clone();
            event.balances = Some(BalanceSnapshots {
                buyer_base: BalanceFigures {
                    available: amount,
                    locked: Decimal::ZERO,
                },
                buyer_quote: BalanceFigures {
                    available: Decimal::ZERO,
                    // Seeded locked was notional + fee; engine deducts the
                    // notional, the applier deducts the fee.
                    locked: buyer_fee,
                },
                seller_base: BalanceFigures {
                    available: Decimal::ZERO,
                    locked: Decimal::ZERO,
                },
                seller_quote: BalanceFigures {
                    available: notional,
                    locked: Decimal::ZERO,
                },
            });
            snapshot.applier.apply_trade(&event).await.unwrap();

            // Compare balances only: order/position bookkeeping is shared
            // code between the two paths.
            let mut delta_balances = delta.storage.all_balances().unwrap();
            delta_balances.sort_by(|a, b| {
                (a.account_id.clone(), a.asset.clone())
                    .cmp(&(b.account_id.clone(), b.asset.clone()))
            });
            let mut snapshot_balances = snapshot.storage.all_balances().unwrap();
            snapshot_balances.sort_by(|a, b| {
                (a.account_id.clone(), a.asset.clone())
                    .cmp(&(b.account_id.clone(), b.asset.clone()))
            });

            prop_assert_eq!(delta_balances, snapshot_balances);
            Ok(())
        })?;
    }

    /// Property: partial fills accumulate and never exceed the order amount
    /// across a sequence of fills.
    #[test]
    fn prop_partial_fills_respect_bound(fills in prop::collection::vec(1u64..50u64, 1..10)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let total: u64 = 100;
            let amount = Decimal::from(total);
            let price = Decimal::from(10u64);
            let scenario = build_scenario(amount, price);

            // Top up funding generously; each fill event funds itself from
            // the seeded pool.
            let fees = FeeSchedule::default();
            scenario
                .storage
                .put_balance(&Balance {
                    account_id: AccountId::new("buyer"),
                    asset: Asset::new("USD"),
                    available: Decimal::ZERO,
                    locked: price * amount * Decimal::from(2u64)
                        + fees.fee_amount(OrderSide::Buy, price * amount * Decimal::from(2u64)),
                })
                .unwrap();

            for fill in fills {
                let mut event = scenario.event.clone();
                event.event_id = Uuid::now_v7();
                event.amount = Decimal::from(fill);
                // Applied or skipped, never clamped
                scenario.applier.apply_trade(&event).await.unwrap();

                let buy = scenario
                    .storage
                    .get_order(scenario.event.buy_order_id)
                    .unwrap()
                    .unwrap();
                prop_assert!(buy.filled_amount <= buy.amount);
            }
            Ok(())
        })?;
    }
}
