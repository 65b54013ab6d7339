//! Ordered lock acquisition for multi-row units of work
//!
//! A trade touches two orders, four balance rows and two position rows;
//! concurrently-processing partitions can share any of them. Every multi-row
//! lock goes through [`LockTable::acquire`], which sorts the requested keys
//! into one canonical total order before taking them, so two workers that
//! overlap on any subset of rows always lock in the same order and cannot
//! deadlock each other.

use crate::types::{AccountId, Asset, AssetPair};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// A lockable ledger resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    /// An order row
    Order(Uuid),
    /// A balance row
    Balance(AccountId, Asset),
    /// A position row
    Position(AccountId, AssetPair),
}

/// Guard set for one unit of work; rows stay locked until dropped
pub type LockSet = Vec<OwnedMutexGuard<()>>;

/// Process-wide table of row locks
///
/// Lock entries are created on first touch and kept for the process
/// lifetime; the per-key cost is one `Arc<Mutex<()>>`.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl LockTable {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquire exclusive locks on all `keys`, in canonical ascending order
    ///
    /// Duplicate keys are collapsed; the returned guards release on drop.
    pub async fn acquire(&self, keys: &[LockKey]) -> LockSet {
        let mut sorted: Vec<LockKey> = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            // The map guard must not be held across the await below.
            let mutex = {
                self.locks
                    .entry(key)
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .value()
                    .clone()
            };
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    /// Number of distinct keys ever locked (for diagnostics)
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has been locked yet
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn order_key(n: u128) -> LockKey {
        LockKey::Order(Uuid::from_u128(n))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let table = LockTable::new();

        let guards = table.acquire(&[order_key(1), order_key(2)]).await;
        assert_eq!(guards.len(), 2);
        drop(guards);

        // Same keys can be re-acquired after release
        let guards = table.acquire(&[order_key(1), order_key(2)]).await;
        assert_eq!(guards.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_keys_collapsed() {
        let table = LockTable::new();

        // Acquiring the same key twice in one set must not self-deadlock
        let guards = table.acquire(&[order_key(1), order_key(1)]).await;
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn test_opposite_orderings_do_not_deadlock() {
        let table = Arc::new(LockTable::new());

        // Two tasks request the same pair of keys in opposite order, many
        // times; canonical ordering keeps them from deadlocking.
        let mut handles = Vec::new();
        for flip in [false, true] {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let keys = if flip {
                        [order_key(2), order_key(1)]
                    } else {
                        [order_key(1), order_key(2)]
                    };
                    let _guards = table.acquire(&keys).await;
                }
            }));
        }

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            for handle in handles {
                handle.await.unwrap();
            }
        })
        .await;

        assert!(joined.is_ok(), "lock ordering deadlocked");
    }

    #[tokio::test]
    async fn test_mixed_key_kinds_have_total_order() {
        let table = LockTable::new();

        let keys = [
            LockKey::Balance(AccountId::new("a"), Asset::new("USD")),
            order_key(1),
            LockKey::Position(
                AccountId::new("a"),
                AssetPair::new(Asset::new("BTC"), Asset::new("USD")),
            ),
        ];

        let guards = table.acquire(&keys).await;
        assert_eq!(guards.len(), 3);
        assert_eq!(table.len(), 3);
    }
}
