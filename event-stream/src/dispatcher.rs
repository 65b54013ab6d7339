//! Partitioned event dispatcher
//!
//! Models the delivery contract of the engine's event log: events are
//! partitioned by account id and each partition is consumed strictly in
//! order by exactly one worker. Delivery is at-least-once: a handler error
//! triggers redelivery of the same event with exponential backoff, so
//! handlers must be idempotent.
//!
//! The pool is sized by an explicit [`DispatcherConfig`] passed into
//! [`PartitionedDispatcher::start`] - tests run a single-partition,
//! single-worker instance deterministically.

use crate::{
    metrics::{
        event_type_label, EVENT_CONSUME_TOTAL, EVENT_DEAD_LETTER_TOTAL, EVENT_HANDLE_DURATION,
        EVENT_PUBLISH_TOTAL, EVENT_REDELIVERY_TOTAL,
    },
    types::EngineEvent,
    Error, Result,
};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Event handler trait
///
/// Errors propagate back to the dispatcher and cause redelivery; a handler
/// that wants an event skipped (stale/duplicate) returns `Ok` after logging.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event
    async fn handle(&self, event: EngineEvent) -> anyhow::Result<()>;
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of partitions (one worker each)
    pub num_partitions: u32,

    /// Bounded per-partition channel capacity (backpressure)
    pub channel_capacity: usize,

    /// Initial redelivery delay
    pub redelivery_initial_delay_ms: u64,

    /// Give up redelivering after this long (None retries forever)
    pub redelivery_max_elapsed_secs: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_partitions: 16,
            channel_capacity: 1024,
            redelivery_initial_delay_ms: 50,
            redelivery_max_elapsed_secs: Some(30),
        }
    }
}

impl DispatcherConfig {
    /// Single-partition, single-worker configuration for deterministic tests
    pub fn single_worker() -> Self {
        Self {
            num_partitions: 1,
            channel_capacity: 64,
            redelivery_initial_delay_ms: 10,
            redelivery_max_elapsed_secs: Some(1),
        }
    }
}

/// Partitioned dispatcher: one in-order worker per partition
pub struct PartitionedDispatcher {
    senders: Vec<mpsc::Sender<EngineEvent>>,
    num_partitions: u32,
    workers: Vec<JoinHandle<()>>,
}

impl PartitionedDispatcher {
    /// Start workers and return the dispatcher handle
    pub fn start<H>(config: DispatcherConfig, handler: Arc<H>) -> Self
    where
        H: EventHandler + 'static,
    {
        assert!(config.num_partitions > 0, "num_partitions must be > 0");

        let mut senders = Vec::with_capacity(config.num_partitions as usize);
        let mut workers = Vec::with_capacity(config.num_partitions as usize);

        for partition in 0..config.num_partitions {
            let (tx, rx) = mpsc::channel(config.channel_capacity);
            senders.push(tx);

            let handler = handler.clone();
            let config = config.clone();
            workers.push(tokio::spawn(async move {
                run_partition_worker(partition, rx, handler, config).await;
            }));
        }

        info!(
            partitions = config.num_partitions,
            "Event dispatcher started"
        );

        Self {
            senders,
            num_partitions: config.num_partitions,
            workers,
        }
    }

    /// Publish an event to its account's partition
    pub async fn publish(&self, event: EngineEvent) -> Result<()> {
        let partition = event.partition_key().partition_number(self.num_partitions) as usize;

        EVENT_PUBLISH_TOTAL
            .with_label_values(&[event_type_label(&event)])
            .inc();

        self.senders[partition]
            .send(event)
            .await
            .map_err(|e| Error::ChannelClosed(format!("partition {}: {}", partition, e)))
    }

    /// Drain and stop all workers
    ///
    /// In-flight and queued events are processed before workers exit.
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Partition worker panicked during shutdown: {}", e);
            }
        }
        info!("Event dispatcher stopped");
    }
}

/// Worker loop for one partition: strictly in-order, redelivery on error
async fn run_partition_worker<H>(
    partition: u32,
    mut rx: mpsc::Receiver<EngineEvent>,
    handler: Arc<H>,
    config: DispatcherConfig,
) where
    H: EventHandler + 'static,
{
    while let Some(event) = rx.recv().await {
        let label = event_type_label(&event);
        let event_id = event.event_id();
        let start = Instant::now();

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(config.redelivery_initial_delay_ms))
            .with_max_elapsed_time(
                config
                    .redelivery_max_elapsed_secs
                    .map(Duration::from_secs),
            )
            .build();

        let attempts = Arc::new(AtomicU32::new(0));
        let result = backoff::future::retry(policy, || {
            let handler = handler.clone();
            let event = event.clone();
            let attempts = attempts.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed);
                handler.handle(event).await.map_err(|e| {
                    if attempt > 0 {
                        EVENT_REDELIVERY_TOTAL.with_label_values(&[label]).inc();
                    }
                    warn!(
                        %event_id,
                        partition,
                        attempt,
                        error = %e,
                        "Event handling failed, will redeliver"
                    );
                    backoff::Error::transient(e)
                })
            }
        })
        .await;

        match result {
            Ok(()) => {
                EVENT_CONSUME_TOTAL
                    .with_label_values(&[label, "success"])
                    .inc();
                EVENT_HANDLE_DURATION
                    .with_label_values(&[label])
                    .observe(start.elapsed().as_secs_f64());
            }
            Err(e) => {
                // Never silently dropped: the abandoned event is logged with
                // enough detail to replay it manually.
                EVENT_DEAD_LETTER_TOTAL.with_label_values(&[label]).inc();
                error!(
                    %event_id,
                    partition,
                    attempts = attempts.load(Ordering::Relaxed),
                    error = %e,
                    "Redelivery exhausted, event abandoned"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderCancelled, TradeExecuted};
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn cancel_event(account: &str) -> EngineEvent {
        EngineEvent::OrderCancelled(OrderCancelled {
            event_id: Uuid::now_v7(),
            order_id: Uuid::new_v4(),
            account_id: account.to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USD".to_string(),
            timestamp: Utc::now(),
        })
    }

    fn trade_event(buyer: &str) -> EngineEvent {
        EngineEvent::TradeExecuted(TradeExecuted {
            event_id: Uuid::now_v7(),
            buy_order_id: Uuid::new_v4(),
            sell_order_id: Uuid::new_v4(),
            buyer_id: buyer.to_string(),
            seller_id: "seller".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USD".to_string(),
            price: Decimal::new(100, 0),
            amount: Decimal::new(1, 0),
            timestamp: Utc::now(),
            balances: None,
        })
    }

    /// Records the order events were handled in
    struct RecordingHandler {
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: EngineEvent) -> anyhow::Result<()> {
            self.seen.lock().push(event.event_id());
            Ok(())
        }
    }

    /// Fails the first `failures` attempts, then succeeds
    struct FlakyHandler {
        failures: u32,
        attempts: AtomicU32,
        succeeded: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _event: EngineEvent) -> anyhow::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                anyhow::bail!("transient failure (attempt {})", attempt);
            }
            self.succeeded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_in_order_delivery_within_partition() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let dispatcher = PartitionedDispatcher::start(DispatcherConfig::single_worker(), handler.clone());

        let events: Vec<EngineEvent> = (0..20).map(|_| cancel_event("acct-1")).collect();
        let expected: Vec<Uuid> = events.iter().map(|e| e.event_id()).collect();

        for event in events {
            dispatcher.publish(event).await.unwrap();
        }
        dispatcher.shutdown().await;

        assert_eq!(*handler.seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_redelivery_until_success() {
        let handler = Arc::new(FlakyHandler {
            failures: 2,
            attempts: AtomicU32::new(0),
            succeeded: AtomicU32::new(0),
        });

        let mut config = DispatcherConfig::single_worker();
        config.redelivery_max_elapsed_secs = Some(10);
        let dispatcher = PartitionedDispatcher::start(config, handler.clone());

        dispatcher.publish(trade_event("acct-1")).await.unwrap();
        dispatcher.shutdown().await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(handler.succeeded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_survives_dead_letter() {
        // First event always fails; the worker must abandon it after the
        // redelivery budget and go on to process the next event.
        struct FirstPoisonHandler {
            seen: Mutex<Vec<Uuid>>,
            poison: Uuid,
        }

        #[async_trait]
        impl EventHandler for FirstPoisonHandler {
            async fn handle(&self, event: EngineEvent) -> anyhow::Result<()> {
                if event.event_id() == self.poison {
                    anyhow::bail!("permanent failure");
                }
                self.seen.lock().push(event.event_id());
                Ok(())
            }
        }

        let poison = cancel_event("acct-1");
        let good = cancel_event("acct-1");
        let good_id = good.event_id();

        let handler = Arc::new(FirstPoisonHandler {
            seen: Mutex::new(Vec::new()),
            poison: poison.event_id(),
        });

        let dispatcher = PartitionedDispatcher::start(DispatcherConfig::single_worker(), handler.clone());
        dispatcher.publish(poison).await.unwrap();
        dispatcher.publish(good).await.unwrap();
        dispatcher.shutdown().await;

        assert_eq!(*handler.seen.lock(), vec![good_id]);
    }

    #[tokio::test]
    async fn test_all_partitions_drain_on_shutdown() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let config = DispatcherConfig {
            num_partitions: 4,
            ..DispatcherConfig::default()
        };
        let dispatcher = PartitionedDispatcher::start(config, handler.clone());

        for i in 0..40 {
            let account = format!("acct-{}", i % 8);
            dispatcher.publish(cancel_event(&account)).await.unwrap();
        }
        dispatcher.shutdown().await;

        assert_eq!(handler.seen.lock().len(), 40);
    }
}
