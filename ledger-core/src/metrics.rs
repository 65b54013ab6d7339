//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `ledger_trades_applied_total` - Trades applied to the ledger
//! - `ledger_cancels_applied_total` - Cancellations applied
//! - `ledger_events_skipped_total` - Stale/duplicate events skipped
//! - `ledger_invariant_aborts_total` - Units of work aborted on invariant violation
//! - `ledger_apply_duration_seconds` - Histogram of event application latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Trades applied
    pub trades_applied_total: IntCounter,

    /// Cancellations applied
    pub cancels_applied_total: IntCounter,

    /// Stale/duplicate events skipped
    pub events_skipped_total: IntCounter,

    /// Units of work aborted on invariant violation
    pub invariant_aborts_total: IntCounter,

    /// Apply duration histogram
    pub apply_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let trades_applied_total = IntCounter::new(
            "ledger_trades_applied_total",
            "Trades applied to the ledger",
        )?;
        registry.register(Box::new(trades_applied_total.clone()))?;

        let cancels_applied_total = IntCounter::new(
            "ledger_cancels_applied_total",
            "Cancellations applied to the ledger",
        )?;
        registry.register(Box::new(cancels_applied_total.clone()))?;

        let events_skipped_total = IntCounter::new(
            "ledger_events_skipped_total",
            "Stale or duplicate events skipped",
        )?;
        registry.register(Box::new(events_skipped_total.clone()))?;

        let invariant_aborts_total = IntCounter::new(
            "ledger_invariant_aborts_total",
            "Units of work aborted on invariant violation",
        )?;
        registry.register(Box::new(invariant_aborts_total.clone()))?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_apply_duration_seconds",
                "Histogram of event application latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        Ok(Self {
            trades_applied_total,
            cancels_applied_total,
            events_skipped_total,
            invariant_aborts_total,
            apply_duration,
            registry,
        })
    }

    /// Record an applied trade
    pub fn record_trade_applied(&self) {
        self.trades_applied_total.inc();
    }

    /// Record an applied cancellation
    pub fn record_cancel_applied(&self) {
        self.cancels_applied_total.inc();
    }

    /// Record a skipped event
    pub fn record_event_skipped(&self) {
        self.events_skipped_total.inc();
    }

    /// Record an aborted unit of work
    pub fn record_invariant_abort(&self) {
        self.invariant_aborts_total.inc();
    }

    /// Record apply duration
    pub fn record_apply_duration(&self, duration_seconds: f64) {
        self.apply_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
