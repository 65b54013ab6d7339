//! Prometheus metrics for the event stream

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

lazy_static! {
    /// Total events published into the dispatcher
    pub static ref EVENT_PUBLISH_TOTAL: CounterVec = register_counter_vec!(
        "event_stream_publish_total",
        "Total events published",
        &["event_type"]
    )
    .unwrap();

    /// Total events consumed by handlers
    pub static ref EVENT_CONSUME_TOTAL: CounterVec = register_counter_vec!(
        "event_stream_consume_total",
        "Total events consumed",
        &["event_type", "status"]
    )
    .unwrap();

    /// Total redeliveries after a handler error
    pub static ref EVENT_REDELIVERY_TOTAL: CounterVec = register_counter_vec!(
        "event_stream_redelivery_total",
        "Total event redeliveries",
        &["event_type"]
    )
    .unwrap();

    /// Events abandoned after redelivery was exhausted
    pub static ref EVENT_DEAD_LETTER_TOTAL: CounterVec = register_counter_vec!(
        "event_stream_dead_letter_total",
        "Total events abandoned after exhausted redelivery",
        &["event_type"]
    )
    .unwrap();

    /// Event handling duration
    pub static ref EVENT_HANDLE_DURATION: HistogramVec = register_histogram_vec!(
        "event_stream_handle_duration_seconds",
        "Event handling duration in seconds",
        &["event_type"]
    )
    .unwrap();
}

/// Label value for an event
pub fn event_type_label(event: &crate::types::EngineEvent) -> &'static str {
    match event {
        crate::types::EngineEvent::TradeExecuted(_) => "trade_executed",
        crate::types::EngineEvent::OrderCancelled(_) => "order_cancelled",
    }
}
