//! Append-only audit trail
//!
//! Every mutating action on a settlement (create, recreate, validation
//! transition, adjustment) is recorded with actor, timestamp and
//! before/after state, and mirrored to the `audit_log` tracing target as
//! structured JSON for log shipping.

use crate::{
    store::SettlementStore,
    types::{AuditAction, AuditRecord},
    Result,
};
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Audit trail writer
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<SettlementStore>,
}

impl AuditTrail {
    /// Create audit trail over the settlement store
    pub fn new(store: Arc<SettlementStore>) -> Self {
        Self { store }
    }

    /// Record one mutating action against a settlement
    pub fn record(
        &self,
        settlement_id: Uuid,
        date: NaiveDate,
        action: AuditAction,
        actor: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Result<AuditRecord> {
        let record = AuditRecord {
            audit_id: Uuid::now_v7(),
            settlement_id,
            date,
            action,
            actor: actor.to_string(),
            before: before.as_ref().map(|v| v.to_string()),
            after: after.as_ref().map(|v| v.to_string()),
            recorded_at: Utc::now(),
        };

        self.store.put_audit(&record)?;

        info!(
            target: "audit_log",
            "{}",
            json!({
                "timestamp": record.recorded_at.to_rfc3339(),
                "settlement_id": record.settlement_id.to_string(),
                "date": record.date.to_string(),
                "action": format!("{:?}", record.action),
                "actor": record.actor,
                "before": before,
                "after": after,
            })
        );

        Ok(record)
    }
}
