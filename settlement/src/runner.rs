//! Settlement run controller
//!
//! Executes the 4-step pipeline for a date in strict order, persisting a
//! `SettlementRun` row that tracks the highest completed step so a crashed
//! run resumes from the next incomplete step rather than restarting:
//!
//! 1. Snapshots - failure recorded, never aborts the run
//! 2. Settlement aggregation - fatal on failure
//! 3. Per-account aggregation - failures recorded and accumulated, the loop
//!    continues; the run fails afterwards if any account failed
//! 4. Validation - skipped entirely when the settlement is already validated
//!
//! The whole run is retried with exponential backoff (2s, 4s, 8s) before a
//! recovery hook persists a terminal failure marker for alerting.

use crate::{
    aggregator::SettlementAggregator,
    audit::AuditTrail,
    snapshot::SnapshotOrchestrator,
    store::SettlementStore,
    types::{
        RunStatus, SettlementFailure, SettlementKind, SettlementRun, SettlementScope,
        ValidationStatus,
    },
    validator::{update_validation_status, DoubleEntryValidator},
    Config, Error, Result,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ledger_core::types::AccountId;
use ledger_core::Storage;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Hook invoked when run-level retries are exhausted
///
/// At minimum the hook must persist a terminal failure marker so
/// operational alerting can pick the date up.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    /// Called once after the final failed attempt
    async fn on_retries_exhausted(&self, date: NaiveDate, error: &Error);
}

/// Default recovery hook: persists the terminal marker and logs for alerting
pub struct PersistFailureMarker {
    store: Arc<SettlementStore>,
}

impl PersistFailureMarker {
    /// Create the default hook over the settlement store
    pub fn new(store: Arc<SettlementStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryHook for PersistFailureMarker {
    async fn on_retries_exhausted(&self, date: NaiveDate, error: &Error) {
        tracing::error!(%date, error = %error, "Settlement run retries exhausted");

        if let Ok(Some(mut run)) = self.store.get_run(date) {
            run.status = RunStatus::RetriesExhausted;
            run.updated_at = Utc::now();
            if let Err(e) = self.store.put_run(&run) {
                tracing::error!(%date, error = %e, "Failed to persist terminal run marker");
            }
        }

        let marker = SettlementFailure {
            failure_id: Uuid::now_v7(),
            date,
            step: 0,
            account_id: None,
            error: error.to_string(),
            occurred_at: Utc::now(),
        };
        if let Err(e) = self.store.put_failure(&marker) {
            tracing::error!(%date, error = %e, "Failed to persist terminal failure marker");
        }
    }
}

/// Settlement run controller
pub struct SettlementRunner {
    snapshots: SnapshotOrchestrator,
    aggregator: SettlementAggregator,
    validator: DoubleEntryValidator,
    store: Arc<SettlementStore>,
    audit: AuditTrail,
    config: Config,
    recovery: Arc<dyn RecoveryHook>,
}

impl SettlementRunner {
    /// Create the controller and its pipeline components
    pub fn new(ledger: Arc<Storage>, store: Arc<SettlementStore>, config: Config) -> Self {
        Self {
            snapshots: SnapshotOrchestrator::new(ledger.clone(), store.clone()),
            aggregator: SettlementAggregator::new(ledger.clone(), store.clone(), config.clone()),
            validator: DoubleEntryValidator::new(ledger, store.clone(), config.clone()),
            audit: AuditTrail::new(store.clone()),
            recovery: Arc::new(PersistFailureMarker::new(store.clone())),
            store,
            config,
        }
    }

    /// Replace the recovery hook
    pub fn with_recovery_hook(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.recovery = hook;
        self
    }

    /// Run the pipeline with run-level retry and the recovery hook
    pub async fn run_daily_settlement(
        &self,
        date: NaiveDate,
        force_recreate: bool,
    ) -> Result<SettlementRun> {
        let retries = self.config.retry.max_attempts;
        let mut last_error: Option<Error> = None;

        for attempt in 0..=retries {
            match self.run_daily_settlement_for_date(date, force_recreate).await {
                Ok(run) => return Ok(run),
                Err(e) => {
                    tracing::warn!(%date, attempt, error = %e, "Settlement run attempt failed");
                    last_error = Some(e);

                    if attempt < retries {
                        let delay = self.config.retry.base_delay_secs * 2u64.pow(attempt);
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                }
            }
        }

        let error =
            last_error.unwrap_or_else(|| Error::RunFailed("no attempt recorded".to_string()));
        self.recovery.on_retries_exhausted(date, &error).await;
        Err(error)
    }

    /// Execute one pipeline attempt, resuming from the next incomplete step
    pub async fn run_daily_settlement_for_date(
        &self,
        date: NaiveDate,
        force_recreate: bool,
    ) -> Result<SettlementRun> {
        let mut run = self.load_or_create_run(date, force_recreate)?;
        if run.status == RunStatus::Completed {
            tracing::info!(%date, "Settlement run already completed");
            return Ok(run);
        }
        self.store.put_run(&run)?;

        tracing::info!(
            %date,
            attempt = run.attempt,
            resume_from = run.last_completed_step + 1,
            "Settlement run starting"
        );

        // Step 1: snapshots. Failure is recorded but never aborts; the
        // snapshots can be taken later and are not critical to aggregation.
        if run.last_completed_step < 1 {
            if let Err(e) = self.snapshots.create_daily_snapshots(date) {
                self.record_failure(date, 1, None, &e)?;
            }
            self.complete_step(&mut run, 1)?;
        }

        // Step 2: aggregation. Fatal: without the settlement nothing
        // downstream is meaningful.
        if run.last_completed_step < 2 {
            match self.aggregator.create_daily_settlement(date, force_recreate) {
                Ok(_) => self.complete_step(&mut run, 2)?,
                Err(e) => {
                    self.record_failure(date, 2, None, &e)?;
                    return self.fail_run(run, e);
                }
            }
        }

        // Step 3: per-account aggregation. One account's failure must not
        // block the others; the run fails afterwards if any failed, since
        // all accounts must eventually succeed.
        if run.last_completed_step < 3 {
            let accounts = self.aggregator.eligible_accounts(date)?;
            let total = accounts.len();
            let mut failed: Vec<AccountId> = Vec::new();

            for account in accounts {
                if let Err(e) =
                    self.aggregator
                        .create_user_daily_settlement(&account, date, force_recreate)
                {
                    self.record_failure(date, 3, Some(account.clone()), &e)?;
                    failed.push(account);
                }
            }

            if !failed.is_empty() {
                let error = Error::RunFailed(format!(
                    "{} of {} account settlements failed",
                    failed.len(),
                    total
                ));
                run.failed_accounts = failed;
                return self.fail_run(run, error);
            }
            self.complete_step(&mut run, 3)?;
        }

        // Step 4: validation. Skipped when already validated, so a crash
        // between steps 3 and 4 re-invokes safely.
        if run.last_completed_step < 4 {
            let settlement = self
                .store
                .get_settlement(date, SettlementKind::Daily, &SettlementScope::All)?
                .ok_or_else(|| Error::SettlementNotFound(date.to_string()))?;

            if settlement.status == ValidationStatus::Validated {
                tracing::info!(%date, "Settlement already validated, skipping re-validation");
            } else {
                update_validation_status(
                    &self.store,
                    &self.audit,
                    date,
                    SettlementKind::Daily,
                    ValidationStatus::Validating,
                    "runner",
                )?;

                match self.validator.validate(date) {
                    Ok(report) => {
                        // A mismatch is a reportable outcome, not a run
                        // failure: the run completes with status Failed on
                        // the settlement itself.
                        update_validation_status(
                            &self.store,
                            &self.audit,
                            date,
                            SettlementKind::Daily,
                            report.status,
                            "runner",
                        )?;
                    }
                    Err(e) => {
                        self.record_failure(date, 4, None, &e)?;
                        return self.fail_run(run, e);
                    }
                }
            }
            self.complete_step(&mut run, 4)?;
        }

        run.status = RunStatus::Completed;
        run.updated_at = Utc::now();
        self.store.put_run(&run)?;

        tracing::info!(%date, attempt = run.attempt, "Settlement run completed");
        Ok(run)
    }

    fn load_or_create_run(&self, date: NaiveDate, force_recreate: bool) -> Result<SettlementRun> {
        let now = Utc::now();

        match self.store.get_run(date)? {
            Some(existing) if existing.status == RunStatus::Completed && !force_recreate => {
                Ok(existing)
            }
            Some(existing) if force_recreate => Ok(SettlementRun {
                run_id: Uuid::now_v7(),
                date,
                attempt: existing.attempt + 1,
                last_completed_step: 0,
                status: RunStatus::Running,
                failed_accounts: Vec::new(),
                started_at: now,
                updated_at: now,
            }),
            Some(mut existing) => {
                existing.attempt += 1;
                existing.status = RunStatus::Running;
                existing.failed_accounts.clear();
                existing.updated_at = now;
                Ok(existing)
            }
            None => Ok(SettlementRun {
                run_id: Uuid::now_v7(),
                date,
                attempt: 1,
                last_completed_step: 0,
                status: RunStatus::Running,
                failed_accounts: Vec::new(),
                started_at: now,
                updated_at: now,
            }),
        }
    }

    fn complete_step(&self, run: &mut SettlementRun, step: u8) -> Result<()> {
        run.last_completed_step = step;
        run.updated_at = Utc::now();
        self.store.put_run(run)
    }

    fn fail_run(&self, mut run: SettlementRun, error: Error) -> Result<SettlementRun> {
        run.status = RunStatus::Failed;
        run.updated_at = Utc::now();
        self.store.put_run(&run)?;
        tracing::error!(date = %run.date, error = %error, "Settlement run failed");
        Err(error)
    }

    fn record_failure(
        &self,
        date: NaiveDate,
        step: u8,
        account_id: Option<AccountId>,
        error: &Error,
    ) -> Result<()> {
        tracing::warn!(
            %date,
            step,
            account = account_id.as_ref().map(|a| a.as_str()).unwrap_or("-"),
            error = %error,
            "Settlement step failure recorded"
        );

        self.store.put_failure(&SettlementFailure {
            failure_id: Uuid::now_v7(),
            date,
            step,
            account_id,
            error: error.to_string(),
            occurred_at: Utc::now(),
        })
    }
}
