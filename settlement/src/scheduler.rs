//! Settlement scheduler
//!
//! Drives the pipeline on a calendar: once per day for yesterday after the
//! configured run time, once per month for the prior month, plus ad-hoc
//! triggers for arbitrary dates. All triggers flow through the same
//! resumable, idempotent run path.

use crate::{
    aggregator::SettlementAggregator, runner::SettlementRunner, types::SettlementRun, Config,
    Error, Result,
};
use chrono::{Datelike, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Settlement scheduler
pub struct SettlementScheduler {
    runner: Arc<SettlementRunner>,
    aggregator: Arc<SettlementAggregator>,
    config: Config,
    last_daily: RwLock<Option<NaiveDate>>,
    last_monthly: RwLock<Option<(i32, u32)>>,
}

impl SettlementScheduler {
    /// Create scheduler over the run controller and aggregator
    pub fn new(
        runner: Arc<SettlementRunner>,
        aggregator: Arc<SettlementAggregator>,
        config: Config,
    ) -> Self {
        Self {
            runner,
            aggregator,
            config,
            last_daily: RwLock::new(None),
            last_monthly: RwLock::new(None),
        }
    }

    /// Start the schedule loop
    pub async fn start(self: Arc<Self>) {
        info!("Starting settlement scheduler");

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;

            if let Err(e) = self.check_schedule().await {
                warn!("Scheduler check failed: {}", e);
            }
        }
    }

    /// Fire any due daily/monthly work
    async fn check_schedule(&self) -> Result<()> {
        if !self.config.schedule.auto_run {
            return Ok(());
        }

        let offset = self.config.business_offset()?;
        let now_local = Utc::now().with_timezone(&offset);
        let today = now_local.date_naive();
        let run_time = parse_run_time(&self.config.schedule.daily_run_time)?;

        if now_local.time() >= run_time {
            // Daily: settle yesterday, once per calendar day
            let already_ran = *self.last_daily.read().await == Some(today);
            if !already_ran {
                *self.last_daily.write().await = Some(today);

                if let Some(yesterday) = today.pred_opt() {
                    info!(date = %yesterday, "Scheduled daily settlement firing");
                    if let Err(e) = self.runner.run_daily_settlement(yesterday, false).await {
                        error!(date = %yesterday, error = %e, "Scheduled daily settlement failed");
                    }
                }
            }

            // Monthly: settle the prior month on the configured day
            if today.day() == self.config.schedule.monthly_run_day {
                let prior = prior_month(today);
                let already_ran = *self.last_monthly.read().await == Some(prior);
                if !already_ran {
                    *self.last_monthly.write().await = Some(prior);

                    let (year, month) = prior;
                    info!(year, month, "Scheduled monthly settlement firing");
                    if let Err(e) = self.aggregator.create_monthly_settlement(year, month, false) {
                        error!(year, month, error = %e, "Scheduled monthly settlement failed");
                    }
                }
            }
        }

        Ok(())
    }

    /// Trigger the pipeline for an arbitrary date (idempotent/resumable)
    pub async fn trigger_adhoc(
        &self,
        date: NaiveDate,
        force_recreate: bool,
    ) -> Result<SettlementRun> {
        info!(%date, force_recreate, "Ad-hoc settlement triggered");
        self.runner.run_daily_settlement(date, force_recreate).await
    }
}

fn parse_run_time(time: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(time, "%H:%M")
        .map_err(|e| Error::Config(format!("Invalid run time '{}': {}", time, e)))
}

fn prior_month(today: NaiveDate) -> (i32, u32) {
    if today.month() == 1 {
        (today.year() - 1, 12)
    } else {
        (today.year(), today.month() - 1)
    }
}
