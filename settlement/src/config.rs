//! Configuration for the settlement pipeline

use chrono::{Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for the settlement RocksDB
    pub data_dir: PathBuf,

    /// Business timezone as a fixed UTC offset (hours); day windows are
    /// computed in this timezone
    pub business_utc_offset_hours: i32,

    /// Tolerance for double-entry comparisons
    pub validation_epsilon: Decimal,

    /// Run-level retry configuration
    pub retry: RetryConfig,

    /// Schedule configuration
    pub schedule: ScheduleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/settlement"),
            business_utc_offset_hours: 0,
            validation_epsilon: Decimal::new(1, 6), // 1e-6
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

/// Run-level retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt before the recovery hook fires
    pub max_attempts: u32,

    /// Base delay; retry n waits base * 2^(n-1) seconds (2s, 4s, 8s)
    pub base_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2,
        }
    }
}

/// Schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Business-timezone time of day the daily run fires, "HH:MM"
    pub daily_run_time: String,

    /// Day of month the monthly settlement fires
    pub monthly_run_day: u32,

    /// Enable the automatic schedule loop
    pub auto_run: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_run_time: "00:30".to_string(),
            monthly_run_day: 1,
            auto_run: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Business timezone offset
    pub fn business_offset(&self) -> crate::Result<FixedOffset> {
        FixedOffset::east_opt(self.business_utc_offset_hours * 3600)
            .ok_or_else(|| crate::Error::Config("Invalid business UTC offset".to_string()))
    }

    /// Day window `[00:00:00, 23:59:59.999]` in the business timezone,
    /// as UTC nanosecond bounds (inclusive)
    pub fn day_window_nanos(&self, date: NaiveDate) -> crate::Result<(i64, i64)> {
        let offset = self.business_offset()?;
        let start_local = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| crate::Error::Config("Invalid date".to_string()))?;
        let start = offset
            .from_local_datetime(&start_local)
            .single()
            .ok_or_else(|| crate::Error::Config("Ambiguous day start".to_string()))?
            .with_timezone(&Utc);
        let end = start + Duration::days(1) - Duration::milliseconds(1);

        Ok((
            start.timestamp_nanos_opt().unwrap_or(0),
            end.timestamp_nanos_opt().unwrap_or(i64::MAX),
        ))
    }

    /// Month window as UTC nanosecond bounds (inclusive)
    pub fn month_window_nanos(&self, year: i32, month: u32) -> crate::Result<(i64, i64)> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| crate::Error::Config(format!("Invalid month: {}-{}", year, month)))?;
        let next_first = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .ok_or_else(|| crate::Error::Config(format!("Invalid month: {}-{}", year, month)))?;

        let (start, _) = self.day_window_nanos(first)?;
        let (next_start, _) = self.day_window_nanos(next_first)?;

        // Inclusive end: 1ms before the next month's first instant
        Ok((start, next_start - 1_000_000))
    }
}
