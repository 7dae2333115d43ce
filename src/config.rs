// =============================================================================
// Engine configuration — tunable settings with serde defaults and atomic save
// =============================================================================
//
// Every recognised option lives here so a deployment can be tuned from one
// JSON file. All fields carry `#[serde(default)]` so adding new fields never
// breaks loading an older file. Persistence uses a tmp + rename pattern to
// prevent corruption on crash.
//
// Secrets (provider API keys, broker tokens) are NOT part of this file; they
// come from the environment at startup.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::provider::DataSource;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_window_start() -> String {
    "15:50".to_string()
}

fn default_window_minutes() -> u32 {
    10
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_symphony_timeout_secs() -> u64 {
    300
}

fn default_min_order_dollars() -> Decimal {
    Decimal::from(10)
}

fn default_cash_buffer() -> Decimal {
    Decimal::ZERO
}

fn default_corridor() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_provider_priority() -> Vec<DataSource> {
    vec![DataSource::EodHistorical, DataSource::AlphaVantage]
}

fn default_ttl_quote_secs() -> u64 {
    60
}

fn default_ttl_intraday_secs() -> u64 {
    300
}

fn default_ttl_daily_secs() -> u64 {
    3600
}

fn default_ttl_historical_secs() -> u64 {
    86_400
}

fn default_ttl_fundamentals_secs() -> u64 {
    604_800
}

fn default_broker_base_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_warmup_lead_minutes() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_submit_cutoff_secs() -> u64 {
    30
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the maestro engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Execution window ----------------------------------------------------

    /// Local wall-clock time (HH:MM) at which the daily window opens.
    #[serde(default = "default_window_start")]
    pub window_start: String,

    /// Length of the execution window in minutes.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,

    /// Exchange-local timezone governing the window and calendar rules.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Exchange holidays; the scheduler skips these dates entirely.
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,

    /// Minutes before the window when cache warmup starts.
    #[serde(default = "default_warmup_lead_minutes")]
    pub warmup_lead_minutes: u32,

    // --- Concurrency & timeouts ---------------------------------------------

    /// Symphonies evaluated concurrently within a window.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Hard per-symphony timeout in seconds.
    #[serde(default = "default_symphony_timeout_secs")]
    pub symphony_timeout_secs: u64,

    /// Per-order broker poll cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// No new order submissions once the window has fewer than this many
    /// seconds left.
    #[serde(default = "default_submit_cutoff_secs")]
    pub submit_cutoff_secs: u64,

    // --- Planning ------------------------------------------------------------

    /// Deltas smaller than this (in dollars) produce no order.
    #[serde(default = "default_min_order_dollars")]
    pub min_order_dollars: Decimal,

    /// Default cash buffer reserved by the evaluator's allocation step.
    #[serde(default = "default_cash_buffer")]
    pub cash_buffer: Decimal,

    /// Default drift corridor for threshold symphonies that carry none.
    #[serde(default = "default_corridor")]
    pub rebalance_corridor: Decimal,

    /// When > 0, a threshold symphony inside its corridor still executes once
    /// its last execution is at least this many days old. 0 = always skip.
    #[serde(default)]
    pub min_rebalance_age_days: u32,

    // --- Market data ----------------------------------------------------------

    /// Provider attempt order for quotes and history.
    #[serde(default = "default_provider_priority")]
    pub provider_priority: Vec<DataSource>,

    #[serde(default = "default_ttl_quote_secs")]
    pub ttl_quote_secs: u64,
    #[serde(default = "default_ttl_intraday_secs")]
    pub ttl_intraday_secs: u64,
    #[serde(default = "default_ttl_daily_secs")]
    pub ttl_daily_secs: u64,
    #[serde(default = "default_ttl_historical_secs")]
    pub ttl_historical_secs: u64,
    #[serde(default = "default_ttl_fundamentals_secs")]
    pub ttl_fundamentals_secs: u64,

    // --- Broker ---------------------------------------------------------------

    /// Paper-trading API base URL.
    #[serde(default = "default_broker_base_url")]
    pub broker_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_start: default_window_start(),
            window_minutes: default_window_minutes(),
            timezone: default_timezone(),
            holidays: Vec::new(),
            warmup_lead_minutes: default_warmup_lead_minutes(),
            worker_concurrency: default_worker_concurrency(),
            symphony_timeout_secs: default_symphony_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            submit_cutoff_secs: default_submit_cutoff_secs(),
            min_order_dollars: default_min_order_dollars(),
            cash_buffer: default_cash_buffer(),
            rebalance_corridor: default_corridor(),
            min_rebalance_age_days: 0,
            provider_priority: default_provider_priority(),
            ttl_quote_secs: default_ttl_quote_secs(),
            ttl_intraday_secs: default_ttl_intraday_secs(),
            ttl_daily_secs: default_ttl_daily_secs(),
            ttl_historical_secs: default_ttl_historical_secs(),
            ttl_fundamentals_secs: default_ttl_fundamentals_secs(),
            broker_base_url: default_broker_base_url(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            window_start = %config.window_start,
            workers = config.worker_concurrency,
            "engine config loaded"
        );
        Ok(config)
    }

    /// Persist the configuration with an atomic write (tmp then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Parsed exchange timezone.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {e}", self.timezone))
    }

    /// Parsed window opening time.
    pub fn window_start_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.window_start, "%H:%M")
            .with_context(|| format!("invalid window_start '{}'", self.window_start))
    }

}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.window_start, "15:50");
        assert_eq!(cfg.window_minutes, 10);
        assert_eq!(cfg.worker_concurrency, 8);
        assert_eq!(cfg.min_order_dollars, dec!(10));
        assert_eq!(cfg.rebalance_corridor, dec!(0.05));
        assert_eq!(cfg.min_rebalance_age_days, 0);
        assert_eq!(cfg.timezone, "America/New_York");
        assert_eq!(
            cfg.provider_priority,
            vec![DataSource::EodHistorical, DataSource::AlphaVantage]
        );
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.window_minutes, 10);
        assert_eq!(cfg.ttl_quote_secs, 60);
        assert_eq!(cfg.ttl_historical_secs, 86_400);
        assert_eq!(cfg.submit_cutoff_secs, 30);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "worker_concurrency": 4, "window_start": "09:35" }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.worker_concurrency, 4);
        assert_eq!(cfg.window_start, "09:35");
        assert_eq!(cfg.window_minutes, 10);
    }

    #[test]
    fn timezone_and_window_parse() {
        let cfg = EngineConfig::default();
        assert!(cfg.tz().is_ok());
        assert_eq!(
            cfg.window_start_time().unwrap(),
            NaiveTime::from_hms_opt(15, 50, 0).unwrap()
        );
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");

        let mut cfg = EngineConfig::default();
        cfg.worker_concurrency = 3;
        cfg.holidays = vec![NaiveDate::from_ymd_opt(2025, 12, 25).unwrap()];
        cfg.save(&path).unwrap();

        let reloaded = EngineConfig::load(&path).unwrap();
        assert_eq!(reloaded.worker_concurrency, 3);
        assert_eq!(reloaded.holidays.len(), 1);
    }
}
