// =============================================================================
// Market-data provider port
// =============================================================================
//
// Each upstream data vendor implements this trait; the facade owns the
// failover order, the cache, and the rate budget. Providers return
// `anyhow::Result` — classifying a failure as `DataUnavailable` is the
// facade's call, not theirs.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Where a piece of market data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    EodHistorical,
    AlphaVantage,
    Cache,
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EodHistorical => "eod-historical",
            Self::AlphaVantage => "alpha-vantage",
            Self::Cache => "cache",
        };
        f.write_str(s)
    }
}

/// Latest price snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    /// Daily change in percent.
    pub change_pct: f64,
    #[serde(default)]
    pub market_cap: Option<f64>,
    pub source: DataSource,
    pub as_of: DateTime<Utc>,
}

/// One daily (or intraday) price bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Search hit for symbol lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub exchange: Option<String>,
}

/// Company fundamentals subset the engine cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fundamentals {
    #[serde(default)]
    pub market_cap: Option<f64>,
}

/// Requested bar granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    Daily,
    Intraday,
}

impl Interval {
    pub fn token(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Intraday => "intraday",
        }
    }
}

/// Async port implemented by each vendor client.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Which vendor this client talks to.
    fn source(&self) -> DataSource;

    /// (max requests, per rolling window) this vendor tolerates.
    fn rate_budget(&self) -> (u32, std::time::Duration);

    async fn quote(&self, symbol: &str) -> anyhow::Result<Quote>;

    async fn historical(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> anyhow::Result<Vec<Bar>>;

    async fn search(&self, query: &str) -> anyhow::Result<Vec<SymbolInfo>>;

    async fn fundamentals(&self, symbol: &str) -> anyhow::Result<Fundamentals>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_source_serialises_kebab_case() {
        assert_eq!(serde_json::to_string(&DataSource::EodHistorical).unwrap(), "\"eod-historical\"");
        assert_eq!(serde_json::to_string(&DataSource::AlphaVantage).unwrap(), "\"alpha-vantage\"");
        let parsed: DataSource = serde_json::from_str("\"cache\"").unwrap();
        assert_eq!(parsed, DataSource::Cache);
    }

    #[test]
    fn quote_round_trips_through_json() {
        let quote = Quote {
            symbol: "SPY".into(),
            price: 512.34,
            volume: 1_000_000.0,
            change_pct: 0.45,
            market_cap: None,
            source: DataSource::EodHistorical,
            as_of: Utc::now(),
        };
        let json = serde_json::to_value(&quote).unwrap();
        let back: Quote = serde_json::from_value(json).unwrap();
        assert_eq!(back.symbol, "SPY");
        assert_eq!(back.source, DataSource::EodHistorical);
    }
}
