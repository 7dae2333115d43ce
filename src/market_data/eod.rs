// =============================================================================
// EOD Historical Data client — deep daily history (back to 2007)
// =============================================================================
//
// The API token travels as a query parameter; it is never logged. Responses
// deliver numbers both as JSON numbers and as strings, so every field goes
// through the tolerant parser.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::{debug, instrument};

use super::provider::{Bar, DataSource, Fundamentals, Interval, MarketDataProvider, Quote, SymbolInfo};

/// Documented plan allowance is 1000 requests/minute; we stay under it.
const RATE_CAPACITY: u32 = 900;
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// REST client for the deep-history provider.
#[derive(Clone)]
pub struct EodHistoricalClient {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl EodHistoricalClient {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self::with_base_url(api_token, "https://eodhistoricaldata.com/api")
    }

    pub fn with_base_url(api_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_token: api_token.into(),
            base_url: base_url.into(),
            client,
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self.client.get(url).send().await.context("request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response body")?;

        if !status.is_success() {
            anyhow::bail!("provider returned {status}: {body}");
        }
        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(n) = val.as_f64() {
            Ok(n)
        } else if let Some(s) = val.as_str() {
            s.parse::<f64>().with_context(|| format!("failed to parse '{s}' as f64"))
        } else {
            anyhow::bail!("expected number or string, got: {val}")
        }
    }
}

#[async_trait]
impl MarketDataProvider for EodHistoricalClient {
    fn source(&self) -> DataSource {
        DataSource::EodHistorical
    }

    fn rate_budget(&self) -> (u32, Duration) {
        (RATE_CAPACITY, RATE_WINDOW)
    }

    /// GET /real-time/{symbol}.US
    #[instrument(skip(self), name = "eod::quote")]
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!(
            "{}/real-time/{}.US?api_token={}&fmt=json",
            self.base_url, symbol, self.api_token
        );
        let body = self.get_json(&url).await?;

        let price = Self::parse_f64(&body["close"]).context("quote missing 'close'")?;
        let volume = Self::parse_f64(&body["volume"]).unwrap_or(0.0);
        let change_pct = Self::parse_f64(&body["change_p"]).unwrap_or(0.0);

        debug!(symbol, price, "quote fetched");
        Ok(Quote {
            symbol: symbol.to_uppercase(),
            price,
            volume,
            change_pct,
            market_cap: None,
            source: DataSource::EodHistorical,
            as_of: Utc::now(),
        })
    }

    /// GET /eod/{symbol}.US?from=&to=&period=d
    #[instrument(skip(self), name = "eod::historical")]
    async fn historical(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> Result<Vec<Bar>> {
        // This vendor serves daily bars only; intraday requests degrade to
        // daily granularity.
        let _ = interval;
        let url = format!(
            "{}/eod/{}.US?from={}&to={}&period=d&api_token={}&fmt=json",
            self.base_url, symbol, start, end, self.api_token
        );
        let body = self.get_json(&url).await?;
        let rows = body.as_array().context("historical response is not an array")?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in rows {
            let date_str = row["date"].as_str().context("bar missing 'date'")?;
            let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
                .with_context(|| format!("bad bar date '{date_str}'"))?;
            bars.push(Bar {
                date,
                open: Self::parse_f64(&row["open"])?,
                high: Self::parse_f64(&row["high"])?,
                low: Self::parse_f64(&row["low"])?,
                close: Self::parse_f64(&row["close"])?,
                volume: Self::parse_f64(&row["volume"]).unwrap_or(0.0),
            });
        }
        bars.sort_by_key(|b| b.date);

        debug!(symbol, count = bars.len(), "historical bars fetched");
        Ok(bars)
    }

    /// GET /search/{query}
    #[instrument(skip(self), name = "eod::search")]
    async fn search(&self, query: &str) -> Result<Vec<SymbolInfo>> {
        let url = format!("{}/search/{}?api_token={}&fmt=json", self.base_url, query, self.api_token);
        let body = self.get_json(&url).await?;
        let rows = body.as_array().context("search response is not an array")?;

        let results = rows
            .iter()
            .filter_map(|row| {
                Some(SymbolInfo {
                    symbol: row["Code"].as_str()?.to_string(),
                    name: row["Name"].as_str().unwrap_or_default().to_string(),
                    exchange: row["Exchange"].as_str().map(str::to_string),
                })
            })
            .collect();
        Ok(results)
    }

    /// GET /fundamentals/{symbol}.US — only the market cap is extracted.
    #[instrument(skip(self), name = "eod::fundamentals")]
    async fn fundamentals(&self, symbol: &str) -> Result<Fundamentals> {
        let url = format!(
            "{}/fundamentals/{}.US?api_token={}&fmt=json",
            self.base_url, symbol, self.api_token
        );
        let body = self.get_json(&url).await?;
        let market_cap = body["Highlights"]["MarketCapitalization"]
            .as_f64()
            .or_else(|| Self::parse_f64(&body["Highlights"]["MarketCapitalization"]).ok());
        Ok(Fundamentals { market_cap })
    }
}

impl std::fmt::Debug for EodHistoricalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EodHistoricalClient")
            .field("api_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_f64_accepts_numbers_and_strings() {
        assert_eq!(EodHistoricalClient::parse_f64(&json!(1.5)).unwrap(), 1.5);
        assert_eq!(EodHistoricalClient::parse_f64(&json!("2.25")).unwrap(), 2.25);
        assert!(EodHistoricalClient::parse_f64(&json!(null)).is_err());
        assert!(EodHistoricalClient::parse_f64(&json!("abc")).is_err());
    }

    #[test]
    fn debug_redacts_the_token() {
        let client = EodHistoricalClient::new("super-secret");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn rate_budget_is_bounded() {
        let client = EodHistoricalClient::new("t");
        let (capacity, window) = client.rate_budget();
        assert!(capacity <= 1000);
        assert_eq!(window, Duration::from_secs(60));
    }
}
