// =============================================================================
// Alpha Vantage client — broader intraday coverage, tight rate budget
// =============================================================================
//
// Every payload is a JSON object whose keys are prefixed ("05. price",
// "4. close"), and a throttled request comes back as HTTP 200 with a "Note"
// field — both quirks are handled here so the facade never sees them.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::{debug, instrument};

use super::provider::{Bar, DataSource, Fundamentals, Interval, MarketDataProvider, Quote, SymbolInfo};

/// Premium-tier allowance is 75 requests/minute; we stay under it.
const RATE_CAPACITY: u32 = 70;
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// REST client for the intraday-strength provider.
#[derive(Clone)]
pub struct AlphaVantageClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AlphaVantageClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://www.alphavantage.co")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
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
        // Throttling and bad symbols arrive as 200s with explanatory fields.
        if let Some(note) = body.get("Note").and_then(|v| v.as_str()) {
            anyhow::bail!("provider throttled the request: {note}");
        }
        if let Some(err) = body.get("Error Message").and_then(|v| v.as_str()) {
            anyhow::bail!("provider error: {err}");
        }
        Ok(body)
    }

    fn parse_field_f64(obj: &serde_json::Value, key: &str) -> Result<f64> {
        let raw = obj
            .get(key)
            .and_then(|v| v.as_str())
            .with_context(|| format!("response missing '{key}'"))?;
        raw.trim_end_matches('%')
            .parse::<f64>()
            .with_context(|| format!("failed to parse '{raw}' as f64"))
    }
}

#[async_trait]
impl MarketDataProvider for AlphaVantageClient {
    fn source(&self) -> DataSource {
        DataSource::AlphaVantage
    }

    fn rate_budget(&self) -> (u32, Duration) {
        (RATE_CAPACITY, RATE_WINDOW)
    }

    /// query?function=GLOBAL_QUOTE
    #[instrument(skip(self), name = "vantage::quote")]
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!(
            "{}/query?function=GLOBAL_QUOTE&symbol={}&apikey={}",
            self.base_url, symbol, self.api_key
        );
        let body = self.get_json(&url).await?;
        let quote = body
            .get("Global Quote")
            .context("response missing 'Global Quote'")?;

        let price = Self::parse_field_f64(quote, "05. price")?;
        let volume = Self::parse_field_f64(quote, "06. volume").unwrap_or(0.0);
        let change_pct = Self::parse_field_f64(quote, "10. change percent").unwrap_or(0.0);

        debug!(symbol, price, "quote fetched");
        Ok(Quote {
            symbol: symbol.to_uppercase(),
            price,
            volume,
            change_pct,
            market_cap: None,
            source: DataSource::AlphaVantage,
            as_of: Utc::now(),
        })
    }

    /// query?function=TIME_SERIES_DAILY (or INTRADAY for 60-minute bars)
    #[instrument(skip(self), name = "vantage::historical")]
    async fn historical(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> Result<Vec<Bar>> {
        let (function, series_key) = match interval {
            Interval::Daily => ("TIME_SERIES_DAILY", "Time Series (Daily)".to_string()),
            Interval::Intraday => ("TIME_SERIES_INTRADAY&interval=60min", "Time Series (60min)".to_string()),
        };
        let url = format!(
            "{}/query?function={}&symbol={}&outputsize=full&apikey={}",
            self.base_url, function, symbol, self.api_key
        );
        let body = self.get_json(&url).await?;
        let series = body
            .get(&series_key)
            .and_then(|v| v.as_object())
            .with_context(|| format!("response missing '{series_key}'"))?;

        let mut bars = Vec::with_capacity(series.len());
        for (stamp, fields) in series {
            // Intraday keys carry a time suffix; the date prefix is enough.
            let date = NaiveDate::parse_from_str(&stamp[..10], "%Y-%m-%d")
                .with_context(|| format!("bad series date '{stamp}'"))?;
            if date < start || date > end {
                continue;
            }
            bars.push(Bar {
                date,
                open: Self::parse_field_f64(fields, "1. open")?,
                high: Self::parse_field_f64(fields, "2. high")?,
                low: Self::parse_field_f64(fields, "3. low")?,
                close: Self::parse_field_f64(fields, "4. close")?,
                volume: Self::parse_field_f64(fields, "5. volume").unwrap_or(0.0),
            });
        }
        bars.sort_by_key(|b| b.date);

        debug!(symbol, count = bars.len(), "historical bars fetched");
        Ok(bars)
    }

    /// query?function=SYMBOL_SEARCH
    #[instrument(skip(self), name = "vantage::search")]
    async fn search(&self, query: &str) -> Result<Vec<SymbolInfo>> {
        let url = format!(
            "{}/query?function=SYMBOL_SEARCH&keywords={}&apikey={}",
            self.base_url, query, self.api_key
        );
        let body = self.get_json(&url).await?;
        let matches = body
            .get("bestMatches")
            .and_then(|v| v.as_array())
            .context("response missing 'bestMatches'")?;

        let results = matches
            .iter()
            .filter_map(|row| {
                Some(SymbolInfo {
                    symbol: row["1. symbol"].as_str()?.to_string(),
                    name: row["2. name"].as_str().unwrap_or_default().to_string(),
                    exchange: row["4. region"].as_str().map(str::to_string),
                })
            })
            .collect();
        Ok(results)
    }

    /// query?function=OVERVIEW — only the market cap is extracted.
    #[instrument(skip(self), name = "vantage::fundamentals")]
    async fn fundamentals(&self, symbol: &str) -> Result<Fundamentals> {
        let url = format!(
            "{}/query?function=OVERVIEW&symbol={}&apikey={}",
            self.base_url, symbol, self.api_key
        );
        let body = self.get_json(&url).await?;
        let market_cap = body
            .get("MarketCapitalization")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok());
        Ok(Fundamentals { market_cap })
    }
}

impl std::fmt::Debug for AlphaVantageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlphaVantageClient")
            .field("api_key", &"<redacted>")
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
    fn parses_prefixed_fields_and_percent_suffix() {
        let quote = json!({
            "05. price": "512.3400",
            "06. volume": "1234567",
            "10. change percent": "0.4500%"
        });
        assert_eq!(AlphaVantageClient::parse_field_f64(&quote, "05. price").unwrap(), 512.34);
        assert_eq!(AlphaVantageClient::parse_field_f64(&quote, "06. volume").unwrap(), 1_234_567.0);
        assert_eq!(
            AlphaVantageClient::parse_field_f64(&quote, "10. change percent").unwrap(),
            0.45
        );
        assert!(AlphaVantageClient::parse_field_f64(&quote, "absent").is_err());
    }

    #[test]
    fn debug_redacts_the_key() {
        let client = AlphaVantageClient::new("super-secret");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn rate_budget_is_tight() {
        let client = AlphaVantageClient::new("k");
        let (capacity, window) = client.rate_budget();
        assert!(capacity <= 75);
        assert_eq!(window, Duration::from_secs(60));
    }
}
