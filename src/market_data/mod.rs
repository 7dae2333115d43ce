// =============================================================================
// Market-Data Facade — single gateway for quotes, history, and indicators
// =============================================================================
//
// The facade owns the provider clients, the TTL cache, and one rate-limit
// bucket per provider. Every read follows the same shape: cache first, then
// providers in configured priority order with one retry each, then a typed
// `DataUnavailable` naming the last underlying cause.
//
// A race between two workers fetching the same key is allowed: at worst the
// upstream is called twice and the second write replaces the first with
// identical data.
// =============================================================================

pub mod cache;
pub mod eod;
pub mod provider;
pub mod rate_limit;
pub mod vantage;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::indicators;
use crate::symphony::tree::MetricFn;
use cache::{cache_key, DataCache};
pub use provider::{Bar, DataSource, Fundamentals, Interval, MarketDataProvider, Quote, SymbolInfo};
use rate_limit::{RateBudgetSnapshot, RateLimiter};

/// Attempts per provider before falling through to the next one.
const ATTEMPTS_PER_PROVIDER: usize = 2;

/// Earliest date the deep-history provider covers.
pub const EXTENDED_HISTORY_START: &str = "2007-01-01";

/// A request spanning more than this many days is cached in the
/// historical-extended bucket (longer TTL).
const EXTENDED_SPAN_DAYS: i64 = 370;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// TTLs per cache-entry class.
#[derive(Debug, Clone, Copy)]
pub struct FacadeTtls {
    pub quote: Duration,
    pub intraday: Duration,
    pub daily: Duration,
    pub historical: Duration,
    pub fundamentals: Duration,
}

impl Default for FacadeTtls {
    fn default() -> Self {
        Self {
            quote: Duration::from_secs(60),
            intraday: Duration::from_secs(300),
            daily: Duration::from_secs(3600),
            historical: Duration::from_secs(86_400),
            fundamentals: Duration::from_secs(604_800),
        }
    }
}

impl FacadeTtls {
    pub fn from_config(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            quote: Duration::from_secs(cfg.ttl_quote_secs),
            intraday: Duration::from_secs(cfg.ttl_intraday_secs),
            daily: Duration::from_secs(cfg.ttl_daily_secs),
            historical: Duration::from_secs(cfg.ttl_historical_secs),
            fundamentals: Duration::from_secs(cfg.ttl_fundamentals_secs),
        }
    }
}

/// Result of a concurrent quote fan-out; partial results are allowed.
#[derive(Debug, Clone, Serialize)]
pub struct BatchQuotes {
    pub quotes: BTreeMap<String, Quote>,
    pub missing: Vec<String>,
}

/// Outcome of a warmup pass.
#[derive(Debug, Clone, Serialize)]
pub struct WarmupReport {
    pub warmed: usize,
    pub failed: Vec<String>,
}

type MemoKey = (String, MetricFn, u32, Option<String>, NaiveDate);

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

pub struct MarketDataFacade {
    /// Providers in failover order.
    providers: Vec<Arc<dyn MarketDataProvider>>,
    limiters: HashMap<DataSource, RateLimiter>,
    cache: DataCache,
    ttls: FacadeTtls,
    /// Bound on concurrent in-flight requests during fan-out.
    max_in_flight: usize,
    indicator_memo: Mutex<HashMap<MemoKey, Option<f64>>>,
}

impl MarketDataFacade {
    pub fn new(
        providers: Vec<Arc<dyn MarketDataProvider>>,
        ttls: FacadeTtls,
        max_in_flight: usize,
    ) -> Self {
        let limiters = providers
            .iter()
            .map(|p| {
                let (capacity, window) = p.rate_budget();
                let name = match p.source() {
                    DataSource::EodHistorical => "eod-historical",
                    DataSource::AlphaVantage => "alpha-vantage",
                    DataSource::Cache => "cache",
                };
                (p.source(), RateLimiter::new(name, capacity as usize, window))
            })
            .collect();

        info!(providers = providers.len(), max_in_flight, "market-data facade initialised");
        Self {
            providers,
            limiters,
            cache: DataCache::new(),
            ttls,
            max_in_flight: max_in_flight.max(1),
            indicator_memo: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// Latest price + volume + daily change, cache-first.
    #[instrument(skip(self), name = "facade::quote")]
    pub async fn quote(&self, symbol: &str) -> Result<Quote> {
        let key = cache_key("quote", symbol, &[]);
        if let Some(value) = self.cache.get(&key) {
            if let Ok(quote) = serde_json::from_value::<Quote>(value) {
                debug!(symbol, "quote served from cache");
                return Ok(quote);
            }
        }

        let mut last_cause = "no providers configured".to_string();
        for provider in &self.providers {
            for attempt in 1..=ATTEMPTS_PER_PROVIDER {
                self.limiter(provider.source()).acquire().await;
                match provider.quote(symbol).await {
                    Ok(quote) => {
                        if let Ok(value) = serde_json::to_value(&quote) {
                            self.cache.set(&key, value, self.ttls.quote);
                        }
                        return Ok(quote);
                    }
                    Err(e) => {
                        warn!(
                            symbol,
                            source = %provider.source(),
                            attempt,
                            error = %e,
                            "quote attempt failed"
                        );
                        last_cause = e.to_string();
                    }
                }
            }
        }

        Err(EngineError::DataUnavailable {
            symbol: symbol.to_string(),
            cause: last_cause,
        })
    }

    /// Concurrent fan-out with at most `max_in_flight` requests in flight.
    /// Missing tickers are reported, not fatal.
    #[instrument(skip(self, symbols), name = "facade::batch_quotes", fields(count = symbols.len()))]
    pub async fn batch_quotes(&self, symbols: &[String]) -> BatchQuotes {
        let results: Vec<(String, Result<Quote>)> = stream::iter(symbols.iter().cloned())
            .map(|symbol| async move {
                let result = self.quote(&symbol).await;
                (symbol, result)
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;

        let mut quotes = BTreeMap::new();
        let mut missing = Vec::new();
        for (symbol, result) in results {
            match result {
                Ok(q) => {
                    quotes.insert(symbol, q);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "batch quote missing");
                    missing.push(symbol);
                }
            }
        }
        missing.sort();
        BatchQuotes { quotes, missing }
    }

    // -------------------------------------------------------------------------
    // Historical bars
    // -------------------------------------------------------------------------

    /// Date-ordered bars for `[start, end]`. Cache keys are range-wide (the
    /// stored series covers a broad span) and the requested range is filtered
    /// out after retrieval.
    #[instrument(skip(self), name = "facade::historical")]
    pub async fn historical(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> Result<Vec<Bar>> {
        let span_days = (end - start).num_days();
        let extended = interval == Interval::Daily && span_days > EXTENDED_SPAN_DAYS;
        let bucket = if extended { "extended" } else { "recent" };
        let key = cache_key("historical", symbol, &[("interval", interval.token()), ("range", bucket)]);

        if let Some(value) = self.cache.get(&key) {
            if let Ok(bars) = serde_json::from_value::<Vec<Bar>>(value) {
                debug!(symbol, count = bars.len(), "historical served from cache");
                return Ok(filter_bars(bars, start, end));
            }
        }

        // Fetch a span wider than requested so later narrower requests hit
        // the same cache entry.
        let fetch_start = if extended {
            EXTENDED_HISTORY_START.parse().unwrap_or(start)
        } else if interval == Interval::Daily {
            end - chrono::Duration::days(EXTENDED_SPAN_DAYS)
        } else {
            start
        };

        let ttl = if extended {
            self.ttls.historical
        } else if interval == Interval::Daily {
            self.ttls.daily
        } else {
            self.ttls.intraday
        };

        let mut last_cause = "no providers configured".to_string();
        for provider in &self.providers {
            for attempt in 1..=ATTEMPTS_PER_PROVIDER {
                self.limiter(provider.source()).acquire().await;
                match provider.historical(symbol, fetch_start, end, interval).await {
                    Ok(bars) => {
                        if let Ok(value) = serde_json::to_value(&bars) {
                            self.cache.set(&key, value, ttl);
                        }
                        return Ok(filter_bars(bars, start, end));
                    }
                    Err(e) => {
                        warn!(
                            symbol,
                            source = %provider.source(),
                            attempt,
                            error = %e,
                            "historical attempt failed"
                        );
                        last_cause = e.to_string();
                    }
                }
            }
        }

        Err(EngineError::DataUnavailable {
            symbol: symbol.to_string(),
            cause: last_cause,
        })
    }

    // -------------------------------------------------------------------------
    // Indicators
    // -------------------------------------------------------------------------

    /// Compute one metric for a symbol at `as_of`, memoised per
    /// (symbol, fn, window, benchmark, as_of).
    #[instrument(skip(self), name = "facade::indicator")]
    pub async fn indicator(
        &self,
        symbol: &str,
        func: MetricFn,
        window: u32,
        benchmark: Option<&str>,
        as_of: NaiveDate,
    ) -> Result<Option<f64>> {
        let memo_key = (
            symbol.to_uppercase(),
            func,
            window,
            benchmark.map(str::to_uppercase),
            as_of,
        );
        if let Some(value) = self.indicator_memo.lock().get(&memo_key) {
            return Ok(*value);
        }

        let closes = self.closes_up_to(symbol, as_of).await?;
        let bench_closes = match benchmark {
            Some(b) => Some(self.closes_up_to(b, as_of).await?),
            None => None,
        };

        let value = compute_metric(func, window, &closes, bench_closes.as_deref());
        self.indicator_memo.lock().insert(memo_key, value);
        Ok(value)
    }

    /// Compute a set of metrics sharing one window (used by the CLI and the
    /// warmup path).
    pub async fn indicators(
        &self,
        symbol: &str,
        funcs: &[MetricFn],
        window: u32,
        as_of: NaiveDate,
    ) -> Result<BTreeMap<MetricFn, Option<f64>>> {
        let mut out = BTreeMap::new();
        for func in funcs {
            let value = self.indicator(symbol, *func, window, None, as_of).await?;
            out.insert(*func, value);
        }
        Ok(out)
    }

    /// Newest-first closes up to and including `as_of`.
    pub async fn closes_up_to(&self, symbol: &str, as_of: NaiveDate) -> Result<Vec<f64>> {
        let start = as_of - chrono::Duration::days(EXTENDED_SPAN_DAYS + 200);
        let bars = self.historical(symbol, start, as_of, Interval::Daily).await?;
        Ok(bars.iter().rev().map(|b| b.close).collect())
    }

    // -------------------------------------------------------------------------
    // Fundamentals
    // -------------------------------------------------------------------------

    /// Market capitalisation, cache-first. Fundamentals move slowly, so they
    /// carry the longest TTL.
    #[instrument(skip(self), name = "facade::market_cap")]
    pub async fn market_cap(&self, symbol: &str) -> Result<Option<f64>> {
        let key = cache_key("fundamentals", symbol, &[]);
        if let Some(value) = self.cache.get(&key) {
            if let Ok(f) = serde_json::from_value::<Fundamentals>(value) {
                return Ok(f.market_cap);
            }
        }

        let mut last_cause = "no providers configured".to_string();
        for provider in &self.providers {
            self.limiter(provider.source()).acquire().await;
            match provider.fundamentals(symbol).await {
                Ok(f) => {
                    if let Ok(value) = serde_json::to_value(&f) {
                        self.cache.set(&key, value, self.ttls.fundamentals);
                    }
                    return Ok(f.market_cap);
                }
                Err(e) => {
                    warn!(symbol, source = %provider.source(), error = %e, "fundamentals attempt failed");
                    last_cause = e.to_string();
                }
            }
        }

        Err(EngineError::DataUnavailable {
            symbol: symbol.to_string(),
            cause: last_cause,
        })
    }

    // -------------------------------------------------------------------------
    // Warmup
    // -------------------------------------------------------------------------

    /// Pre-populate the cache ahead of the execution window. Failures are
    /// reported but never abort the warmup.
    #[instrument(skip(self, symbols), name = "facade::warmup", fields(count = symbols.len()))]
    pub async fn warmup(&self, symbols: &[String], as_of: NaiveDate) -> WarmupReport {
        let batch = self.batch_quotes(symbols).await;

        let results: Vec<(String, bool)> = stream::iter(symbols.iter().cloned())
            .map(|symbol| async move {
                let start = as_of - chrono::Duration::days(EXTENDED_SPAN_DAYS + 200);
                let ok = self
                    .historical(&symbol, start, as_of, Interval::Daily)
                    .await
                    .is_ok();
                (symbol, ok)
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;

        let mut failed: Vec<String> = batch.missing;
        for (symbol, ok) in results {
            if !ok && !failed.contains(&symbol) {
                failed.push(symbol);
            }
        }
        failed.sort();
        failed.dedup();

        let warmed = symbols.len() - failed.len();
        info!(warmed, failed = failed.len(), "cache warmup finished");
        WarmupReport { warmed, failed }
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    /// Rate-budget usage per provider since each bucket's rolling reset.
    pub fn budget(&self) -> Vec<RateBudgetSnapshot> {
        let mut snaps: Vec<_> = self.limiters.values().map(|l| l.snapshot()).collect();
        snaps.sort_by(|a, b| a.provider.cmp(&b.provider));
        snaps
    }

    pub fn cache_stats(&self) -> cache::CacheStats {
        self.cache.stats()
    }

    fn limiter(&self, source: DataSource) -> &RateLimiter {
        self.limiters.get(&source).expect("limiter exists for every provider")
    }
}

impl std::fmt::Debug for MarketDataFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataFacade")
            .field("providers", &self.providers.len())
            .field("cache", &self.cache)
            .finish()
    }
}

fn filter_bars(bars: Vec<Bar>, start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
    bars.into_iter().filter(|b| b.date >= start && b.date <= end).collect()
}

// ---------------------------------------------------------------------------
// Metric dispatch
// ---------------------------------------------------------------------------

/// Evaluate one metric over newest-first closes. `None` is the explicit
/// no-value signal and must never be coerced to zero by callers.
pub fn compute_metric(
    func: MetricFn,
    window: u32,
    closes: &[f64],
    benchmark_closes: Option<&[f64]>,
) -> Option<f64> {
    let w = window as usize;
    match func {
        MetricFn::CurrentPrice => closes.first().copied(),
        MetricFn::CumulativeReturn => indicators::returns::cumulative_return(closes, w),
        MetricFn::EmaPrice => indicators::ma::ema(closes, w),
        MetricFn::SmaPrice => indicators::ma::sma(closes, w),
        MetricFn::MaxDrawdown => indicators::drawdown::max_drawdown(closes, w),
        MetricFn::MovingAverageReturn => indicators::ma::moving_average_return(closes, w),
        MetricFn::Rsi => indicators::rsi::rsi(closes, w),
        MetricFn::StdevPrice => indicators::spread::stdev(closes, w),
        MetricFn::StdevReturn => {
            let rets = indicators::returns_from_prices(closes);
            indicators::spread::stdev(&rets, w)
        }
        MetricFn::Sharpe => {
            let rets = indicators::returns_from_prices(closes);
            indicators::sharpe::sharpe(&rets, w, indicators::sharpe::DEFAULT_RISK_FREE_RATE)
        }
        MetricFn::Volatility => {
            let rets = indicators::returns_from_prices(closes);
            indicators::spread::volatility(&rets, w)
        }
        MetricFn::Beta => {
            let rets = indicators::returns_from_prices(closes);
            let bench = indicators::returns_from_prices(benchmark_closes?);
            indicators::relation::beta(&rets, &bench, w)
        }
        MetricFn::Alpha => {
            let rets = indicators::returns_from_prices(closes);
            let bench = indicators::returns_from_prices(benchmark_closes?);
            indicators::relation::alpha_default_rf(&rets, &bench, w)
        }
        MetricFn::Correlation => {
            let rets = indicators::returns_from_prices(closes);
            let bench = indicators::returns_from_prices(benchmark_closes?);
            indicators::relation::correlation(&rets, &bench, w)
        }
    }
}
