// =============================================================================
// Evaluation data context — snapshots plus memoised metric lookup
// =============================================================================
//
// The context is assembled BEFORE evaluation from the tree's requirement
// manifest; evaluation itself never suspends. Metric values memoise per
// (ticker, fn, window, benchmark) so repeated references inside one tree are
// computed once.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::market_data::{compute_metric, MarketDataFacade};
use crate::symphony::tree::{MetricFn, MetricRef};
use crate::symphony::validator::RequirementManifest;

/// Market data for one (ticker, as-of-date): live price, newest-first closes,
/// volume, and optional market cap.
#[derive(Debug, Clone)]
pub struct AssetSnapshot {
    pub ticker: String,
    pub as_of: NaiveDate,
    pub price: f64,
    /// Historical closes, newest first.
    pub closes: Vec<f64>,
    pub volume: f64,
    pub market_cap: Option<f64>,
}

type MetricKey = (String, MetricFn, u32, Option<String>);

/// Immutable snapshot map with an interior metric memo.
pub struct DataContext {
    snapshots: BTreeMap<String, AssetSnapshot>,
    memo: Mutex<HashMap<MetricKey, Option<f64>>>,
}

impl DataContext {
    pub fn new(snapshots: impl IntoIterator<Item = AssetSnapshot>) -> Self {
        let snapshots = snapshots
            .into_iter()
            .map(|s| (s.ticker.clone(), s))
            .collect();
        Self {
            snapshots,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Build a context for every ticker in the manifest. A ticker whose data
    /// cannot be fetched is simply absent from the context — the evaluator
    /// decides per step whether that is fatal.
    pub async fn load(
        facade: &MarketDataFacade,
        manifest: &RequirementManifest,
        as_of: NaiveDate,
    ) -> Result<Self> {
        let mut snapshots = Vec::new();
        for ticker in &manifest.tickers {
            let quote = match facade.quote(ticker).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "snapshot skipped — no quote");
                    continue;
                }
            };
            let closes = match facade.closes_up_to(ticker, as_of).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "snapshot skipped — no history");
                    continue;
                }
            };
            let market_cap = match quote.market_cap {
                Some(cap) => Some(cap),
                None => facade.market_cap(ticker).await.ok().flatten(),
            };
            snapshots.push(AssetSnapshot {
                ticker: ticker.clone(),
                as_of,
                price: quote.price,
                closes,
                volume: quote.volume,
                market_cap,
            });
        }
        debug!(loaded = snapshots.len(), requested = manifest.tickers.len(), "data context loaded");
        Ok(Self::new(snapshots))
    }

    pub fn has(&self, ticker: &str) -> bool {
        self.snapshots.contains_key(ticker)
    }

    pub fn snapshot(&self, ticker: &str) -> Option<&AssetSnapshot> {
        self.snapshots.get(ticker)
    }

    pub fn price(&self, ticker: &str) -> Option<f64> {
        self.snapshots.get(ticker).map(|s| s.price)
    }

    pub fn market_cap(&self, ticker: &str) -> Option<f64> {
        self.snapshots.get(ticker).and_then(|s| s.market_cap)
    }

    pub fn tickers(&self) -> impl Iterator<Item = &String> {
        self.snapshots.keys()
    }

    /// Memoised metric evaluation. `None` is the explicit no-value signal —
    /// the caller must fail closed (condition false / asset dropped), never
    /// substitute zero.
    pub fn metric(&self, mref: &MetricRef) -> Option<f64> {
        self.metric_parts(mref.func, mref.window, &mref.ticker, mref.benchmark.as_deref())
    }

    pub fn metric_parts(
        &self,
        func: MetricFn,
        window: u32,
        ticker: &str,
        benchmark: Option<&str>,
    ) -> Option<f64> {
        let key = (
            ticker.to_string(),
            func,
            window,
            benchmark.map(str::to_string),
        );
        if let Some(cached) = self.memo.lock().get(&key) {
            return *cached;
        }

        let value = self.compute(func, window, ticker, benchmark);
        self.memo.lock().insert(key, value);
        value
    }

    fn compute(
        &self,
        func: MetricFn,
        window: u32,
        ticker: &str,
        benchmark: Option<&str>,
    ) -> Option<f64> {
        let snapshot = self.snapshots.get(ticker)?;

        // The live quote wins over the last close for current-price.
        if func == MetricFn::CurrentPrice {
            return Some(snapshot.price);
        }

        let bench_closes = match benchmark {
            Some(b) => Some(self.snapshots.get(b)?.closes.as_slice()),
            None => None,
        };
        compute_metric(func, window, &snapshot.closes, bench_closes)
    }
}

impl std::fmt::Debug for DataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("tickers", &self.snapshots.len())
            .finish()
    }
}
