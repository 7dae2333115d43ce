// =============================================================================
// Daily Scheduler — drives the execution window end to end
// =============================================================================
//
// Sequence per trading day (exchange-local clock, weekends and configured
// holidays skipped):
//
//   T-5 min   warm the market-data cache with every active symphony's
//             requirement tickers (failure logged, never blocking)
//   T         enumerate active symphonies whose owner has a broker, filter
//             through the arbiter, and fan the eligible set out over a
//             bounded worker pool in ascending symphony-id order
//   T+window  hard deadline: no new dispatch, executors stop submitting
//   after    position reconciliation per user and performance recording
//
// Workers share nothing mutable beyond the facade's cache and the row-locked
// stores. One symphony's failure is contained by the failure handler and
// never aborts another.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc, Weekday};
use parking_lot::RwLock;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::arbiter::Arbiter;
use crate::broker::BrokerPort;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::evaluator::context::DataContext;
use crate::evaluator::{AllocationPolicy, Evaluator};
use crate::events::{EngineEvent, EventBus};
use crate::executor::TradeExecutor;
use crate::failure::{policy_for, FailureHandler, Retry};
use crate::market_data::MarketDataFacade;
use crate::planner::Planner;
use crate::reconcile::reconcile_positions;
use crate::store::EngineStores;
use crate::symphony::validator::validate;
use crate::types::{ExecutionRecord, ExecutionStatus, Symphony, CASH_TICKER};

// ---------------------------------------------------------------------------
// Broker registry
// ---------------------------------------------------------------------------

/// User -> broker connection. A symphony whose owner has no entry here never
/// enters the window.
pub struct BrokerRegistry {
    map: RwLock<HashMap<String, Arc<dyn BrokerPort>>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()) }
    }

    pub fn register(&self, user_id: impl Into<String>, broker: Arc<dyn BrokerPort>) {
        self.map.write().insert(user_id.into(), broker);
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<dyn BrokerPort>> {
        self.map.read().get(user_id).cloned()
    }

    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.map.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Window summary
// ---------------------------------------------------------------------------

/// Aggregate outcome of one execution window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowSummary {
    pub date: Option<NaiveDate>,
    pub total_active: usize,
    pub eligible: usize,
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub liquidations: usize,
}

enum SymphonyOutcome {
    Executed(ExecutionStatus),
    Failed { liquidated: bool },
    Skipped,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    cfg: EngineConfig,
    stores: Arc<EngineStores>,
    facade: Arc<MarketDataFacade>,
    brokers: Arc<BrokerRegistry>,
    events: EventBus,
}

impl Scheduler {
    pub fn new(
        cfg: EngineConfig,
        stores: Arc<EngineStores>,
        facade: Arc<MarketDataFacade>,
        brokers: Arc<BrokerRegistry>,
        events: EventBus,
    ) -> Self {
        Self { cfg, stores, facade, brokers, events }
    }

    // -------------------------------------------------------------------------
    // Daemon loop
    // -------------------------------------------------------------------------

    /// Run windows forever (until the task is aborted or ctrl-c at the
    /// binary level).
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            let start = self.next_window_start(Utc::now())?;
            let warmup_at = start - chrono::Duration::minutes(self.cfg.warmup_lead_minutes as i64);
            let deadline = start + chrono::Duration::minutes(self.cfg.window_minutes as i64);
            let local_date = start.with_timezone(&self.cfg.tz()?).date_naive();

            info!(
                window_start = %start,
                deadline = %deadline,
                date = %local_date,
                "next execution window scheduled"
            );

            sleep_until_utc(warmup_at).await;
            self.warmup(local_date).await;

            sleep_until_utc(start).await;
            let summary = self.run_window(local_date, deadline).await;
            info!(?summary, "execution window finished");
        }
    }

    /// Drive exactly one window for `date` (operator `run-once`).
    pub async fn run_once(&self, date: NaiveDate) -> WindowSummary {
        self.warmup(date).await;
        let deadline = Utc::now() + chrono::Duration::minutes(self.cfg.window_minutes as i64);
        self.run_window(date, deadline).await
    }

    // -------------------------------------------------------------------------
    // Warmup
    // -------------------------------------------------------------------------

    /// Pre-fetch data for the union of tickers across active symphonies.
    pub async fn warmup(&self, date: NaiveDate) {
        let mut tickers = std::collections::BTreeSet::new();
        for symphony in self.stores.symphonies.list_active() {
            match validate(&symphony.tree) {
                Ok(validated) => tickers.extend(validated.manifest.tickers),
                Err(e) => warn!(symphony_id = %symphony.id, error = %e, "warmup skipped symphony"),
            }
        }
        if tickers.is_empty() {
            return;
        }

        let symbols: Vec<String> = tickers.into_iter().collect();
        let report = self.facade.warmup(&symbols, date).await;
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "warmup incomplete — window proceeds regardless");
        }
    }

    // -------------------------------------------------------------------------
    // One window
    // -------------------------------------------------------------------------

    pub async fn run_window(&self, date: NaiveDate, deadline: DateTime<Utc>) -> WindowSummary {
        let mut summary = WindowSummary { date: Some(date), ..WindowSummary::default() };

        // Stable order: symphonies are drawn by ascending id so backpressure
        // never starves one user's symphonies.
        let active: Vec<Symphony> = self
            .stores
            .symphonies
            .list_active()
            .into_iter()
            .filter(|s| self.brokers.get(&s.user_id).is_some())
            .collect();
        summary.total_active = active.len();

        let arbiter = Arbiter::new(self.cfg.rebalance_corridor, self.cfg.min_rebalance_age_days);
        let mut eligible = Vec::new();
        for symphony in active {
            let positions = self
                .stores
                .positions
                .list_for_symphony(&symphony.user_id, &symphony.id);
            let targets = self
                .stores
                .executions
                .latest_for(&symphony.id)
                .map(|r| r.targets);
            let (execute, reason) =
                arbiter.should_execute(&symphony, &positions, targets.as_ref(), date);
            if execute {
                eligible.push((symphony, reason));
            } else {
                summary.skipped += 1;
                self.stores.executions.append(ExecutionRecord {
                    symphony_id: symphony.id.clone(),
                    user_id: symphony.user_id.clone(),
                    window_date: date,
                    started_at: Utc::now(),
                    finished_at: Some(Utc::now()),
                    eligibility_reason: reason,
                    targets: targets.unwrap_or_default(),
                    order_ids: Vec::new(),
                    status: ExecutionStatus::Skipped,
                    failures: Vec::new(),
                });
            }
        }
        summary.eligible = eligible.len();
        info!(
            date = %date,
            active = summary.total_active,
            eligible = summary.eligible,
            "window dispatch starting"
        );

        // Bounded fan-out; each symphony runs to completion on its worker.
        let semaphore = Arc::new(Semaphore::new(self.cfg.worker_concurrency.max(1)));
        let mut set: JoinSet<SymphonyOutcome> = JoinSet::new();

        for (symphony, reason) in eligible {
            let permit_source = semaphore.clone();
            let this = self.clone_refs();
            set.spawn(async move {
                let _permit = match permit_source.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return SymphonyOutcome::Skipped,
                };
                if Utc::now() >= deadline {
                    warn!(symphony_id = %symphony.id, "deadline reached before dispatch");
                    return SymphonyOutcome::Skipped;
                }
                this.run_symphony(symphony, reason, date, deadline).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(SymphonyOutcome::Executed(_)) => summary.executed += 1,
                Ok(SymphonyOutcome::Failed { liquidated }) => {
                    summary.failed += 1;
                    if liquidated {
                        summary.liquidations += 1;
                    }
                }
                Ok(SymphonyOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    error!(error = %e, "symphony worker panicked");
                    summary.failed += 1;
                }
            }
        }

        self.post_window(date).await;
        summary
    }

    // -------------------------------------------------------------------------
    // One symphony
    // -------------------------------------------------------------------------

    async fn run_symphony(
        &self,
        symphony: Symphony,
        reason: String,
        date: NaiveDate,
        deadline: DateTime<Utc>,
    ) -> SymphonyOutcome {
        let remaining = (deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        let budget = remaining.min(Duration::from_secs(self.cfg.symphony_timeout_secs));

        let attempt = tokio::time::timeout(
            budget,
            self.execute_symphony(&symphony, &reason, date, deadline),
        )
        .await;

        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err((
                EngineError::Timeout(format!("symphony {} exceeded its time budget", symphony.id)),
                0,
            )),
        };

        match result {
            Ok(status) => {
                self.events.publish(EngineEvent::SymphonyCompleted {
                    symphony_id: symphony.id.clone(),
                    status,
                });
                SymphonyOutcome::Executed(status)
            }
            Err((err, rejections)) => {
                let Some(broker) = self.brokers.get(&symphony.user_id) else {
                    return SymphonyOutcome::Failed { liquidated: false };
                };
                let handler = FailureHandler::new(
                    broker,
                    self.stores.clone(),
                    self.events.clone(),
                    Duration::from_millis(self.cfg.poll_interval_ms),
                );

                // A blocked account is critical for the whole user, not just
                // this symphony.
                let user_critical =
                    matches!(&err, EngineError::BrokerAuth(msg) if msg.contains("blocked"));
                let liquidation = if user_critical {
                    let events = handler
                        .handle_user_critical(&symphony.user_id, &err, deadline)
                        .await;
                    if events.is_empty() { None } else { events.into_iter().next() }
                } else {
                    handler
                        .handle_symphony_error(&symphony, &err, rejections, false, deadline)
                        .await
                };

                self.stores.executions.append(ExecutionRecord {
                    symphony_id: symphony.id.clone(),
                    user_id: symphony.user_id.clone(),
                    window_date: date,
                    started_at: Utc::now(),
                    finished_at: Some(Utc::now()),
                    eligibility_reason: reason,
                    targets: Default::default(),
                    order_ids: Vec::new(),
                    status: ExecutionStatus::Failed,
                    failures: vec![err.to_string()],
                });

                SymphonyOutcome::Failed { liquidated: liquidation.is_some() }
            }
        }
    }

    /// Fetch -> validate -> evaluate -> plan -> execute, strictly sequential
    /// within one symphony. Errors carry the rejected-order count for the
    /// failure policy.
    async fn execute_symphony(
        &self,
        symphony: &Symphony,
        reason: &str,
        date: NaiveDate,
        deadline: DateTime<Utc>,
    ) -> std::result::Result<ExecutionStatus, (EngineError, u32)> {
        let started_at = Utc::now();
        self.events.publish(EngineEvent::ExecutionStarted {
            symphony_id: symphony.id.clone(),
            user_id: symphony.user_id.clone(),
            window_date: date,
        });

        let broker = self
            .brokers
            .get(&symphony.user_id)
            .ok_or_else(|| (EngineError::BrokerAuth("no broker connection".into()), 0))?;

        // The active flag guarantees a past validation, but trees are cheap
        // to re-check and a stale-invalid tree must never trade.
        let validated = validate(&symphony.tree).map_err(|e| (e, 0))?;

        // Load data, honouring the single data-retry from the policy table.
        let ctx = match DataContext::load(&self.facade, &validated.manifest, date).await {
            Ok(ctx) => ctx,
            Err(err) => {
                let policy = policy_for(&err, 0, false);
                if let Retry::After(delay) = policy.retry {
                    let delay_chrono = chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    let deadline_allows = Utc::now() + delay_chrono < deadline;
                    if deadline_allows {
                        warn!(symphony_id = %symphony.id, error = %err, "data fetch failed — one retry");
                        tokio::time::sleep(delay).await;
                        DataContext::load(&self.facade, &validated.manifest, date)
                            .await
                            .map_err(|e| (e, 0))?
                    } else {
                        return Err((err, 0));
                    }
                } else {
                    return Err((err, 0));
                }
            }
        };

        let evaluator = Evaluator::new(AllocationPolicy {
            cash_buffer: self.cfg.cash_buffer,
            ..AllocationPolicy::default()
        });
        let evaluation = evaluator.evaluate(&validated, date, &ctx).map_err(|e| (e, 0))?;

        let account = broker.account().await.map_err(|e| (e, 0))?;
        if account.account_blocked {
            // Escalates to a user-level critical error in the caller.
            return Err((EngineError::BrokerAuth("account is blocked".into()), 0));
        }
        if account.trading_blocked {
            return Err((EngineError::BrokerRejected("trading is blocked for this account".into()), 0));
        }

        let positions = self
            .stores
            .positions
            .list_for_symphony(&symphony.user_id, &symphony.id);

        // Reference prices for the planner from the evaluation context.
        let mut marks = std::collections::BTreeMap::new();
        for ticker in evaluation.weights.keys().filter(|t| *t != CASH_TICKER) {
            if let Some(price) = ctx.price(ticker).and_then(Decimal::from_f64) {
                marks.insert(ticker.clone(), price);
            }
        }

        let planner = Planner::new(self.cfg.min_order_dollars);
        let plan = planner
            .plan(
                account.equity,
                account.buying_power,
                &positions,
                &evaluation.weights,
                &marks,
                account.fractional_trading,
            )
            .map_err(|e| (e, 0))?;

        let executor = TradeExecutor::new(
            broker,
            self.stores.clone(),
            self.events.clone(),
            Duration::from_millis(self.cfg.poll_interval_ms),
            Duration::from_secs(self.cfg.submit_cutoff_secs),
        );
        let outcome = executor
            .execute_plan(
                &symphony.user_id,
                &symphony.id,
                plan,
                account.fractional_trading,
                deadline,
            )
            .await
            .map_err(|e| (e, 0))?;

        if outcome.rejected_count > 0 {
            let err = EngineError::BrokerRejected(format!(
                "{} orders rejected in this window",
                outcome.rejected_count
            ));
            return Err((err, outcome.rejected_count));
        }

        let status = if outcome.all_terminal_filled() {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::CompletedWithPartials
        };

        self.stores.executions.append(ExecutionRecord {
            symphony_id: symphony.id.clone(),
            user_id: symphony.user_id.clone(),
            window_date: date,
            started_at,
            finished_at: Some(Utc::now()),
            eligibility_reason: reason.to_string(),
            targets: evaluation.weights.clone(),
            order_ids: outcome.orders.iter().map(|o| o.client_id.clone()).collect(),
            status,
            failures: outcome.non_fatal.clone(),
        });
        self.stores.symphonies.record_execution(
            &symphony.id,
            Utc::now(),
            if outcome.non_fatal.is_empty() {
                None
            } else {
                Some(outcome.non_fatal.join("; "))
            },
        );

        Ok(status)
    }

    // -------------------------------------------------------------------------
    // Post-window tasks
    // -------------------------------------------------------------------------

    async fn post_window(&self, date: NaiveDate) {
        // Reconcile every connected user.
        for user_id in self.brokers.user_ids() {
            let Some(broker) = self.brokers.get(&user_id) else { continue };
            match reconcile_positions(broker.as_ref(), &self.stores, &user_id).await {
                Ok(report) if !report.is_clean() && !report.unresolved.is_empty() => {
                    let err = EngineError::ReconcileDivergence(report.unresolved.join("; "));
                    error!(user_id = %user_id, error = %err, "unresolved reconciliation divergence");
                }
                Ok(_) => {}
                Err(e) => warn!(user_id = %user_id, error = %e, "reconciliation failed"),
            }
        }

        // Daily performance snapshot per symphony that holds anything.
        for symphony in self.stores.symphonies.list_active() {
            let positions = self
                .stores
                .positions
                .list_for_symphony(&symphony.user_id, &symphony.id);
            let equity: Decimal = positions.iter().map(|p| p.market_value()).sum();
            self.stores.performance.append_snapshot(&symphony.id, date, equity);
        }

        // Provider budget usage for the operator log.
        for snap in self.facade.budget() {
            info!(
                provider = %snap.provider,
                in_window = snap.in_window,
                capacity = snap.capacity,
                total = snap.total_draws,
                "provider rate budget after window"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Calendar
    // -------------------------------------------------------------------------

    /// Next window opening strictly after `after`, skipping weekends and
    /// configured holidays.
    pub fn next_window_start(&self, after: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        let tz = self.cfg.tz()?;
        let open_time = self.cfg.window_start_time()?;

        let mut day = after.with_timezone(&tz).date_naive();
        for _ in 0..370 {
            if self.is_trading_day(day) {
                if let Some(local) = tz.from_local_datetime(&day.and_time(open_time)).single() {
                    let start = local.with_timezone(&Utc);
                    if start > after {
                        return Ok(start);
                    }
                }
            }
            day = day
                .succ_opt()
                .ok_or_else(|| anyhow::anyhow!("calendar overflow looking for a trading day"))?;
        }
        anyhow::bail!("no trading day found within a year of {after}")
    }

    fn is_trading_day(&self, day: NaiveDate) -> bool {
        !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) && !self.cfg.holidays.contains(&day)
    }

    /// Cheap handle for spawned workers.
    fn clone_refs(&self) -> Scheduler {
        Scheduler {
            cfg: self.cfg.clone(),
            stores: self.stores.clone(),
            facade: self.facade.clone(),
            brokers: self.brokers.clone(),
            events: self.events.clone(),
        }
    }
}

async fn sleep_until_utc(at: DateTime<Utc>) {
    let now = Utc::now();
    if at > now {
        if let Ok(wait) = (at - now).to_std() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_concurrency", &self.cfg.worker_concurrency)
            .field("window_start", &self.cfg.window_start)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Account, BrokerOrder, BrokerPosition, OrderRequest};
    use crate::market_data::provider::{
        Bar, DataSource, Fundamentals, Interval, MarketDataProvider, Quote, SymbolInfo,
    };
    use crate::market_data::FacadeTtls;
    use crate::symphony::parser::parse_str;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ---- stubs --------------------------------------------------------------

    struct FlatProvider {
        price: f64,
    }

    #[async_trait]
    impl MarketDataProvider for FlatProvider {
        fn source(&self) -> DataSource {
            DataSource::EodHistorical
        }
        fn rate_budget(&self) -> (u32, Duration) {
            (10_000, Duration::from_secs(60))
        }
        async fn quote(&self, symbol: &str) -> anyhow::Result<Quote> {
            Ok(Quote {
                symbol: symbol.into(),
                price: self.price,
                volume: 1000.0,
                change_pct: 0.0,
                market_cap: None,
                source: DataSource::EodHistorical,
                as_of: Utc::now(),
            })
        }
        async fn historical(
            &self,
            _symbol: &str,
            start: NaiveDate,
            end: NaiveDate,
            _interval: Interval,
        ) -> anyhow::Result<Vec<Bar>> {
            let mut bars = Vec::new();
            let mut day = start;
            while day <= end {
                bars.push(Bar {
                    date: day,
                    open: self.price,
                    high: self.price,
                    low: self.price,
                    close: self.price,
                    volume: 100.0,
                });
                day += chrono::Duration::days(1);
            }
            Ok(bars)
        }
        async fn search(&self, _q: &str) -> anyhow::Result<Vec<SymbolInfo>> {
            Ok(vec![])
        }
        async fn fundamentals(&self, _s: &str) -> anyhow::Result<Fundamentals> {
            Ok(Fundamentals { market_cap: None })
        }
    }

    struct InstantFillBroker {
        submissions: Mutex<Vec<OrderRequest>>,
        next_id: AtomicU32,
    }

    impl InstantFillBroker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                submissions: Mutex::new(Vec::new()),
                next_id: AtomicU32::new(1),
            })
        }
    }

    #[async_trait]
    impl BrokerPort for InstantFillBroker {
        async fn account(&self) -> crate::error::Result<Account> {
            Ok(Account {
                equity: dec!(10000),
                cash: dec!(10000),
                buying_power: dec!(10000),
                pattern_day_trader: false,
                trading_blocked: false,
                account_blocked: false,
                fractional_trading: false,
            })
        }
        async fn list_positions(&self) -> crate::error::Result<Vec<BrokerPosition>> {
            // Mirrors local fills closely enough for reconciliation to pass.
            let subs = self.submissions.lock();
            let mut by_symbol: HashMap<String, Decimal> = HashMap::new();
            for r in subs.iter() {
                let sign = if r.side == crate::types::OrderSide::Buy {
                    Decimal::ONE
                } else {
                    -Decimal::ONE
                };
                *by_symbol.entry(r.symbol.clone()).or_default() += sign * r.qty;
            }
            Ok(by_symbol
                .into_iter()
                .filter(|(_, qty)| *qty != Decimal::ZERO)
                .map(|(symbol, qty)| BrokerPosition {
                    symbol,
                    qty,
                    avg_entry_price: dec!(100),
                    current_price: dec!(100),
                    market_value: qty * dec!(100),
                    unrealized_pl: Decimal::ZERO,
                })
                .collect())
        }
        async fn submit_order(&self, request: &OrderRequest) -> crate::error::Result<BrokerOrder> {
            self.submissions.lock().push(request.clone());
            let id = format!("bo-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            Ok(BrokerOrder {
                id,
                client_order_id: request.client_order_id.clone().unwrap_or_default(),
                symbol: request.symbol.clone(),
                qty: request.qty,
                filled_qty: Some(Decimal::ZERO),
                filled_avg_price: None,
                side: request.side.to_string(),
                status: "new".into(),
            })
        }
        async fn get_order(&self, id: &str) -> crate::error::Result<BrokerOrder> {
            let subs = self.submissions.lock();
            let idx: usize = id.trim_start_matches("bo-").parse::<usize>().unwrap() - 1;
            let request = subs[idx].clone();
            Ok(BrokerOrder {
                id: id.into(),
                client_order_id: request.client_order_id.clone().unwrap_or_default(),
                symbol: request.symbol.clone(),
                qty: request.qty,
                filled_qty: Some(request.qty),
                filled_avg_price: Some(dec!(100)),
                side: request.side.to_string(),
                status: "filled".into(),
            })
        }
        async fn cancel_order(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn cancel_all_orders(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn close_position(&self, symbol: &str) -> crate::error::Result<BrokerOrder> {
            Ok(BrokerOrder {
                id: format!("close-{symbol}"),
                client_order_id: String::new(),
                symbol: symbol.into(),
                qty: dec!(1),
                filled_qty: Some(dec!(1)),
                filled_avg_price: Some(dec!(100)),
                side: "sell".into(),
                status: "filled".into(),
            })
        }
        async fn close_all_positions(&self) -> crate::error::Result<Vec<BrokerOrder>> {
            Ok(vec![])
        }
    }

    fn symphony_json(id: &str, rebalance: &str) -> String {
        format!(
            r#"{{"id": "{id}", "step": "root", "name": "test", "rebalance": "{rebalance}",
            "children": [{{
                "id": "{id}-wt", "step": "wt-cash-equal",
                "children": [
                    {{"id": "{id}-a", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S"}},
                    {{"id": "{id}-b", "step": "asset", "ticker": "AGG", "exchange": "ARCX", "name": "A"}}
                ]
            }}]}}"#
        )
    }

    fn scheduler_with(
        broker: Arc<dyn BrokerPort>,
        cfg: EngineConfig,
    ) -> (Scheduler, Arc<EngineStores>) {
        let stores = Arc::new(EngineStores::new());
        let facade = Arc::new(MarketDataFacade::new(
            vec![Arc::new(FlatProvider { price: 100.0 })],
            FacadeTtls::default(),
            4,
        ));
        let brokers = Arc::new(BrokerRegistry::new());
        brokers.register("u1", broker);

        let scheduler = Scheduler::new(cfg, stores.clone(), facade, brokers, EventBus::new(64));
        (scheduler, stores)
    }

    fn fast_cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.poll_interval_ms = 5;
        cfg.submit_cutoff_secs = 0;
        cfg
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    // ---- calendar -----------------------------------------------------------

    #[test]
    fn next_window_skips_weekends_and_holidays() {
        let mut cfg = EngineConfig::default();
        cfg.holidays = vec![NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()];
        let (scheduler, _) = scheduler_with(InstantFillBroker::new(), cfg);

        // Saturday noon UTC: Monday 2025-06-02 is a holiday, so Tuesday wins.
        let after = Utc.with_ymd_and_hms(2025, 5, 31, 12, 0, 0).unwrap();
        let start = scheduler.next_window_start(after).unwrap();
        let local = start.with_timezone(&scheduler.cfg.tz().unwrap());
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2025, 6, 3).unwrap());
        assert_eq!(local.time(), chrono::NaiveTime::from_hms_opt(15, 50, 0).unwrap());
    }

    #[test]
    fn same_day_window_is_used_when_still_ahead() {
        let (scheduler, _) = scheduler_with(InstantFillBroker::new(), EngineConfig::default());
        // Monday 10:00 New York is 14:00 UTC in June (EDT).
        let after = Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap();
        let start = scheduler.next_window_start(after).unwrap();
        let local = start.with_timezone(&scheduler.cfg.tz().unwrap());
        assert_eq!(local.date_naive(), monday());
    }

    // ---- window end-to-end ---------------------------------------------------

    #[tokio::test]
    async fn window_executes_an_eligible_symphony_to_fills() {
        let broker = InstantFillBroker::new();
        let (scheduler, stores) = scheduler_with(broker.clone(), fast_cfg());

        let tree = parse_str(&symphony_json("sym-1", "daily")).unwrap();
        stores.symphonies.upsert(Symphony::new("u1", tree));

        let deadline = Utc::now() + chrono::Duration::seconds(30);
        let summary = scheduler.run_window(monday(), deadline).await;

        assert_eq!(summary.eligible, 1);
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.failed, 0);

        // Equal weights over $10k at $100: 50 shares each.
        let positions = stores.positions.list_for_symphony("u1", "sym-1");
        assert_eq!(positions.len(), 2);
        assert!(positions.iter().all(|p| p.qty == dec!(50)));

        // Audit trail and targets recorded.
        let record = stores.executions.latest_for("sym-1").unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert_eq!(record.targets.len(), 2);
        assert_eq!(record.order_ids.len(), 2);

        // Performance snapshot appended post-window.
        assert!(stores.performance.latest_for("sym-1").is_some());
    }

    #[tokio::test]
    async fn weekly_symphony_is_skipped_off_monday() {
        let broker = InstantFillBroker::new();
        let (scheduler, stores) = scheduler_with(broker, fast_cfg());

        let tree = parse_str(&symphony_json("sym-w", "weekly")).unwrap();
        stores.symphonies.upsert(Symphony::new("u1", tree));

        // Tuesday.
        let tuesday = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();
        let summary = scheduler
            .run_window(tuesday, Utc::now() + chrono::Duration::seconds(30))
            .await;

        assert_eq!(summary.eligible, 0);
        assert_eq!(summary.skipped, 1);
        let record = stores.executions.latest_for("sym-w").unwrap();
        assert_eq!(record.status, ExecutionStatus::Skipped);
        assert!(stores.positions.list_for_symphony("u1", "sym-w").is_empty());
    }

    #[tokio::test]
    async fn invalid_tree_never_trades_and_is_deactivated() {
        let broker = InstantFillBroker::new();
        let (scheduler, stores) = scheduler_with(broker.clone(), fast_cfg());

        // Window of 300 trading days: parses, but validation must reject.
        let json = r#"{
            "id": "sym-bad", "step": "root", "name": "bad", "rebalance": "daily",
            "children": [{
                "id": "f", "step": "filter",
                "sort-by-fn": "moving-average-price", "sort-by-fn-params": {"window": 300},
                "select-fn": "top", "select-n": 1,
                "children": [{"id": "a", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S"}]
            }]
        }"#;
        let tree = parse_str(json).unwrap();
        stores.symphonies.upsert(Symphony::new("u1", tree));

        let summary = scheduler
            .run_window(monday(), Utc::now() + chrono::Duration::seconds(30))
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.liquidations, 0);
        // No orders reached the broker and the symphony is flagged inactive.
        assert!(broker.submissions.lock().is_empty());
        let stored = stores.symphonies.get("sym-bad").unwrap();
        assert!(!stored.active);
        assert!(stored.last_error.as_deref().unwrap_or_default().contains("bounds"));
    }

    #[tokio::test]
    async fn empty_rebalance_emits_no_orders_second_time() {
        let broker = InstantFillBroker::new();
        let (scheduler, stores) = scheduler_with(broker.clone(), fast_cfg());

        let tree = parse_str(&symphony_json("sym-2", "daily")).unwrap();
        stores.symphonies.upsert(Symphony::new("u1", tree));

        let deadline = Utc::now() + chrono::Duration::seconds(30);
        scheduler.run_window(monday(), deadline).await;
        let orders_after_first = broker.submissions.lock().len();

        // Same prices, same equity: the second window's plan is empty.
        let tuesday = NaiveDate::from_ymd_opt(2025, 6, 3).unwrap();
        let summary = scheduler
            .run_window(tuesday, Utc::now() + chrono::Duration::seconds(30))
            .await;

        assert_eq!(summary.executed, 1);
        assert_eq!(broker.submissions.lock().len(), orders_after_first);
    }
}
