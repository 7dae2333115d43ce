// =============================================================================
// Repositories — row-locked in-process stores for engine state
// =============================================================================
//
// The core treats persistence as repositories with row-level read/write:
// symphonies, positions, orders (append + in-place state updates), execution
// records and performance metrics (both append-only). All mutable state sits
// behind `parking_lot::RwLock`; workers never share anything else.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::types::{
    ExecutionRecord, OrderRecord, OrderSide, PerformanceRow, Position, Symphony,
};

// ---------------------------------------------------------------------------
// Symphonies
// ---------------------------------------------------------------------------

/// Keyed store of symphonies; iteration order is stable (by id).
pub struct SymphonyStore {
    rows: RwLock<BTreeMap<String, Symphony>>,
}

impl SymphonyStore {
    pub fn new() -> Self {
        Self { rows: RwLock::new(BTreeMap::new()) }
    }

    pub fn upsert(&self, symphony: Symphony) {
        debug!(symphony_id = %symphony.id, user_id = %symphony.user_id, "symphony stored");
        self.rows.write().insert(symphony.id.clone(), symphony);
    }

    pub fn get(&self, id: &str) -> Option<Symphony> {
        self.rows.read().get(id).cloned()
    }

    /// Active symphonies in ascending id order (stable batch draw).
    pub fn list_active(&self) -> Vec<Symphony> {
        self.rows.read().values().filter(|s| s.active).cloned().collect()
    }

    pub fn list_active_for_user(&self, user_id: &str) -> Vec<Symphony> {
        self.rows
            .read()
            .values()
            .filter(|s| s.active && s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Record a completed (or failed) execution attempt.
    pub fn record_execution(&self, id: &str, at: DateTime<Utc>, error: Option<String>) {
        if let Some(s) = self.rows.write().get_mut(id) {
            s.last_executed_at = Some(at);
            s.execution_count += 1;
            s.last_error = error;
        }
    }

    /// Surface a non-fatal error without touching the active flag.
    pub fn set_last_error(&self, id: &str, error: impl Into<String>) {
        if let Some(s) = self.rows.write().get_mut(id) {
            s.last_error = Some(error.into());
        }
    }

    /// Deactivate with a reason (fatal errors, failed validation).
    pub fn deactivate(&self, id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(s) = self.rows.write().get_mut(id) {
            s.active = false;
            s.last_error = Some(reason.clone());
            warn!(symphony_id = id, reason = %reason, "symphony deactivated");
        }
    }

    /// Reactivate after a successful re-validation.
    pub fn reactivate(&self, id: &str) {
        if let Some(s) = self.rows.write().get_mut(id) {
            s.active = true;
            s.last_error = None;
            info!(symphony_id = id, "symphony reactivated");
        }
    }
}

impl Default for SymphonyStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Open and archived positions. A position is created by its first fill,
/// updated on every later fill, and archived the moment its quantity crosses
/// exactly zero.
pub struct PositionStore {
    open: RwLock<Vec<Position>>,
    archived: RwLock<Vec<Position>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            archived: RwLock::new(Vec::new()),
        }
    }

    /// Apply one fill. Buys extend the cost basis; sells release it
    /// proportionally and leave the average cost untouched.
    pub fn apply_fill(
        &self,
        user_id: &str,
        symphony_id: &str,
        ticker: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
    ) {
        let delta = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let now = Utc::now();
        let mut open = self.open.write();

        let idx = open.iter().position(|p| {
            p.user_id == user_id && p.symphony_id == symphony_id && p.ticker == ticker
        });

        match idx {
            None => {
                let pos = Position {
                    user_id: user_id.to_string(),
                    symphony_id: symphony_id.to_string(),
                    ticker: ticker.to_string(),
                    qty: delta,
                    avg_cost: price,
                    last_mark: price,
                    cost_basis: delta * price,
                    opened_at: now,
                    updated_at: now,
                };
                info!(
                    user_id,
                    symphony_id,
                    ticker,
                    qty = %delta,
                    price = %price,
                    "position opened"
                );
                open.push(pos);
            }
            Some(i) => {
                let pos = &mut open[i];
                let old_qty = pos.qty;
                let new_qty = old_qty + delta;

                if delta > Decimal::ZERO {
                    pos.cost_basis += delta * price;
                    if new_qty != Decimal::ZERO {
                        pos.avg_cost = pos.cost_basis / new_qty;
                    }
                } else if old_qty != Decimal::ZERO {
                    // Release basis in proportion to the quantity sold.
                    pos.cost_basis = pos.cost_basis * (new_qty / old_qty);
                }

                pos.qty = new_qty;
                pos.last_mark = price;
                pos.updated_at = now;

                if new_qty == Decimal::ZERO {
                    let closed = open.remove(i);
                    info!(
                        user_id,
                        symphony_id,
                        ticker,
                        "position closed and archived"
                    );
                    self.archived.write().push(closed);
                } else {
                    debug!(
                        user_id,
                        symphony_id,
                        ticker,
                        qty = %new_qty,
                        "position updated"
                    );
                }
            }
        }
    }

    pub fn list_for_symphony(&self, user_id: &str, symphony_id: &str) -> Vec<Position> {
        self.open
            .read()
            .iter()
            .filter(|p| p.user_id == user_id && p.symphony_id == symphony_id)
            .cloned()
            .collect()
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<Position> {
        self.open.read().iter().filter(|p| p.user_id == user_id).cloned().collect()
    }

    /// Refresh the mark price for every open position of a ticker.
    pub fn mark_price(&self, ticker: &str, price: Decimal) {
        for pos in self.open.write().iter_mut().filter(|p| p.ticker == ticker) {
            pos.last_mark = price;
            pos.updated_at = Utc::now();
        }
    }

    /// Overwrite one position's quantity and mark (reconciliation repair).
    pub fn force_set(
        &self,
        user_id: &str,
        symphony_id: &str,
        ticker: &str,
        qty: Decimal,
        price: Decimal,
    ) {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| {
            p.user_id == user_id && p.symphony_id == symphony_id && p.ticker == ticker
        });
        match idx {
            Some(i) if qty == Decimal::ZERO => {
                let closed = open.remove(i);
                self.archived.write().push(closed);
            }
            Some(i) => {
                open[i].qty = qty;
                open[i].last_mark = price;
                open[i].updated_at = Utc::now();
            }
            None if qty != Decimal::ZERO => {
                let now = Utc::now();
                open.push(Position {
                    user_id: user_id.to_string(),
                    symphony_id: symphony_id.to_string(),
                    ticker: ticker.to_string(),
                    qty,
                    avg_cost: price,
                    last_mark: price,
                    cost_basis: qty * price,
                    opened_at: now,
                    updated_at: now,
                });
            }
            None => {}
        }
    }

    pub fn archived_count(&self) -> usize {
        self.archived.read().len()
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Append-plus-update store for order records, keyed by client order id.
pub struct TradeStore {
    rows: RwLock<Vec<OrderRecord>>,
}

impl TradeStore {
    pub fn new() -> Self {
        Self { rows: RwLock::new(Vec::new()) }
    }

    pub fn append(&self, record: OrderRecord) {
        debug!(client_id = %record.client_id, ticker = %record.ticker, state = %record.state, "order recorded");
        self.rows.write().push(record);
    }

    pub fn get(&self, client_id: &str) -> Option<OrderRecord> {
        self.rows.read().iter().find(|r| r.client_id == client_id).cloned()
    }

    /// Mutate one order in place (state transitions, fills, broker id).
    pub fn update<F: FnOnce(&mut OrderRecord)>(&self, client_id: &str, f: F) {
        let mut rows = self.rows.write();
        if let Some(row) = rows.iter_mut().find(|r| r.client_id == client_id) {
            f(row);
        }
    }

    pub fn list_for_symphony(&self, symphony_id: &str) -> Vec<OrderRecord> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.symphony_id == symphony_id)
            .cloned()
            .collect()
    }

    /// Orders of one symphony not yet in a terminal state.
    pub fn open_for_symphony(&self, symphony_id: &str) -> Vec<OrderRecord> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.symphony_id == symphony_id && !r.state.is_terminal())
            .cloned()
            .collect()
    }
}

impl Default for TradeStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Execution records & performance
// ---------------------------------------------------------------------------

/// Append-only audit of per-window symphony executions.
pub struct ExecutionStore {
    rows: RwLock<Vec<ExecutionRecord>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self { rows: RwLock::new(Vec::new()) }
    }

    pub fn append(&self, record: ExecutionRecord) {
        self.rows.write().push(record);
    }

    /// Most recent record for a symphony (used for drift targets).
    pub fn latest_for(&self, symphony_id: &str) -> Option<ExecutionRecord> {
        self.rows
            .read()
            .iter()
            .rev()
            .find(|r| r.symphony_id == symphony_id)
            .cloned()
    }

    pub fn list_for_symphony(&self, symphony_id: &str) -> Vec<ExecutionRecord> {
        self.rows
            .read()
            .iter()
            .filter(|r| r.symphony_id == symphony_id)
            .cloned()
            .collect()
    }
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only per-symphony daily performance metrics.
pub struct PerformanceStore {
    rows: RwLock<Vec<PerformanceRow>>,
}

impl PerformanceStore {
    pub fn new() -> Self {
        Self { rows: RwLock::new(Vec::new()) }
    }

    /// Append a snapshot, deriving the daily return from the previous row.
    pub fn append_snapshot(&self, symphony_id: &str, date: chrono::NaiveDate, equity: Decimal) {
        let mut rows = self.rows.write();
        let previous = rows.iter().rev().find(|r| r.symphony_id == symphony_id);
        let daily_return = previous.and_then(|prev| {
            if prev.equity > Decimal::ZERO {
                Some((equity - prev.equity) / prev.equity)
            } else {
                None
            }
        });
        rows.push(PerformanceRow {
            symphony_id: symphony_id.to_string(),
            date,
            equity,
            daily_return,
        });
    }

    pub fn latest_for(&self, symphony_id: &str) -> Option<PerformanceRow> {
        self.rows
            .read()
            .iter()
            .rev()
            .find(|r| r.symphony_id == symphony_id)
            .cloned()
    }
}

impl Default for PerformanceStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// All repositories, wired once at startup and shared by `Arc`.
pub struct EngineStores {
    pub symphonies: SymphonyStore,
    pub positions: PositionStore,
    pub trades: TradeStore,
    pub executions: ExecutionStore,
    pub performance: PerformanceStore,
}

impl EngineStores {
    pub fn new() -> Self {
        Self {
            symphonies: SymphonyStore::new(),
            positions: PositionStore::new(),
            trades: TradeStore::new(),
            executions: ExecutionStore::new(),
            performance: PerformanceStore::new(),
        }
    }
}

impl Default for EngineStores {
    fn default() -> Self {
        Self::new()
    }
}
