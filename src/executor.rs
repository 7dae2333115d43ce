// =============================================================================
// Trade Executor — submits a plan and tracks every order to a terminal state
// =============================================================================
//
// Lifecycle per attempt:
//   1. Submit sells and poll them to terminal states (they release the
//      buying power the buys assume).
//   2. Re-read the account and re-scale the buys against live buying power,
//      so a failed sell downsizes or skips the buys that depended on it.
//   3. Submit buys (unless the window is within the submit cutoff) and poll.
//
// Every order carries a client-generated id before submission so a retry can
// never double-submit. Each non-terminal order has exactly one poll task,
// which stops at a terminal state or the window deadline. A poll that hits
// the deadline records the last observed broker state: filled portions are
// applied to positions and the order is left `partial` with a non-fatal
// error.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerPort, OrderRequest};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::planner::{scale_buys_to_budget, OrderIntent};
use crate::store::EngineStores;
use crate::types::{OrderRecord, OrderSide, OrderState};

/// Consecutive failed polls before the broker counts as unreachable.
const UNREACHABLE_POLL_LIMIT: u32 = 5;

/// Result of executing one plan.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Final state of every order this attempt touched.
    pub orders: Vec<OrderRecord>,
    /// Non-fatal conditions (partials at deadline, skipped submissions).
    pub non_fatal: Vec<String>,
    /// Rejected-order count for the failure policy's escalation threshold.
    pub rejected_count: u32,
}

impl ExecutionOutcome {
    pub fn all_terminal_filled(&self) -> bool {
        self.orders.iter().all(|o| o.state == OrderState::Filled)
    }
}

#[derive(Clone)]
pub struct TradeExecutor {
    broker: Arc<dyn BrokerPort>,
    stores: Arc<EngineStores>,
    events: EventBus,
    poll_interval: Duration,
    submit_cutoff: Duration,
}

impl TradeExecutor {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        stores: Arc<EngineStores>,
        events: EventBus,
        poll_interval: Duration,
        submit_cutoff: Duration,
    ) -> Self {
        Self {
            broker,
            stores,
            events,
            poll_interval,
            submit_cutoff,
        }
    }

    /// Execute a plan for one symphony, bounded by the window deadline.
    pub async fn execute_plan(
        &self,
        user_id: &str,
        symphony_id: &str,
        plan: Vec<OrderIntent>,
        fractional: bool,
        deadline: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome {
            orders: Vec::new(),
            non_fatal: Vec::new(),
            rejected_count: 0,
        };

        let (sells, mut buys): (Vec<_>, Vec<_>) =
            plan.into_iter().partition(|o| o.side == OrderSide::Sell);

        info!(
            user_id,
            symphony_id,
            sells = sells.len(),
            buys = buys.len(),
            "executing plan"
        );

        // ---- 1. Sells first: they free the buying power the buys assume.
        let sell_records = self
            .submit_and_poll(user_id, symphony_id, sells, deadline, &mut outcome)
            .await?;
        let any_sell_failed = sell_records
            .iter()
            .any(|r| matches!(r.state, OrderState::Rejected | OrderState::Cancelled | OrderState::Failed));
        outcome.orders.extend(sell_records);

        // ---- 2. Re-scale buys against live buying power.
        if !buys.is_empty() {
            let account = self.broker.account().await?;
            if any_sell_failed {
                warn!(
                    symphony_id,
                    buying_power = %account.buying_power,
                    "a sell failed, re-scaling dependent buys"
                );
            }
            scale_buys_to_budget(&mut buys, account.buying_power, fractional);
        }

        // ---- 3. Buys, honouring the submission cutoff.
        let buy_records = self
            .submit_and_poll(user_id, symphony_id, buys, deadline, &mut outcome)
            .await?;
        outcome.orders.extend(buy_records);

        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    async fn submit_and_poll(
        &self,
        user_id: &str,
        symphony_id: &str,
        intents: Vec<OrderIntent>,
        deadline: DateTime<Utc>,
        outcome: &mut ExecutionOutcome,
    ) -> Result<Vec<OrderRecord>> {
        let cutoff = deadline
            - chrono::Duration::from_std(self.submit_cutoff).unwrap_or_else(|_| chrono::Duration::zero());
        let mut submitted = Vec::new();

        for intent in intents {
            if Utc::now() >= cutoff {
                let note = format!(
                    "submission cutoff reached, skipping {} {} {}",
                    intent.side, intent.qty, intent.ticker
                );
                warn!(symphony_id, "{note}");
                outcome.non_fatal.push(note);
                continue;
            }

            match self.submit_one(user_id, symphony_id, &intent).await {
                Ok(record) => {
                    if record.state == OrderState::Failed {
                        outcome.rejected_count += 1;
                        outcome.non_fatal.push(format!(
                            "order for {} rejected: {}",
                            record.ticker,
                            record.error.clone().unwrap_or_default()
                        ));
                    }
                    submitted.push(record);
                }
                // Unreachable broker aborts this attempt; the failure
                // handler owns retry/backoff policy.
                Err(e) => return Err(e),
            }
        }

        // One poll task per non-terminal order.
        let mut set: JoinSet<OrderRecord> = JoinSet::new();
        let mut finished = Vec::new();
        for record in submitted {
            if record.state.is_terminal() || record.broker_id.is_none() {
                finished.push(record);
                continue;
            }
            let this = self.clone();
            let user = user_id.to_string();
            set.spawn(async move { this.poll_to_terminal(&user, record, deadline).await });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(record) => {
                    if record.state == OrderState::Partial {
                        outcome.non_fatal.push(format!(
                            "order for {} partially filled {}/{} at deadline",
                            record.ticker, record.filled_qty, record.qty
                        ));
                    }
                    finished.push(record);
                }
                Err(e) => {
                    return Err(EngineError::Eval(format!("order poll task panicked: {e}")))
                }
            }
        }

        // Deterministic record ordering for the audit trail.
        finished.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(finished)
    }

    /// Submit one intent. A broker rejection records a failed order and is
    /// NOT an error; an unreachable broker is.
    async fn submit_one(
        &self,
        user_id: &str,
        symphony_id: &str,
        intent: &OrderIntent,
    ) -> Result<OrderRecord> {
        let client_id = Uuid::new_v4().to_string();
        let mut record = OrderRecord {
            client_id: client_id.clone(),
            broker_id: None,
            user_id: user_id.to_string(),
            symphony_id: symphony_id.to_string(),
            ticker: intent.ticker.clone(),
            side: intent.side,
            qty: intent.qty,
            filled_qty: Decimal::ZERO,
            intended_price: intent.reference_price,
            fill_price: None,
            state: OrderState::Pending,
            submitted_at: Utc::now(),
            filled_at: None,
            error: None,
        };
        self.stores.trades.append(record.clone());

        let request = OrderRequest::market(&intent.ticker, intent.qty, intent.side)
            .with_client_id(&client_id);

        match self.broker.submit_order(&request).await {
            Ok(broker_order) => {
                record.broker_id = Some(broker_order.id.clone());
                self.stores.trades.update(&client_id, |o| {
                    o.broker_id = Some(broker_order.id.clone());
                });
                self.events.publish(EngineEvent::OrderPlaced {
                    symphony_id: symphony_id.to_string(),
                    client_order_id: client_id.clone(),
                    ticker: intent.ticker.clone(),
                    side: intent.side,
                    qty: intent.qty,
                });
                debug!(client_id = %client_id, broker_id = %broker_order.id, "order submitted");
                Ok(record)
            }
            Err(EngineError::BrokerRejected(reason)) => {
                record.state = OrderState::Failed;
                record.error = Some(reason.clone());
                self.stores.trades.update(&client_id, |o| {
                    o.state = OrderState::Failed;
                    o.error = Some(reason.clone());
                });
                warn!(ticker = %intent.ticker, reason = %reason, "order rejected at submission");
                Ok(record)
            }
            Err(other) => {
                self.stores.trades.update(&client_id, |o| {
                    o.state = OrderState::Failed;
                    o.error = Some(other.to_string());
                });
                Err(other)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Polling
    // -------------------------------------------------------------------------

    /// Poll one order until a terminal state or the deadline. Never panics;
    /// an unreachable broker past its poll limit marks the order failed with
    /// the reason preserved.
    async fn poll_to_terminal(
        &self,
        user_id: &str,
        mut record: OrderRecord,
        deadline: DateTime<Utc>,
    ) -> OrderRecord {
        let broker_id = record.broker_id.clone().expect("polled order has a broker id");
        let mut unreachable_streak: u32 = 0;

        loop {
            if Utc::now() >= deadline {
                return self.finish_at_deadline(user_id, record);
            }

            match self.broker.get_order(&broker_id).await {
                Ok(order) => {
                    unreachable_streak = 0;
                    let filled = order.filled_qty.unwrap_or(Decimal::ZERO);
                    match order.state() {
                        OrderState::Filled => {
                            let fill_price =
                                order.filled_avg_price.unwrap_or(record.intended_price);
                            let fill_qty = if filled > Decimal::ZERO { filled } else { record.qty };
                            record.state = OrderState::Filled;
                            record.filled_qty = fill_qty;
                            record.fill_price = Some(fill_price);
                            record.filled_at = Some(Utc::now());
                            self.apply_fill(user_id, &record, fill_qty, fill_price);
                            return record;
                        }
                        OrderState::Partial => {
                            record.state = OrderState::Partial;
                            record.filled_qty = filled;
                            record.fill_price = order.filled_avg_price.or(record.fill_price);
                            self.stores.trades.update(&record.client_id, |o| {
                                o.state = OrderState::Partial;
                                o.filled_qty = filled;
                            });
                        }
                        OrderState::Rejected | OrderState::Cancelled | OrderState::Failed => {
                            let reason = format!("broker reported '{}'", order.status);
                            record.state = OrderState::Failed;
                            record.error = Some(reason.clone());
                            self.stores.trades.update(&record.client_id, |o| {
                                o.state = OrderState::Failed;
                                o.error = Some(reason.clone());
                            });
                            warn!(client_id = %record.client_id, reason = %reason, "order failed");
                            return record;
                        }
                        OrderState::Pending => {}
                    }
                }
                Err(e) => {
                    unreachable_streak += 1;
                    warn!(
                        client_id = %record.client_id,
                        streak = unreachable_streak,
                        error = %e,
                        "order poll failed"
                    );
                    if unreachable_streak >= UNREACHABLE_POLL_LIMIT {
                        let reason = format!("broker unreachable after {unreachable_streak} polls: {e}");
                        record.state = OrderState::Failed;
                        record.error = Some(reason.clone());
                        self.stores.trades.update(&record.client_id, |o| {
                            o.state = OrderState::Failed;
                            o.error = Some(reason);
                        });
                        return record;
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Deadline reached: persist the last observed broker state so the order
    /// is never ambiguous locally.
    fn finish_at_deadline(&self, user_id: &str, mut record: OrderRecord) -> OrderRecord {
        if record.filled_qty > Decimal::ZERO {
            let fill_price = record.fill_price.unwrap_or(record.intended_price);
            record.state = OrderState::Partial;
            record.error = Some("window deadline reached with a partial fill".into());
            self.apply_fill(user_id, &record, record.filled_qty, fill_price);
            self.stores.trades.update(&record.client_id, |o| {
                o.state = OrderState::Partial;
                o.filled_qty = record.filled_qty;
                o.error = record.error.clone();
            });
        } else {
            record.error = Some("pending at window deadline".into());
            self.stores.trades.update(&record.client_id, |o| {
                o.error = record.error.clone();
            });
        }
        warn!(client_id = %record.client_id, state = %record.state, "order stopped at deadline");
        record
    }

    fn apply_fill(&self, user_id: &str, record: &OrderRecord, qty: Decimal, price: Decimal) {
        self.stores.positions.apply_fill(
            user_id,
            &record.symphony_id,
            &record.ticker,
            record.side,
            qty,
            price,
        );
        self.stores.trades.update(&record.client_id, |o| {
            o.state = record.state;
            o.filled_qty = qty;
            o.fill_price = Some(price);
            o.filled_at = record.filled_at;
        });
        self.events.publish(EngineEvent::OrderFilled {
            symphony_id: record.symphony_id.clone(),
            client_order_id: record.client_id.clone(),
            ticker: record.ticker.clone(),
            filled_qty: qty,
            fill_price: price,
        });
    }
}

impl std::fmt::Debug for TradeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeExecutor")
            .field("poll_interval", &self.poll_interval)
            .field("submit_cutoff", &self.submit_cutoff)
            .finish()
    }
}
