// =============================================================================
// Failure Handler — classify, apply the recovery policy, liquidate when owed
// =============================================================================
//
// Policy table (per error kind):
//
//   data_unavailable    liquidate, retry once after 30 s, suspend symphony
//   eval_error          liquidate, no retry, deactivate and flag for review
//   plan_over_budget    no liquidation, scale down and retry, continue
//   broker_rejected     liquidate at >= 3 rejections per symphony per window
//   broker_unreachable  liquidate if still down after the poll limit,
//                       exponential backoff, skip this window
//   timeout             record the partial state, continue
//   validation kinds    never execute; deactivate without liquidation
//
// Liquidation cancels the symphony's in-flight orders, market-sells every
// non-zero position, and writes a `LiquidationEvent` with the value closed.
// A user-level critical error runs that sequence for every active symphony
// the user owns.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerPort;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::store::EngineStores;
use crate::types::{LiquidationEvent, OrderSide, Symphony};

/// Rejections per symphony per window before liquidation.
pub const REJECTION_LIQUIDATION_THRESHOLD: u32 = 3;

/// Delay before the single data-unavailable retry.
pub const DATA_RETRY_DELAY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// What to do about the failed attempt itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    No,
    /// Retry once after the delay.
    After(Duration),
    /// Re-run the planner's scaling step and retry.
    ScaleAndRetry,
    /// Retry with exponential backoff.
    Backoff,
}

/// What happens to the symphony record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymphonyAction {
    Continue,
    /// Keep inactive until the next successful validation pass.
    Suspend,
    Deactivate,
    SkipWindow,
}

#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub liquidate: bool,
    pub retry: Retry,
    pub action: SymphonyAction,
}

/// The policy table. `rejections` counts this symphony's rejected orders in
/// the current window; `unreachable_exhausted` is true when the broker stayed
/// down past the executor's poll limit.
pub fn policy_for(error: &EngineError, rejections: u32, unreachable_exhausted: bool) -> Policy {
    match error {
        EngineError::DataUnavailable { .. } => Policy {
            liquidate: true,
            retry: Retry::After(DATA_RETRY_DELAY),
            action: SymphonyAction::Suspend,
        },
        EngineError::Eval(_) => Policy {
            liquidate: true,
            retry: Retry::No,
            action: SymphonyAction::Deactivate,
        },
        EngineError::PlanOverBudget { .. } => Policy {
            liquidate: false,
            retry: Retry::ScaleAndRetry,
            action: SymphonyAction::Continue,
        },
        EngineError::BrokerRejected(_) => Policy {
            liquidate: rejections >= REJECTION_LIQUIDATION_THRESHOLD,
            retry: Retry::No,
            action: SymphonyAction::Continue,
        },
        EngineError::BrokerUnreachable(_) => Policy {
            liquidate: unreachable_exhausted,
            retry: Retry::Backoff,
            action: SymphonyAction::SkipWindow,
        },
        EngineError::BrokerAuth(_) => Policy {
            liquidate: false,
            retry: Retry::No,
            action: SymphonyAction::SkipWindow,
        },
        EngineError::Timeout(_) => Policy {
            liquidate: false,
            retry: Retry::No,
            action: SymphonyAction::Continue,
        },
        EngineError::ReconcileDivergence(_) => Policy {
            liquidate: false,
            retry: Retry::No,
            action: SymphonyAction::Continue,
        },
        // Validation failures: the tree never executes, nothing to unwind.
        EngineError::Parse(_)
        | EngineError::Structure(_)
        | EngineError::Bounds(_)
        | EngineError::Metric(_)
        | EngineError::Cycle(_) => Policy {
            liquidate: false,
            retry: Retry::No,
            action: SymphonyAction::Deactivate,
        },
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct FailureHandler {
    broker: Arc<dyn BrokerPort>,
    stores: Arc<EngineStores>,
    events: EventBus,
    poll_interval: Duration,
}

impl FailureHandler {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        stores: Arc<EngineStores>,
        events: EventBus,
        poll_interval: Duration,
    ) -> Self {
        Self { broker, stores, events, poll_interval }
    }

    /// Apply the policy for one symphony failure. Returns the liquidation
    /// event when one was performed.
    pub async fn handle_symphony_error(
        &self,
        symphony: &Symphony,
        err: &EngineError,
        rejections: u32,
        unreachable_exhausted: bool,
        deadline: DateTime<Utc>,
    ) -> Option<LiquidationEvent> {
        let policy = policy_for(err, rejections, unreachable_exhausted);
        error!(
            symphony_id = %symphony.id,
            code = err.code(),
            liquidate = policy.liquidate,
            action = ?policy.action,
            "symphony failure"
        );

        match policy.action {
            SymphonyAction::Continue => {
                self.stores.symphonies.set_last_error(&symphony.id, err.to_string());
            }
            SymphonyAction::SkipWindow => {
                self.stores
                    .symphonies
                    .set_last_error(&symphony.id, format!("window skipped: {err}"));
            }
            SymphonyAction::Suspend => {
                self.stores
                    .symphonies
                    .deactivate(&symphony.id, format!("suspended until validated: {err}"));
            }
            SymphonyAction::Deactivate => {
                self.stores.symphonies.deactivate(&symphony.id, err.to_string());
            }
        }

        if !policy.liquidate {
            return None;
        }

        match self
            .liquidate_symphony(&symphony.user_id, &symphony.id, &err.to_string(), deadline)
            .await
        {
            Ok(event) => Some(event),
            Err(liq_err) => {
                error!(
                    symphony_id = %symphony.id,
                    error = %liq_err,
                    "liquidation itself failed"
                );
                self.stores
                    .symphonies
                    .set_last_error(&symphony.id, format!("liquidation failed: {liq_err}"));
                None
            }
        }
    }

    /// Cancel in-flight orders, then market-close every non-zero position of
    /// the symphony, polling each close until filled or the deadline.
    pub async fn liquidate_symphony(
        &self,
        user_id: &str,
        symphony_id: &str,
        reason: &str,
        deadline: DateTime<Utc>,
    ) -> Result<LiquidationEvent> {
        warn!(symphony_id, reason, "liquidating symphony to cash");

        // 1. Cancel anything still live at the broker.
        for order in self.stores.trades.open_for_symphony(symphony_id) {
            if let Some(broker_id) = &order.broker_id {
                if let Err(e) = self.broker.cancel_order(broker_id).await {
                    warn!(broker_id = %broker_id, error = %e, "cancel during liquidation failed");
                }
            }
        }

        // 2. Market-sell every open position.
        let positions = self.stores.positions.list_for_symphony(user_id, symphony_id);
        let mut closed = 0usize;
        let mut total_value = Decimal::ZERO;

        for position in positions {
            if position.qty == Decimal::ZERO {
                continue;
            }
            let order = self.broker.close_position(&position.ticker).await?;
            let settled = self.wait_for_close(&order.id, deadline).await;

            let fill_price = settled
                .as_ref()
                .and_then(|o| o.filled_avg_price)
                .unwrap_or(position.last_mark);
            let fill_qty = settled
                .as_ref()
                .and_then(|o| o.filled_qty)
                .filter(|q| *q > Decimal::ZERO)
                .unwrap_or(position.qty);

            self.stores.positions.apply_fill(
                user_id,
                symphony_id,
                &position.ticker,
                OrderSide::Sell,
                fill_qty,
                fill_price,
            );
            closed += 1;
            total_value += fill_qty * fill_price;
        }

        let event = LiquidationEvent {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            symphony_id: Some(symphony_id.to_string()),
            reason: reason.to_string(),
            positions_closed: closed,
            total_value,
            at: Utc::now(),
        };
        info!(
            symphony_id,
            positions_closed = closed,
            total_value = %total_value,
            "liquidation complete"
        );
        self.events.publish(EngineEvent::Liquidation(event.clone()));
        Ok(event)
    }

    /// A user-level critical error liquidates every active symphony the user
    /// owns.
    pub async fn handle_user_critical(
        &self,
        user_id: &str,
        err: &EngineError,
        deadline: DateTime<Utc>,
    ) -> Vec<LiquidationEvent> {
        error!(user_id, code = err.code(), "user-level critical error");

        let mut events = Vec::new();
        for symphony in self.stores.symphonies.list_active_for_user(user_id) {
            self.stores
                .symphonies
                .deactivate(&symphony.id, format!("user-level critical error: {err}"));
            match self
                .liquidate_symphony(user_id, &symphony.id, &err.to_string(), deadline)
                .await
            {
                Ok(event) => events.push(event),
                Err(e) => error!(symphony_id = %symphony.id, error = %e, "liquidation failed"),
            }
        }
        events
    }

    /// Poll one close order until terminal or deadline. `None` means the
    /// deadline won; the caller falls back to the position's own numbers.
    async fn wait_for_close(
        &self,
        broker_order_id: &str,
        deadline: DateTime<Utc>,
    ) -> Option<crate::broker::BrokerOrder> {
        loop {
            match self.broker.get_order(broker_order_id).await {
                Ok(order) if order.state().is_terminal() => return Some(order),
                Ok(_) => {}
                Err(e) => {
                    warn!(broker_order_id, error = %e, "close poll failed");
                }
            }
            if Utc::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl std::fmt::Debug for FailureHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureHandler")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
