// =============================================================================
// Shared domain types used across the maestro engine
// =============================================================================
//
// Monetary amounts, share quantities, and portfolio weights are `Decimal`
// everywhere outside the indicator kernel. Indicator math runs in `f64` and
// converts exactly once at the evaluator boundary.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::symphony::tree::StrategyTree;

/// Reserved ticker for the uninvested cash allocation.
pub const CASH_TICKER: &str = "CASH";

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an order in local records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Partial,
    Filled,
    Rejected,
    Cancelled,
    Failed,
}

impl OrderState {
    /// Terminal states receive no further polling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Filled => "filled",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Rebalance policy
// ---------------------------------------------------------------------------

/// Time-based rebalancing cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Frequency {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "quarterly" => Some(Self::Quarterly),
            "yearly" | "annually" => Some(Self::Yearly),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }
}

/// How a symphony decides whether today is a rebalance day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RebalancePolicy {
    /// Execute on a calendar schedule.
    Frequency(Frequency),
    /// Execute when any asset drifts further than `corridor` from target.
    Threshold { corridor: Decimal },
}

// ---------------------------------------------------------------------------
// Symphony
// ---------------------------------------------------------------------------

/// A persisted, named strategy tree with its rebalance policy and runtime
/// bookkeeping. The tree is immutable once stored; a new version is a new
/// value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symphony {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub tree: StrategyTree,
    pub policy: RebalancePolicy,
    pub active: bool,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Symphony {
    /// Wrap a validated tree for `user_id`. The policy is copied out of the
    /// tree root so the arbiter never needs to walk the tree.
    pub fn new(user_id: impl Into<String>, tree: StrategyTree) -> Self {
        Self {
            id: tree.id.clone(),
            user_id: user_id.into(),
            name: tree.name.clone(),
            policy: tree.rebalance.clone(),
            tree,
            active: true,
            last_executed_at: None,
            execution_count: 0,
            last_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// One holding of one symphony: (user, symphony, ticker) -> quantity.
///
/// Created by the first fill, updated on every subsequent fill, and archived
/// by the store when the quantity crosses exactly zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user_id: String,
    pub symphony_id: String,
    pub ticker: String,
    pub qty: Decimal,
    pub avg_cost: Decimal,
    pub last_mark: Decimal,
    pub cost_basis: Decimal,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Market value at the last known mark.
    pub fn market_value(&self) -> Decimal {
        self.qty * self.last_mark
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Local record of one order through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Client-generated id, set before submission (idempotent retry key).
    pub client_id: String,
    /// Broker-assigned id, known once the submission succeeds.
    #[serde(default)]
    pub broker_id: Option<String>,
    pub user_id: String,
    pub symphony_id: String,
    pub ticker: String,
    pub side: OrderSide,
    pub qty: Decimal,
    #[serde(default)]
    pub filled_qty: Decimal,
    pub intended_price: Decimal,
    #[serde(default)]
    pub fill_price: Option<Decimal>,
    pub state: OrderState,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Execution audit
// ---------------------------------------------------------------------------

/// Final status of one symphony in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    CompletedWithPartials,
    Failed,
    Skipped,
}

/// Audit row: what one symphony did during one execution window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub symphony_id: String,
    pub user_id: String,
    pub window_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub eligibility_reason: String,
    pub targets: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub order_ids: Vec<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub failures: Vec<String>,
}

/// Record written whenever the failure handler closes positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub id: String,
    pub user_id: String,
    /// `None` for a user-level liquidation spanning all symphonies.
    #[serde(default)]
    pub symphony_id: Option<String>,
    pub reason: String,
    pub positions_closed: usize,
    pub total_value: Decimal,
    pub at: DateTime<Utc>,
}

/// Daily performance snapshot appended per symphony after each window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRow {
    pub symphony_id: String,
    pub date: NaiveDate,
    pub equity: Decimal,
    /// Simple return vs the previous snapshot, when one exists.
    #[serde(default)]
    pub daily_return: Option<Decimal>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_state_terminality() {
        assert!(!OrderState::Pending.is_terminal());
        assert!(!OrderState::Partial.is_terminal());
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(OrderState::Failed.is_terminal());
    }

    #[test]
    fn frequency_tokens_round_trip() {
        for f in [
            Frequency::Daily,
            Frequency::Weekly,
            Frequency::Monthly,
            Frequency::Quarterly,
            Frequency::Yearly,
        ] {
            assert_eq!(Frequency::from_token(f.token()), Some(f));
        }
        // Legacy alias accepted on ingest.
        assert_eq!(Frequency::from_token("annually"), Some(Frequency::Yearly));
        assert_eq!(Frequency::from_token("hourly"), None);
    }

    #[test]
    fn position_market_value() {
        let pos = Position {
            user_id: "u1".into(),
            symphony_id: "s1".into(),
            ticker: "SPY".into(),
            qty: dec!(10),
            avg_cost: dec!(400),
            last_mark: dec!(412.50),
            cost_basis: dec!(4000),
            opened_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(pos.market_value(), dec!(4125.00));
    }
}
