// =============================================================================
// Broker port — paper-trading operations the engine depends on
// =============================================================================
//
// The executor, failure handler, and reconciler all talk to this trait; the
// REST client in `client.rs` is the production implementation and tests
// substitute scripted stubs. Monetary fields cross the wire as strings and
// deserialize straight into `Decimal`.
// =============================================================================

pub mod client;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{OrderSide, OrderState};

pub use client::{AuthToken, BrokerClient, TokenRefresher};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(with = "rust_decimal::serde::str")]
    pub equity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub cash: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub buying_power: Decimal,
    #[serde(default)]
    pub pattern_day_trader: bool,
    #[serde(default)]
    pub trading_blocked: bool,
    #[serde(default)]
    pub account_blocked: bool,
    #[serde(default)]
    pub fractional_trading: bool,
}

impl Account {
    /// The account can accept orders at all.
    pub fn can_trade(&self) -> bool {
        !self.trading_blocked && !self.account_blocked
    }
}

/// One position as the broker sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub current_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub market_value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub unrealized_pl: Decimal,
}

/// Order snapshot returned by submission and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    #[serde(default)]
    pub client_order_id: String,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub filled_qty: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub filled_avg_price: Option<Decimal>,
    pub side: String,
    pub status: String,
}

impl BrokerOrder {
    /// Map the broker's status vocabulary onto local order states.
    pub fn state(&self) -> OrderState {
        match self.status.as_str() {
            "filled" => OrderState::Filled,
            "partially_filled" => OrderState::Partial,
            "canceled" | "cancelled" => OrderState::Cancelled,
            "rejected" => OrderState::Rejected,
            "expired" | "stopped" | "suspended" => OrderState::Failed,
            // new / accepted / pending_new / accepted_for_bidding ...
            _ => OrderState::Pending,
        }
    }
}

/// Parameters for a new order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    pub time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Day market order, the planner's default.
    pub fn market(symbol: impl Into<String>, qty: Decimal, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side,
            order_type: "market".into(),
            time_in_force: "day".into(),
            limit_price: None,
            stop_price: None,
            client_order_id: None,
        }
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Paper-broker operations. Implementations must be safe to share across
/// workers.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn account(&self) -> Result<Account>;
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>>;
    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder>;
    async fn get_order(&self, id: &str) -> Result<BrokerOrder>;
    async fn cancel_order(&self, id: &str) -> Result<()>;
    async fn cancel_all_orders(&self) -> Result<()>;
    async fn close_position(&self, symbol: &str) -> Result<BrokerOrder>;
    async fn close_all_positions(&self) -> Result<Vec<BrokerOrder>>;
}
