// =============================================================================
// Position reconciliation — compare local records against the broker
// =============================================================================
//
// Runs after each execution window. Local positions (summed per ticker across
// the user's symphonies) are compared with the broker's view; marks are
// refreshed from broker prices, and divergences are repaired where the repair
// is unambiguous:
//
//   - ticker held by exactly one symphony   -> quantity forced to broker's
//   - ticker gone at the broker             -> local position archived
//   - ticker held by several symphonies, or
//     only known to the broker              -> reported, left for an operator
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::BrokerPort;
use crate::error::Result;
use crate::store::EngineStores;

/// Summary of one reconciliation pass for one user.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub user_id: String,
    /// Tickers compared (union of broker and local).
    pub checked: usize,
    /// Tickers whose quantities disagreed.
    pub divergences: usize,
    /// Divergences fixed automatically.
    pub repaired: usize,
    /// Divergences needing an operator, as `ticker: detail` strings.
    pub unresolved: Vec<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.divergences == 0
    }
}

/// Run one reconciliation cycle for `user_id`.
pub async fn reconcile_positions(
    broker: &dyn BrokerPort,
    stores: &EngineStores,
    user_id: &str,
) -> Result<ReconcileReport> {
    info!(user_id, "position reconciliation started");

    let broker_positions = broker.list_positions().await?;
    let broker_by_ticker: BTreeMap<String, (Decimal, Decimal)> = broker_positions
        .iter()
        .map(|p| (p.symbol.clone(), (p.qty, p.current_price)))
        .collect();

    let local = stores.positions.list_for_user(user_id);

    // Refresh marks from broker prices before comparing values.
    for (ticker, (_, price)) in &broker_by_ticker {
        stores.positions.mark_price(ticker, *price);
    }

    // Sum local holdings per ticker and remember which symphonies hold them.
    let mut local_by_ticker: BTreeMap<String, Decimal> = BTreeMap::new();
    let mut holders: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for p in &local {
        *local_by_ticker.entry(p.ticker.clone()).or_default() += p.qty;
        holders.entry(p.ticker.clone()).or_default().insert(p.symphony_id.clone());
    }

    let mut tickers: BTreeSet<&str> = broker_by_ticker.keys().map(String::as_str).collect();
    tickers.extend(local_by_ticker.keys().map(String::as_str));

    let mut divergences = 0usize;
    let mut repaired = 0usize;
    let mut unresolved = Vec::new();

    for ticker in &tickers {
        let broker_qty = broker_by_ticker.get(*ticker).map(|(q, _)| *q).unwrap_or(Decimal::ZERO);
        let local_qty = local_by_ticker.get(*ticker).copied().unwrap_or(Decimal::ZERO);

        if broker_qty == local_qty {
            debug!(ticker, qty = %broker_qty, "position matches broker");
            continue;
        }

        divergences += 1;
        warn!(
            ticker,
            broker_qty = %broker_qty,
            local_qty = %local_qty,
            "position diverged from broker"
        );

        let ticker_holders = holders.get(*ticker).cloned().unwrap_or_default();
        match ticker_holders.len() {
            // Held locally by exactly one symphony: adopt the broker's truth.
            1 => {
                let symphony_id = ticker_holders.iter().next().expect("one holder");
                let price = broker_by_ticker
                    .get(*ticker)
                    .map(|(_, p)| *p)
                    .or_else(|| local.iter().find(|p| p.ticker == *ticker).map(|p| p.last_mark))
                    .unwrap_or(Decimal::ZERO);
                stores
                    .positions
                    .force_set(user_id, symphony_id, ticker, broker_qty, price);
                repaired += 1;
                info!(ticker, symphony_id = %symphony_id, qty = %broker_qty, "position repaired");
            }
            // Only the broker knows it, or several symphonies share it: the
            // right attribution is not decidable here.
            _ => {
                unresolved.push(format!(
                    "{ticker}: broker {broker_qty} vs local {local_qty} across {} symphonies",
                    ticker_holders.len()
                ));
            }
        }
    }

    let report = ReconcileReport {
        user_id: user_id.to_string(),
        checked: tickers.len(),
        divergences,
        repaired,
        unresolved,
        timestamp: Utc::now(),
    };

    info!(
        user_id,
        checked = report.checked,
        divergences = report.divergences,
        repaired = report.repaired,
        "position reconciliation finished"
    );
    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Account, BrokerOrder, BrokerPosition, OrderRequest};
    use crate::types::OrderSide;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct PositionsBroker {
        positions: Vec<BrokerPosition>,
    }

    fn broker_position(symbol: &str, qty: Decimal, price: Decimal) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.into(),
            qty,
            avg_entry_price: price,
            current_price: price,
            market_value: qty * price,
            unrealized_pl: Decimal::ZERO,
        }
    }

    #[async_trait]
    impl BrokerPort for PositionsBroker {
        async fn account(&self) -> Result<Account> {
            unimplemented!("not used")
        }
        async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(self.positions.clone())
        }
        async fn submit_order(&self, _r: &OrderRequest) -> Result<BrokerOrder> {
            unimplemented!("not used")
        }
        async fn get_order(&self, _id: &str) -> Result<BrokerOrder> {
            unimplemented!("not used")
        }
        async fn cancel_order(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn cancel_all_orders(&self) -> Result<()> {
            Ok(())
        }
        async fn close_position(&self, _symbol: &str) -> Result<BrokerOrder> {
            unimplemented!("not used")
        }
        async fn close_all_positions(&self) -> Result<Vec<BrokerOrder>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn matching_positions_are_clean() {
        let stores = Arc::new(EngineStores::new());
        stores
            .positions
            .apply_fill("u1", "s1", "SPY", OrderSide::Buy, dec!(10), dec!(100));

        let broker = PositionsBroker {
            positions: vec![broker_position("SPY", dec!(10), dec!(101))],
        };
        let report = reconcile_positions(&broker, &stores, "u1").await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.checked, 1);
        // Marks refreshed from the broker price.
        assert_eq!(stores.positions.list_for_user("u1")[0].last_mark, dec!(101));
    }

    #[tokio::test]
    async fn single_holder_divergence_is_repaired_to_broker_truth() {
        let stores = Arc::new(EngineStores::new());
        stores
            .positions
            .apply_fill("u1", "s1", "SPY", OrderSide::Buy, dec!(10), dec!(100));

        let broker = PositionsBroker {
            positions: vec![broker_position("SPY", dec!(8), dec!(100))],
        };
        let report = reconcile_positions(&broker, &stores, "u1").await.unwrap();

        assert_eq!(report.divergences, 1);
        assert_eq!(report.repaired, 1);
        assert_eq!(stores.positions.list_for_symphony("u1", "s1")[0].qty, dec!(8));
    }

    #[tokio::test]
    async fn ticker_gone_at_broker_archives_the_local_position() {
        let stores = Arc::new(EngineStores::new());
        stores
            .positions
            .apply_fill("u1", "s1", "GLD", OrderSide::Buy, dec!(5), dec!(180));

        let broker = PositionsBroker { positions: vec![] };
        let report = reconcile_positions(&broker, &stores, "u1").await.unwrap();

        assert_eq!(report.repaired, 1);
        assert!(stores.positions.list_for_user("u1").is_empty());
        assert_eq!(stores.positions.archived_count(), 1);
    }

    #[tokio::test]
    async fn ambiguous_divergences_are_reported_not_guessed() {
        let stores = Arc::new(EngineStores::new());
        // Two symphonies share the ticker: attribution is ambiguous.
        stores
            .positions
            .apply_fill("u1", "s1", "SPY", OrderSide::Buy, dec!(5), dec!(100));
        stores
            .positions
            .apply_fill("u1", "s2", "SPY", OrderSide::Buy, dec!(5), dec!(100));

        let broker = PositionsBroker {
            positions: vec![broker_position("SPY", dec!(7), dec!(100))],
        };
        let report = reconcile_positions(&broker, &stores, "u1").await.unwrap();

        assert_eq!(report.divergences, 1);
        assert_eq!(report.repaired, 0);
        assert_eq!(report.unresolved.len(), 1);
        // Local records untouched.
        assert_eq!(stores.positions.list_for_user("u1").len(), 2);
    }
}
