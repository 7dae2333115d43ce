// =============================================================================
// Order Planner — target weights + holdings + equity -> minimal order set
// =============================================================================
//
// All arithmetic is exact decimal. For every ticker in targets ∪ holdings the
// planner computes delta_value = equity·target − qty·price, skips dust below
// `min_order_dollars`, and converts the rest into share quantities
// (whole-share truncation toward zero unless the account supports fractional
// trading). Held tickers absent from the targets close in full.
//
// The plan never over-spends: when the buy total exceeds buying power, every
// buy scales down proportionally in a single pass. Emission order is
// deterministic — sells first (they release buying power), then buys by
// decreasing |delta_value|, ties broken by ticker.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::types::{OrderSide, Position, CASH_TICKER};

/// One planned order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderIntent {
    pub ticker: String,
    pub side: OrderSide,
    /// Always positive; the side carries the sign.
    pub qty: Decimal,
    pub reference_price: Decimal,
    /// Signed dollar move this order is meant to produce.
    pub delta_value: Decimal,
}

impl OrderIntent {
    pub fn signed_qty(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => self.qty,
            OrderSide::Sell => -self.qty,
        }
    }

    /// Dollars this order consumes (buys only).
    fn buy_value(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => self.qty * self.reference_price,
            OrderSide::Sell => Decimal::ZERO,
        }
    }
}

pub struct Planner {
    min_order_dollars: Decimal,
}

impl Planner {
    pub fn new(min_order_dollars: Decimal) -> Self {
        Self { min_order_dollars }
    }

    /// Build the order list.
    ///
    /// * `equity`       — total account equity.
    /// * `buying_power` — cash available for new buys.
    /// * `positions`    — current holdings of this symphony.
    /// * `targets`      — ticker -> weight fractions (the `CASH` row is not
    ///                    tradable and is ignored).
    /// * `marks`        — reference prices for tickers not currently held.
    /// * `fractional`   — whether the broker accepts fractional quantities.
    pub fn plan(
        &self,
        equity: Decimal,
        buying_power: Decimal,
        positions: &[Position],
        targets: &BTreeMap<String, Decimal>,
        marks: &BTreeMap<String, Decimal>,
        fractional: bool,
    ) -> Result<Vec<OrderIntent>> {
        // Aggregate holdings per ticker.
        let mut held: BTreeMap<String, (Decimal, Decimal)> = BTreeMap::new();
        for p in positions {
            let entry = held.entry(p.ticker.clone()).or_insert((Decimal::ZERO, p.last_mark));
            entry.0 += p.qty;
            entry.1 = p.last_mark;
        }

        let mut tickers: BTreeSet<&str> = held.keys().map(String::as_str).collect();
        tickers.extend(targets.keys().map(String::as_str));
        tickers.remove(CASH_TICKER);

        let mut sells: Vec<OrderIntent> = Vec::new();
        let mut buys: Vec<OrderIntent> = Vec::new();

        for ticker in tickers {
            let target_frac = targets.get(ticker).copied().unwrap_or(Decimal::ZERO);
            let (held_qty, held_price) = held.get(ticker).copied().unwrap_or((Decimal::ZERO, Decimal::ZERO));

            let price = marks
                .get(ticker)
                .copied()
                .filter(|p| *p > Decimal::ZERO)
                .or(if held_price > Decimal::ZERO { Some(held_price) } else { None })
                .ok_or_else(|| EngineError::DataUnavailable {
                    symbol: ticker.to_string(),
                    cause: "no reference price for planning".into(),
                })?;

            let target_value = equity * target_frac;
            let current_value = held_qty * price;
            let delta_value = target_value - current_value;

            if delta_value.abs() < self.min_order_dollars {
                continue;
            }

            if target_frac == Decimal::ZERO && held_qty > Decimal::ZERO {
                // Full close: sell the exact held quantity.
                sells.push(OrderIntent {
                    ticker: ticker.to_string(),
                    side: OrderSide::Sell,
                    qty: held_qty,
                    reference_price: price,
                    delta_value,
                });
                continue;
            }

            let qty = quantize(delta_value.abs() / price, fractional);
            if qty == Decimal::ZERO {
                continue;
            }

            let intent = OrderIntent {
                ticker: ticker.to_string(),
                side: if delta_value > Decimal::ZERO { OrderSide::Buy } else { OrderSide::Sell },
                qty,
                reference_price: price,
                delta_value,
            };
            match intent.side {
                OrderSide::Sell => sells.push(intent),
                OrderSide::Buy => buys.push(intent),
            }
        }

        // One proportional scale-down keeps the buy total within buying power.
        scale_buys_to_budget(&mut buys, buying_power, fractional);

        // Deterministic emission: sells first, each side by decreasing
        // |delta_value| with ticker as the tie-break.
        let by_magnitude = |a: &OrderIntent, b: &OrderIntent| {
            b.delta_value
                .abs()
                .cmp(&a.delta_value.abs())
                .then_with(|| a.ticker.cmp(&b.ticker))
        };
        sells.sort_by(by_magnitude);
        buys.sort_by(by_magnitude);

        let mut plan = sells;
        plan.extend(buys);

        debug!(orders = plan.len(), "rebalancing plan built");
        Ok(plan)
    }
}

/// Scale buy quantities so their total cost fits the available buying power.
/// Exposed for the executor, which re-runs this step when a sell fails and
/// the cash it would have released never arrives.
pub fn scale_buys_to_budget(buys: &mut Vec<OrderIntent>, buying_power: Decimal, fractional: bool) {
    let total: Decimal = buys.iter().map(OrderIntent::buy_value).sum();
    if total <= buying_power || total == Decimal::ZERO {
        return;
    }

    let factor = buying_power / total;
    warn!(
        needed = %total,
        available = %buying_power,
        factor = %factor,
        "buys exceed buying power, scaling down proportionally"
    );

    for buy in buys.iter_mut() {
        buy.qty = quantize(buy.qty * factor, fractional);
        buy.delta_value = buy.qty * buy.reference_price;
    }
    buys.retain(|b| b.qty > Decimal::ZERO);
}

/// Whole shares truncate toward zero; fractional accounts keep 4 decimals
/// (still truncated so a scale-down never rounds above budget).
fn quantize(qty: Decimal, fractional: bool) -> Decimal {
    if fractional {
        qty.trunc_with_scale(4)
    } else {
        qty.trunc()
    }
}
