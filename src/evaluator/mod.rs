// =============================================================================
// Tree Evaluator — interprets an annotated strategy tree into target weights
// =============================================================================
//
// The evaluator is pure: the same (tree, date, data context) always yields an
// identical `EvaluationResult`, including trace ordering. Evaluation rewrites
// a working set of (ticker, weight) rows while descending the tree:
//
//   asset     -> contributes itself (weight 0 until a weighting step acts)
//   group     -> concatenates children; duplicate tickers collapse, weights sum
//   if        -> evaluates the branch condition against the context;
//                missing values fail closed (condition = false)
//   filter    -> scores children by a metric, keeps a subset deterministically
//   wt-*      -> assigns weights over the asset set produced by its children
//
// Missing indicator values are never coerced to zero: a condition with a
// missing operand is false, and an asset without the value a weighting needs
// drops out before normalisation. After the root, the allocation constraint
// (cash buffer, min/max clips) runs and weights are rounded to 4 decimals.
// =============================================================================

pub mod context;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::symphony::tree::{
    Condition, MetricFn, Operand, Selector, StepKind, StepNode,
};
use crate::symphony::validator::{ValidatedSymphony, DEFAULT_WEIGHTING_WINDOW};
use crate::types::CASH_TICKER;
use context::DataContext;

/// Tolerance on the final weight sum.
const SUM_TOLERANCE: &str = "0.001";

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of evaluating one tree at one date.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    /// Ticker -> weight. Sums to 1 (within tolerance) or is `{CASH: 1}`.
    pub weights: BTreeMap<String, Decimal>,
    /// Assets considered but dropped (no data, filtered out, below minimum).
    pub excluded: BTreeSet<String>,
    /// Human-readable decision log in deterministic order.
    pub trace: Vec<String>,
    /// Non-fatal notes (an unrecoverable failure returns `Err` instead).
    pub errors: Vec<String>,
}

/// Top-level allocation constraints applied after the root's children.
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    /// Cash proportion withheld from investment, in [0, 0.5).
    pub cash_buffer: Decimal,
    /// Weights below this are dropped (then the rest renormalises).
    pub min_allocation: Decimal,
    /// Per-asset ceiling.
    pub max_allocation: Decimal,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            cash_buffer: Decimal::ZERO,
            min_allocation: Decimal::ZERO,
            max_allocation: Decimal::ONE,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct Evaluator {
    policy: AllocationPolicy,
}

#[derive(Debug, Clone)]
struct Pick {
    ticker: String,
    weight: Decimal,
}

#[derive(Default)]
struct Scratch {
    trace: Vec<String>,
    excluded: BTreeSet<String>,
    errors: Vec<String>,
}

impl Evaluator {
    pub fn new(mut policy: AllocationPolicy) -> Self {
        // Cash buffer is defined on [0, 0.5).
        let half = Decimal::new(5, 1);
        if policy.cash_buffer < Decimal::ZERO || policy.cash_buffer >= half {
            policy.cash_buffer = Decimal::ZERO;
        }
        Self { policy }
    }

    /// Evaluate a validated tree at `date` against a pre-populated context.
    pub fn evaluate(
        &self,
        symphony: &ValidatedSymphony,
        date: NaiveDate,
        ctx: &DataContext,
    ) -> Result<EvaluationResult> {
        let mut scratch = Scratch::default();
        let picks = self.eval_children(&symphony.tree.children, date, ctx, &mut scratch)?;
        let picks = collapse(picks);

        let weights = self.apply_allocation(picks, &mut scratch)?;

        debug!(
            symphony_id = %symphony.tree.id,
            assets = weights.len(),
            excluded = scratch.excluded.len(),
            "evaluation finished"
        );

        Ok(EvaluationResult {
            weights,
            excluded: scratch.excluded,
            trace: scratch.trace,
            errors: scratch.errors,
        })
    }

    // -------------------------------------------------------------------------
    // Tree descent
    // -------------------------------------------------------------------------

    fn eval_children(
        &self,
        nodes: &[StepNode],
        date: NaiveDate,
        ctx: &DataContext,
        s: &mut Scratch,
    ) -> Result<Vec<Pick>> {
        let mut out = Vec::new();
        for node in nodes {
            out.extend(self.eval_node(node, date, ctx, s)?);
        }
        Ok(out)
    }

    fn eval_node(
        &self,
        node: &StepNode,
        date: NaiveDate,
        ctx: &DataContext,
        s: &mut Scratch,
    ) -> Result<Vec<Pick>> {
        match &node.kind {
            StepKind::Asset { ticker, .. } => {
                if ctx.has(ticker) {
                    Ok(vec![Pick { ticker: ticker.clone(), weight: Decimal::ZERO }])
                } else {
                    s.excluded.insert(ticker.clone());
                    s.trace.push(format!("asset {ticker}: no market data, dropped"));
                    Ok(vec![])
                }
            }
            StepKind::Group => {
                let picks = self.eval_children(&node.children, date, ctx, s)?;
                Ok(collapse(picks))
            }
            StepKind::If => self.eval_if(node, date, ctx, s),
            // A branch reached outside an `if` dispatch (defensive): behave
            // like a transparent container.
            StepKind::IfBranch { .. } => self.eval_children(&node.children, date, ctx, s),
            StepKind::Filter { .. } => self.eval_filter(node, date, ctx, s),
            StepKind::WeightEqual { .. } => {
                let picks = collapse(self.eval_children(&node.children, date, ctx, s)?);
                self.weight_equal(node, picks, s)
            }
            StepKind::WeightSpecified { .. } => self.weight_specified(node, ctx, s),
            StepKind::WeightInverseVol { window_days } | StepKind::WeightRiskParity { window_days } => {
                let picks = collapse(self.eval_children(&node.children, date, ctx, s)?);
                self.weight_inverse_vol(node, *window_days, picks, ctx, s)
            }
            StepKind::WeightMarketCap { .. } => {
                let picks = collapse(self.eval_children(&node.children, date, ctx, s)?);
                self.weight_market_cap(node, picks, ctx, s)
            }
        }
    }

    fn eval_if(
        &self,
        node: &StepNode,
        date: NaiveDate,
        ctx: &DataContext,
        s: &mut Scratch,
    ) -> Result<Vec<Pick>> {
        let then_branch = node
            .children
            .iter()
            .find(|c| matches!(c.kind, StepKind::IfBranch { is_else: false, .. }))
            .ok_or_else(|| EngineError::Eval(format!("if step '{}' has no conditional branch", node.id)))?;
        let else_branch = node
            .children
            .iter()
            .find(|c| matches!(c.kind, StepKind::IfBranch { is_else: true, .. }))
            .ok_or_else(|| EngineError::Eval(format!("if step '{}' has no else branch", node.id)))?;

        let condition = match &then_branch.kind {
            StepKind::IfBranch { condition: Some(c), .. } => c,
            _ => {
                return Err(EngineError::Eval(format!(
                    "branch '{}' carries no condition",
                    then_branch.id
                )))
            }
        };

        let (truth, detail) = eval_condition(condition, ctx);
        let branch = if truth { "then" } else { "else" };
        s.trace.push(format!("if {}: {detail} -> {branch}", node.id));

        let chosen = if truth { then_branch } else { else_branch };
        let picks = self.eval_children(&chosen.children, date, ctx, s)?;
        Ok(collapse(picks))
    }

    fn eval_filter(
        &self,
        node: &StepNode,
        date: NaiveDate,
        ctx: &DataContext,
        s: &mut Scratch,
    ) -> Result<Vec<Pick>> {
        let (sort_fn, window, benchmark, selector, take) = match &node.kind {
            StepKind::Filter { sort_fn, window, benchmark, selector, take } => {
                (*sort_fn, *window, benchmark.clone(), *selector, *take)
            }
            _ => unreachable!("eval_filter dispatched on a non-filter node"),
        };

        // Score each child by the sort metric over the assets it resolves to.
        struct Scored {
            picks: Vec<Pick>,
            score: f64,
            key: String,
        }

        let mut scored = Vec::new();
        for child in &node.children {
            let picks = self.eval_node(child, date, ctx, s)?;
            if picks.is_empty() {
                continue;
            }

            let values: Vec<f64> = picks
                .iter()
                .filter_map(|p| ctx.metric_parts(sort_fn, window, &p.ticker, benchmark.as_deref()))
                .collect();

            if values.is_empty() {
                for p in &picks {
                    s.excluded.insert(p.ticker.clone());
                }
                s.trace.push(format!(
                    "filter {}: no {} value for {}, dropped",
                    node.id,
                    sort_fn,
                    join_tickers(&picks)
                ));
                continue;
            }

            let score = values.iter().sum::<f64>() / values.len() as f64;
            let key = picks
                .iter()
                .map(|p| p.ticker.clone())
                .min()
                .unwrap_or_default();
            scored.push(Scored { picks, score, key });
        }

        // Deterministic ordering: score, then ticker lexicographic ascending.
        match selector {
            Selector::Top => scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.key.cmp(&b.key))
            }),
            Selector::Bottom => scored.sort_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.key.cmp(&b.key))
            }),
            Selector::All => {}
            Selector::Random => {
                // Seeded by (step id, date) so equal inputs shuffle equally.
                let mut rng = ChaCha8Rng::seed_from_u64(seed_for(&node.id, date));
                scored.shuffle(&mut rng);
            }
        }

        let keep = match (selector, take) {
            (Selector::All, _) => scored.len(),
            (_, Some(n)) => n.min(scored.len()),
            (_, None) => scored.len(),
        };

        let (kept, dropped) = scored.split_at(keep.min(scored.len()));
        for child in dropped {
            for p in &child.picks {
                s.excluded.insert(p.ticker.clone());
            }
        }

        let kept_names: Vec<String> = kept.iter().map(|c| c.key.clone()).collect();
        s.trace.push(format!(
            "filter {}: {} by {} kept [{}]",
            node.id,
            selector.token(),
            sort_fn,
            kept_names.join(",")
        ));

        let picks = kept.iter().flat_map(|c| c.picks.clone()).collect();
        Ok(collapse(picks))
    }

    // -------------------------------------------------------------------------
    // Weighting steps
    // -------------------------------------------------------------------------

    fn weight_equal(&self, node: &StepNode, picks: Vec<Pick>, s: &mut Scratch) -> Result<Vec<Pick>> {
        if picks.is_empty() {
            s.trace.push(format!("wt-equal {}: no assets", node.id));
            return Ok(picks);
        }
        let share = Decimal::ONE / Decimal::from(picks.len() as u64);
        s.trace.push(format!("wt-equal {}: {} assets", node.id, picks.len()));
        Ok(picks
            .into_iter()
            .map(|p| Pick { weight: share, ..p })
            .collect())
    }

    /// Node-carried weights pass through; the weight of any asset missing
    /// from the context is redistributed proportionally across the rest.
    fn weight_specified(
        &self,
        node: &StepNode,
        ctx: &DataContext,
        s: &mut Scratch,
    ) -> Result<Vec<Pick>> {
        let mut entries: Vec<(String, Decimal)> = Vec::new();
        for child in &node.children {
            if let StepKind::Asset { ticker, weight: Some(w), .. } = &child.kind {
                let value = w.to_decimal().ok_or_else(|| {
                    EngineError::Eval(format!("asset '{ticker}' carries a degenerate weight"))
                })?;
                if ctx.has(ticker) {
                    entries.push((ticker.clone(), value));
                } else {
                    s.excluded.insert(ticker.clone());
                    s.trace.push(format!(
                        "wt-specified {}: {ticker} unavailable, weight redistributed",
                        node.id
                    ));
                }
            }
        }

        let total: Decimal = entries.iter().map(|(_, w)| *w).sum();
        if entries.is_empty() || total <= Decimal::ZERO {
            s.trace.push(format!("wt-specified {}: no available assets", node.id));
            return Ok(vec![]);
        }

        Ok(entries
            .into_iter()
            .map(|(ticker, w)| Pick { ticker, weight: w / total })
            .collect())
    }

    /// weight_i = (1/vol_i) / sum(1/vol_j); assets with undefined or zero
    /// volatility drop out before normalisation. Risk parity shares this
    /// rule at the current fidelity.
    fn weight_inverse_vol(
        &self,
        node: &StepNode,
        window_days: Option<u32>,
        picks: Vec<Pick>,
        ctx: &DataContext,
        s: &mut Scratch,
    ) -> Result<Vec<Pick>> {
        let window = window_days.unwrap_or(DEFAULT_WEIGHTING_WINDOW);

        let mut kept: Vec<(Pick, f64)> = Vec::new();
        for p in picks {
            match ctx.metric_parts(MetricFn::Volatility, window, &p.ticker, None) {
                Some(vol) if vol > 0.0 => kept.push((p, 1.0 / vol)),
                _ => {
                    s.trace.push(format!(
                        "wt-inverse-vol {}: no volatility for {}, dropped",
                        node.id, p.ticker
                    ));
                    s.excluded.insert(p.ticker);
                }
            }
        }

        let total: f64 = kept.iter().map(|(_, inv)| inv).sum();
        if kept.is_empty() || total <= 0.0 {
            return Ok(vec![]);
        }

        kept.into_iter()
            .map(|(p, inv)| {
                let w = Decimal::from_f64(inv / total).ok_or_else(|| {
                    EngineError::Eval(format!("inverse-vol weight for {} not representable", p.ticker))
                })?;
                Ok(Pick { weight: w, ..p })
            })
            .collect()
    }

    fn weight_market_cap(
        &self,
        node: &StepNode,
        picks: Vec<Pick>,
        ctx: &DataContext,
        s: &mut Scratch,
    ) -> Result<Vec<Pick>> {
        let mut kept: Vec<(Pick, f64)> = Vec::new();
        for p in picks {
            match ctx.market_cap(&p.ticker) {
                Some(cap) if cap > 0.0 => kept.push((p, cap)),
                _ => {
                    s.trace.push(format!(
                        "wt-market-cap {}: no market cap for {}, dropped",
                        node.id, p.ticker
                    ));
                    s.excluded.insert(p.ticker);
                }
            }
        }

        let total: f64 = kept.iter().map(|(_, cap)| cap).sum();
        if kept.is_empty() || total <= 0.0 {
            return Ok(vec![]);
        }

        kept.into_iter()
            .map(|(p, cap)| {
                let w = Decimal::from_f64(cap / total).ok_or_else(|| {
                    EngineError::Eval(format!("market-cap weight for {} not representable", p.ticker))
                })?;
                Ok(Pick { weight: w, ..p })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Allocation constraint
    // -------------------------------------------------------------------------

    fn apply_allocation(
        &self,
        picks: Vec<Pick>,
        s: &mut Scratch,
    ) -> Result<BTreeMap<String, Decimal>> {
        if picks.is_empty() {
            s.trace.push("allocation: no investable assets, all cash".into());
            return Ok(BTreeMap::from([(CASH_TICKER.to_string(), Decimal::ONE)]));
        }

        let mut picks = picks;
        let mut total: Decimal = picks.iter().map(|p| p.weight).sum();

        // A working set that reached the root without any weighting step is
        // equal-weighted rather than collapsing to cash.
        if total == Decimal::ZERO {
            let share = Decimal::ONE / Decimal::from(picks.len() as u64);
            for p in &mut picks {
                p.weight = share;
            }
            total = Decimal::ONE;
            s.trace.push("allocation: implicit equal weighting".into());
        }

        let investable = Decimal::ONE - self.policy.cash_buffer;

        // Normalise to the investable share and clip ceilings.
        for p in &mut picks {
            p.weight = (p.weight / total) * investable;
            if p.weight > self.policy.max_allocation {
                p.weight = self.policy.max_allocation;
            }
        }

        // Drop the dust below the floor, then renormalise the survivors.
        if self.policy.min_allocation > Decimal::ZERO {
            let (kept, dropped): (Vec<Pick>, Vec<Pick>) = picks
                .into_iter()
                .partition(|p| p.weight >= self.policy.min_allocation);
            for p in &dropped {
                s.excluded.insert(p.ticker.clone());
                s.trace
                    .push(format!("allocation: {} below minimum, dropped", p.ticker));
            }
            picks = kept;
            if picks.is_empty() {
                s.trace.push("allocation: nothing above minimum, all cash".into());
                return Ok(BTreeMap::from([(CASH_TICKER.to_string(), Decimal::ONE)]));
            }
            let remaining: Decimal = picks.iter().map(|p| p.weight).sum();
            if remaining > Decimal::ZERO {
                for p in &mut picks {
                    p.weight = (p.weight / remaining) * investable;
                }
            }
        }

        // Round to 4 decimals, parking the rounding residual on the largest
        // weight so the sum stays exact.
        let mut weights: BTreeMap<String, Decimal> = BTreeMap::new();
        for p in &picks {
            let rounded = p
                .weight
                .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero);
            weights.insert(p.ticker.clone(), rounded);
        }
        let rounded_sum: Decimal = weights.values().copied().sum();
        let residual = investable - rounded_sum;
        if residual != Decimal::ZERO {
            if let Some(largest) = picks
                .iter()
                .max_by(|a, b| a.weight.cmp(&b.weight).then_with(|| b.ticker.cmp(&a.ticker)))
            {
                if let Some(w) = weights.get_mut(&largest.ticker) {
                    *w += residual;
                }
            }
        }

        if self.policy.cash_buffer > Decimal::ZERO {
            weights.insert(CASH_TICKER.to_string(), self.policy.cash_buffer);
        }

        // Final invariant: weights in [0,1], sum within tolerance of 1.
        let tolerance: Decimal = SUM_TOLERANCE.parse().unwrap_or_default();
        let sum: Decimal = weights.values().copied().sum();
        if (sum - Decimal::ONE).abs() > tolerance {
            return Err(EngineError::Eval(format!("final weights sum to {sum}, expected 1")));
        }
        if weights.values().any(|w| *w < Decimal::ZERO || *w > Decimal::ONE) {
            return Err(EngineError::Eval("a final weight escaped [0, 1]".into()));
        }

        Ok(weights)
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(AllocationPolicy::default())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Collapse duplicate tickers, summing weights; first-occurrence order is
/// preserved.
fn collapse(picks: Vec<Pick>) -> Vec<Pick> {
    let mut out: Vec<Pick> = Vec::with_capacity(picks.len());
    for pick in picks {
        match out.iter_mut().find(|p| p.ticker == pick.ticker) {
            Some(existing) => existing.weight += pick.weight,
            None => out.push(pick),
        }
    }
    out
}

/// Evaluate a branch condition. A missing operand makes the condition false.
fn eval_condition(cond: &Condition, ctx: &DataContext) -> (bool, String) {
    let lhs = ctx.metric(&cond.lhs);
    let rhs = match &cond.rhs {
        Operand::Literal(v) => Some(*v),
        Operand::Metric(m) => ctx.metric(m),
    };

    match (lhs, rhs) {
        (Some(l), Some(r)) => {
            let truth = cond.cmp.compare(l, r);
            (truth, format!("{cond} [lhs={l}, rhs={r}] = {truth}"))
        }
        (None, _) => (false, format!("{cond} [no value for {}] = false", cond.lhs)),
        (_, None) => {
            let what = match &cond.rhs {
                Operand::Metric(m) => m.to_string(),
                Operand::Literal(v) => v.to_string(),
            };
            (false, format!("{cond} [no value for {what}] = false"))
        }
    }
}

fn join_tickers(picks: &[Pick]) -> String {
    picks
        .iter()
        .map(|p| p.ticker.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// FNV-1a over the step id and date — a stable seed for the `random`
/// selector, independent of process or platform.
fn seed_for(id: &str, date: NaiveDate) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.bytes().chain(date.num_days_from_ce().to_le_bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::context::AssetSnapshot;
    use super::*;
    use crate::symphony::parser::parse_str;
    use crate::symphony::validator::validate;
    use rust_decimal_macros::dec;

    fn eval_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    fn snapshot(ticker: &str, price: f64, closes: Vec<f64>) -> AssetSnapshot {
        AssetSnapshot {
            ticker: ticker.into(),
            as_of: eval_date(),
            price,
            closes,
            volume: 1000.0,
            market_cap: None,
        }
    }

    /// 21 closes whose 20-day cumulative return is exactly `ret`.
    fn closes_with_cum_return(ret: f64) -> Vec<f64> {
        let mut closes = vec![1.0; 21];
        closes[0] = 1.0 + ret;
        closes
    }

    fn validated(json: &str) -> ValidatedSymphony {
        validate(&parse_str(json).unwrap()).unwrap()
    }

    // ---- seed scenario: momentum top-2 of 3, equal weight ------------------

    fn momentum_tree() -> ValidatedSymphony {
        validated(
            r#"{
            "id": "s", "step": "root", "name": "momentum", "rebalance": "daily",
            "children": [{
                "id": "wt", "step": "wt-cash-equal",
                "children": [{
                    "id": "flt", "step": "filter",
                    "sort-by-fn": "cumulative-return", "sort-by-fn-params": {"window": 20},
                    "select-fn": "top", "select-n": 2,
                    "children": [
                        {"id": "a1", "step": "asset", "ticker": "AAA", "exchange": "ARCX", "name": "A"},
                        {"id": "a2", "step": "asset", "ticker": "BBB", "exchange": "ARCX", "name": "B"},
                        {"id": "a3", "step": "asset", "ticker": "CCC", "exchange": "ARCX", "name": "C"}
                    ]
                }]
            }]
        }"#,
        )
    }

    fn momentum_ctx() -> DataContext {
        DataContext::new([
            snapshot("AAA", 1.10, closes_with_cum_return(0.10)),
            snapshot("BBB", 1.05, closes_with_cum_return(0.05)),
            snapshot("CCC", 1.20, closes_with_cum_return(0.20)),
        ])
    }

    #[test]
    fn momentum_top_two_equal_weight() {
        let result = Evaluator::default()
            .evaluate(&momentum_tree(), eval_date(), &momentum_ctx())
            .unwrap();

        assert_eq!(result.weights.len(), 2);
        assert_eq!(result.weights["CCC"], dec!(0.5));
        assert_eq!(result.weights["AAA"], dec!(0.5));
        assert!(result.excluded.contains("BBB"));
    }

    #[test]
    fn evaluator_is_deterministic_byte_for_byte() {
        let tree = momentum_tree();
        let ctx = momentum_ctx();
        let evaluator = Evaluator::default();

        let a = serde_json::to_string(&evaluator.evaluate(&tree, eval_date(), &ctx).unwrap()).unwrap();
        let b = serde_json::to_string(&evaluator.evaluate(&tree, eval_date(), &ctx).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    // ---- seed scenario: conditional branch ----------------------------------

    fn conditional_tree() -> ValidatedSymphony {
        validated(
            r#"{
            "id": "s", "step": "root", "name": "defensive", "rebalance": "daily",
            "children": [{
                "id": "if1", "step": "if",
                "children": [
                    {
                        "id": "then", "step": "if-child", "is-else-condition?": false,
                        "lhs-fn": "relative-strength-index", "lhs-fn-params": {"window": 14},
                        "lhs-val": "SPY", "comparator": "lt", "rhs-val": "30", "rhs-fixed-value?": true,
                        "children": [{
                            "id": "w1", "step": "wt-cash-specified",
                            "children": [
                                {"id": "q1", "step": "asset", "ticker": "QQQ", "exchange": "XNAS",
                                 "name": "Q", "weight": {"num": 4, "den": 5}},
                                {"id": "t1", "step": "asset", "ticker": "TLT", "exchange": "XNAS",
                                 "name": "T", "weight": {"num": 1, "den": 5}}
                            ]
                        }]
                    },
                    {
                        "id": "else", "step": "if-child", "is-else-condition?": true,
                        "children": [{
                            "id": "w2", "step": "wt-cash-specified",
                            "children": [
                                {"id": "q2", "step": "asset", "ticker": "QQQ", "exchange": "XNAS",
                                 "name": "Q", "weight": {"num": 1, "den": 5}},
                                {"id": "t2", "step": "asset", "ticker": "TLT", "exchange": "XNAS",
                                 "name": "T", "weight": {"num": 4, "den": 5}}
                            ]
                        }]
                    }
                ]
            }]
        }"#,
        )
    }

    fn conditional_ctx(spy_rising: bool) -> DataContext {
        // Monotone series pin RSI to 100 (rising) or 0 (falling).
        let spy_closes: Vec<f64> = if spy_rising {
            (1..=40).rev().map(|x| x as f64).collect()
        } else {
            (1..=40).map(|x| x as f64).collect()
        };
        DataContext::new([
            snapshot("SPY", 100.0, spy_closes),
            snapshot("QQQ", 400.0, vec![400.0; 40]),
            snapshot("TLT", 90.0, vec![90.0; 40]),
        ])
    }

    #[test]
    fn oversold_market_takes_the_then_branch() {
        let result = Evaluator::default()
            .evaluate(&conditional_tree(), eval_date(), &conditional_ctx(false))
            .unwrap();
        assert_eq!(result.weights["QQQ"], dec!(0.8));
        assert_eq!(result.weights["TLT"], dec!(0.2));
        assert!(result.trace.iter().any(|t| t.contains("-> then")));
    }

    #[test]
    fn healthy_market_takes_the_else_branch() {
        let result = Evaluator::default()
            .evaluate(&conditional_tree(), eval_date(), &conditional_ctx(true))
            .unwrap();
        assert_eq!(result.weights["QQQ"], dec!(0.2));
        assert_eq!(result.weights["TLT"], dec!(0.8));
        assert!(result.trace.iter().any(|t| t.contains("-> else")));
    }

    #[test]
    fn missing_condition_value_fails_closed() {
        // SPY absent from the context: the condition must read false and the
        // else branch must run.
        let ctx = DataContext::new([
            snapshot("QQQ", 400.0, vec![400.0; 40]),
            snapshot("TLT", 90.0, vec![90.0; 40]),
        ]);
        let result = Evaluator::default()
            .evaluate(&conditional_tree(), eval_date(), &ctx)
            .unwrap();
        assert_eq!(result.weights["TLT"], dec!(0.8));
        assert!(result.trace.iter().any(|t| t.contains("no value")));
    }

    // ---- weighting rules -----------------------------------------------------

    #[test]
    fn specified_weights_redistribute_when_an_asset_is_missing() {
        let tree = validated(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "w", "step": "wt-cash-specified",
                "children": [
                    {"id": "a", "step": "asset", "ticker": "AAA", "exchange": "ARCX", "name": "A",
                     "weight": {"num": 6, "den": 10}},
                    {"id": "b", "step": "asset", "ticker": "BBB", "exchange": "ARCX", "name": "B",
                     "weight": {"num": 3, "den": 10}},
                    {"id": "c", "step": "asset", "ticker": "CCC", "exchange": "ARCX", "name": "C",
                     "weight": {"num": 1, "den": 10}}
                ]
            }]
        }"#,
        );
        // CCC has no data; its 0.1 redistributes 6:3 across AAA and BBB.
        let ctx = DataContext::new([
            snapshot("AAA", 10.0, vec![10.0; 30]),
            snapshot("BBB", 10.0, vec![10.0; 30]),
        ]);
        let result = Evaluator::default().evaluate(&tree, eval_date(), &ctx).unwrap();

        let sum: Decimal = result.weights.values().copied().sum();
        assert!((sum - Decimal::ONE).abs() <= dec!(0.001));
        assert!((result.weights["AAA"] - dec!(0.6667)).abs() <= dec!(0.0001));
        assert!((result.weights["BBB"] - dec!(0.3333)).abs() <= dec!(0.0001));
        assert!(result.excluded.contains("CCC"));
    }

    #[test]
    fn inverse_vol_drops_assets_without_volatility() {
        let tree = validated(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "w", "step": "wt-inverse-vol", "window-days": 10,
                "children": [
                    {"id": "a", "step": "asset", "ticker": "AAA", "exchange": "ARCX", "name": "A"},
                    {"id": "b", "step": "asset", "ticker": "BBB", "exchange": "ARCX", "name": "B"},
                    {"id": "c", "step": "asset", "ticker": "CCC", "exchange": "ARCX", "name": "C"}
                ]
            }]
        }"#,
        );

        // AAA and BBB have identical wavy series (equal vol); CCC is flat, so
        // its volatility is zero and it must drop out.
        let wavy: Vec<f64> = (0..30).map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let ctx = DataContext::new([
            snapshot("AAA", 100.0, wavy.clone()),
            snapshot("BBB", 100.0, wavy),
            snapshot("CCC", 100.0, vec![100.0; 30]),
        ]);
        let result = Evaluator::default().evaluate(&tree, eval_date(), &ctx).unwrap();

        assert_eq!(result.weights.len(), 2);
        assert_eq!(result.weights["AAA"], result.weights["BBB"]);
        assert!(result.excluded.contains("CCC"));
    }

    #[test]
    fn group_collapses_duplicate_tickers() {
        let tree = validated(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "w", "step": "wt-cash-equal",
                "children": [{
                    "id": "g", "step": "group",
                    "children": [
                        {"id": "a", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S"},
                        {"id": "b", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S again"},
                        {"id": "c", "step": "asset", "ticker": "AGG", "exchange": "ARCX", "name": "A"}
                    ]
                }]
            }]
        }"#,
        );
        let ctx = DataContext::new([
            snapshot("SPY", 500.0, vec![500.0; 30]),
            snapshot("AGG", 100.0, vec![100.0; 30]),
        ]);
        let result = Evaluator::default().evaluate(&tree, eval_date(), &ctx).unwrap();
        assert_eq!(result.weights.len(), 2);
        assert_eq!(result.weights["SPY"], dec!(0.5));
        assert_eq!(result.weights["AGG"], dec!(0.5));
    }

    #[test]
    fn filter_ties_break_by_ticker_ascending() {
        let tree = validated(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "f", "step": "filter",
                "sort-by-fn": "cumulative-return", "sort-by-fn-params": {"window": 20},
                "select-fn": "top", "select-n": 1,
                "children": [
                    {"id": "z", "step": "asset", "ticker": "ZZZ", "exchange": "ARCX", "name": "Z"},
                    {"id": "m", "step": "asset", "ticker": "MMM", "exchange": "ARCX", "name": "M"}
                ]
            }]
        }"#,
        );
        let ctx = DataContext::new([
            snapshot("ZZZ", 1.1, closes_with_cum_return(0.10)),
            snapshot("MMM", 1.1, closes_with_cum_return(0.10)),
        ]);
        let result = Evaluator::default().evaluate(&tree, eval_date(), &ctx).unwrap();
        assert!(result.weights.contains_key("MMM"));
        assert!(result.excluded.contains("ZZZ"));
    }

    #[test]
    fn empty_context_collapses_to_cash() {
        let result = Evaluator::default()
            .evaluate(&momentum_tree(), eval_date(), &DataContext::new([]))
            .unwrap();
        assert_eq!(result.weights.len(), 1);
        assert_eq!(result.weights[CASH_TICKER], Decimal::ONE);
    }

    #[test]
    fn cash_buffer_reduces_investable_weight() {
        let evaluator = Evaluator::new(AllocationPolicy {
            cash_buffer: dec!(0.1),
            ..AllocationPolicy::default()
        });
        let result = evaluator
            .evaluate(&momentum_tree(), eval_date(), &momentum_ctx())
            .unwrap();

        assert_eq!(result.weights[CASH_TICKER], dec!(0.1));
        assert_eq!(result.weights["AAA"], dec!(0.45));
        assert_eq!(result.weights["CCC"], dec!(0.45));
        let sum: Decimal = result.weights.values().copied().sum();
        assert_eq!(sum, Decimal::ONE);
    }

    #[test]
    fn weights_always_in_unit_interval_and_sum_to_one() {
        for ctx in [momentum_ctx(), conditional_ctx(true)] {
            for tree in [momentum_tree(), conditional_tree()] {
                if let Ok(result) = Evaluator::default().evaluate(&tree, eval_date(), &ctx) {
                    let sum: Decimal = result.weights.values().copied().sum();
                    assert!((sum - Decimal::ONE).abs() <= dec!(0.001), "sum {sum}");
                    for w in result.weights.values() {
                        assert!(*w >= Decimal::ZERO && *w <= Decimal::ONE);
                    }
                }
            }
        }
    }

    #[test]
    fn random_selector_is_stable_for_equal_inputs() {
        let tree = validated(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "f", "step": "filter",
                "sort-by-fn": "current-price",
                "select-fn": "random", "select-n": 1,
                "children": [
                    {"id": "a", "step": "asset", "ticker": "AAA", "exchange": "ARCX", "name": "A"},
                    {"id": "b", "step": "asset", "ticker": "BBB", "exchange": "ARCX", "name": "B"},
                    {"id": "c", "step": "asset", "ticker": "CCC", "exchange": "ARCX", "name": "C"}
                ]
            }]
        }"#,
        );
        let ctx = DataContext::new([
            snapshot("AAA", 1.0, vec![1.0; 5]),
            snapshot("BBB", 2.0, vec![2.0; 5]),
            snapshot("CCC", 3.0, vec![3.0; 5]),
        ]);
        let evaluator = Evaluator::default();
        let first = evaluator.evaluate(&tree, eval_date(), &ctx).unwrap();
        let second = evaluator.evaluate(&tree, eval_date(), &ctx).unwrap();
        assert_eq!(first.weights, second.weights);
    }
}
