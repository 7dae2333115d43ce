// =============================================================================
// Symphony validator — structure, bounds, metrics, and the requirement
// manifest
// =============================================================================
//
// Validation runs after parsing and before a symphony may be activated. It
// enforces the structural rules the parser deliberately leaves alone, bounds
// overall complexity, checks every metric invocation, and annotates the tree
// with the union of (ticker, metric, window) requirements the evaluator must
// pre-fetch.
// =============================================================================

use std::collections::{BTreeSet, HashSet};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::symphony::tree::{MetricFn, MetricRef, Operand, StepKind, StepNode, StrategyTree};

/// Complexity ceilings. A tree exceeding any of these fails with `Bounds`.
pub const MAX_STEPS: usize = 1000;
pub const MAX_DEPTH: usize = 20;
pub const MAX_ASSETS: usize = 100;

/// Allowed metric look-back range in trading days.
pub const MIN_WINDOW: u32 = 1;
pub const MAX_WINDOW: u32 = 252;

/// Tolerance for specified-weight sums.
const WEIGHT_SUM_TOLERANCE: &str = "0.001";

/// Default volatility look-back for weighting steps that omit `window-days`.
pub const DEFAULT_WEIGHTING_WINDOW: u32 = 20;

// ---------------------------------------------------------------------------
// Requirement manifest
// ---------------------------------------------------------------------------

/// Everything a tree needs before it can evaluate: the tickers whose
/// snapshots must exist and the exact metric invocations to warm.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequirementManifest {
    pub tickers: BTreeSet<String>,
    pub metrics: BTreeSet<MetricRef>,
}

impl RequirementManifest {
    fn absorb(&mut self, other: RequirementManifest) {
        self.tickers.extend(other.tickers);
        self.metrics.extend(other.metrics);
    }

    fn add_metric(&mut self, m: MetricRef) {
        self.tickers.insert(m.ticker.clone());
        if let Some(b) = &m.benchmark {
            self.tickers.insert(b.clone());
        }
        self.metrics.insert(m);
    }
}

/// A tree that passed validation, with its pre-computed requirements.
#[derive(Debug, Clone)]
pub struct ValidatedSymphony {
    pub tree: StrategyTree,
    pub manifest: RequirementManifest,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed tree and produce its requirement manifest.
pub fn validate(tree: &StrategyTree) -> Result<ValidatedSymphony> {
    if tree.children.is_empty() {
        return Err(EngineError::Structure("symphony must have at least one child step".into()));
    }

    let mut ctx = WalkContext::default();
    let mut manifest = RequirementManifest::default();
    for child in &tree.children {
        let child_manifest = ctx.walk(child, 1, false)?;
        manifest.absorb(child_manifest);
    }

    // Bounds apply to the whole tree, after the walk has counted it.
    if ctx.steps > MAX_STEPS {
        return Err(EngineError::Bounds(format!(
            "symphony has {} steps (limit {MAX_STEPS})",
            ctx.steps
        )));
    }
    if ctx.max_depth > MAX_DEPTH {
        return Err(EngineError::Bounds(format!(
            "symphony depth {} exceeds limit {MAX_DEPTH}",
            ctx.max_depth
        )));
    }
    if ctx.assets.len() > MAX_ASSETS {
        return Err(EngineError::Bounds(format!(
            "symphony references {} assets (limit {MAX_ASSETS})",
            ctx.assets.len()
        )));
    }

    let mut warnings = ctx.warnings;
    if ctx.assets.is_empty() {
        warnings.push("symphony contains no assets".into());
    }

    Ok(ValidatedSymphony { tree: tree.clone(), manifest, warnings })
}

#[derive(Default)]
struct WalkContext {
    steps: usize,
    max_depth: usize,
    assets: BTreeSet<String>,
    seen_ids: HashSet<String>,
    warnings: Vec<String>,
}

impl WalkContext {
    /// Validate one node and return its requirement manifest (own + children).
    fn walk(&mut self, node: &StepNode, depth: usize, parent_is_if: bool) -> Result<RequirementManifest> {
        // The visit set guards against reference loops in malformed input:
        // a node id may appear exactly once in the whole tree.
        if !self.seen_ids.insert(node.id.clone()) {
            return Err(EngineError::Cycle(format!("step id '{}' appears more than once", node.id)));
        }

        self.steps += 1;
        self.max_depth = self.max_depth.max(depth);

        let mut manifest = RequirementManifest::default();

        match &node.kind {
            StepKind::Asset { ticker, .. } => {
                self.assets.insert(ticker.clone());
                manifest.tickers.insert(ticker.clone());
                // Every asset needs a current price to trade.
                manifest.add_metric(MetricRef {
                    func: MetricFn::CurrentPrice,
                    window: 1,
                    ticker: ticker.clone(),
                    benchmark: None,
                });
            }
            StepKind::Group => {}
            StepKind::If => self.check_if(node)?,
            StepKind::IfBranch { is_else, condition } => {
                if !parent_is_if {
                    return Err(EngineError::Structure(format!(
                        "if-child step '{}' outside an if step",
                        node.id
                    )));
                }
                match (is_else, condition) {
                    (false, Some(cond)) => {
                        self.check_metric(&cond.lhs)?;
                        manifest.add_metric(cond.lhs.clone());
                        if let Operand::Metric(m) = &cond.rhs {
                            self.check_metric(m)?;
                            manifest.add_metric(m.clone());
                        }
                    }
                    (false, None) => {
                        return Err(EngineError::Structure(format!(
                            "non-else branch '{}' carries no condition",
                            node.id
                        )))
                    }
                    (true, _) => {}
                }
            }
            StepKind::Filter { sort_fn, window, benchmark, take, .. } => {
                if node.children.is_empty() {
                    self.warnings.push(format!("filter step '{}' has no children to rank", node.id));
                }
                if let Some(n) = take {
                    if *n > node.children.len() {
                        return Err(EngineError::Structure(format!(
                            "filter step '{}' selects {n} of {} children",
                            node.id,
                            node.children.len()
                        )));
                    }
                }
                self.check_window(*sort_fn, *window, &node.id)?;
                if sort_fn.requires_benchmark() && benchmark.is_none() {
                    return Err(EngineError::Metric(format!(
                        "filter step '{}' uses {} without a benchmark",
                        node.id, sort_fn
                    )));
                }
                // The sort metric is required for every asset the filter ranks.
                for ticker in subtree_tickers(node) {
                    manifest.add_metric(MetricRef {
                        func: *sort_fn,
                        window: *window,
                        ticker,
                        benchmark: benchmark.clone(),
                    });
                }
            }
            StepKind::WeightSpecified { .. } => self.check_specified_weights(node)?,
            StepKind::WeightInverseVol { window_days } | StepKind::WeightRiskParity { window_days } => {
                let window = window_days.unwrap_or(DEFAULT_WEIGHTING_WINDOW);
                self.check_window(MetricFn::Volatility, window, &node.id)?;
                for ticker in subtree_tickers(node) {
                    manifest.add_metric(MetricRef {
                        func: MetricFn::Volatility,
                        window,
                        ticker,
                        benchmark: None,
                    });
                }
            }
            StepKind::WeightEqual { .. } | StepKind::WeightMarketCap { .. } => {}
        }

        let is_if = matches!(node.kind, StepKind::If);
        for child in &node.children {
            let child_manifest = self.walk(child, depth + 1, is_if)?;
            manifest.absorb(child_manifest);
        }

        Ok(manifest)
    }

    fn check_if(&self, node: &StepNode) -> Result<()> {
        if node.children.len() != 2 {
            return Err(EngineError::Structure(format!(
                "if step '{}' must have exactly 2 children, has {}",
                node.id,
                node.children.len()
            )));
        }
        let mut else_count = 0;
        for child in &node.children {
            match &child.kind {
                StepKind::IfBranch { is_else, .. } => {
                    if *is_else {
                        else_count += 1;
                    }
                }
                _ => {
                    return Err(EngineError::Structure(format!(
                        "if step '{}' has a non-branch child '{}'",
                        node.id, child.id
                    )))
                }
            }
        }
        if else_count != 1 {
            return Err(EngineError::Structure(format!(
                "if step '{}' must have exactly one else branch, has {else_count}",
                node.id
            )));
        }
        Ok(())
    }

    fn check_specified_weights(&self, node: &StepNode) -> Result<()> {
        let mut total = Decimal::ZERO;
        for child in &node.children {
            match &child.kind {
                StepKind::Asset { weight: Some(w), .. } => {
                    let value = w.to_decimal().ok_or_else(|| {
                        EngineError::Structure(format!(
                            "asset '{}' carries a weight with zero denominator",
                            child.id
                        ))
                    })?;
                    total += value;
                }
                StepKind::Asset { weight: None, .. } => {
                    return Err(EngineError::Structure(format!(
                        "child '{}' of specified-weight step '{}' has no weight",
                        child.id, node.id
                    )))
                }
                _ => {
                    return Err(EngineError::Structure(format!(
                        "child '{}' of specified-weight step '{}' is not a weighted asset",
                        child.id, node.id
                    )))
                }
            }
        }
        let tolerance: Decimal = WEIGHT_SUM_TOLERANCE.parse().unwrap_or_default();
        if (total - Decimal::ONE).abs() > tolerance {
            return Err(EngineError::Structure(format!(
                "specified weights of step '{}' sum to {total}, expected 1",
                node.id
            )));
        }
        Ok(())
    }

    fn check_metric(&self, m: &MetricRef) -> Result<()> {
        self.check_window(m.func, m.window, &m.ticker)?;
        if m.func.requires_benchmark() && m.benchmark.is_none() {
            return Err(EngineError::Metric(format!(
                "{} on {} requires a benchmark ticker",
                m.func, m.ticker
            )));
        }
        Ok(())
    }

    fn check_window(&self, func: MetricFn, window: u32, at: &str) -> Result<()> {
        if func.uses_window() && !(MIN_WINDOW..=MAX_WINDOW).contains(&window) {
            return Err(EngineError::Bounds(format!(
                "window {window} for {func} at '{at}' outside [{MIN_WINDOW}, {MAX_WINDOW}]"
            )));
        }
        Ok(())
    }
}

/// All asset tickers in a node's subtree, sorted and de-duplicated.
fn subtree_tickers(node: &StepNode) -> Vec<String> {
    let mut set = BTreeSet::new();
    fn walk(node: &StepNode, set: &mut BTreeSet<String>) {
        if let StepKind::Asset { ticker, .. } = &node.kind {
            set.insert(ticker.clone());
        }
        for child in &node.children {
            walk(child, set);
        }
    }
    walk(node, &mut set);
    set.into_iter().collect()
}

/// Structural summary for the operator `validate` command.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub symphony_id: String,
    pub name: String,
    pub total_steps: usize,
    pub unique_assets: usize,
    pub required_metrics: usize,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn from_validated(v: &ValidatedSymphony) -> Self {
        let mut steps = 0usize;
        let mut stack: Vec<&StepNode> = v.tree.children.iter().collect();
        while let Some(node) = stack.pop() {
            steps += 1;
            stack.extend(node.children.iter());
        }
        Self {
            symphony_id: v.tree.id.clone(),
            name: v.tree.name.clone(),
            total_steps: steps,
            unique_assets: v.tree.tickers().len(),
            required_metrics: v.manifest.metrics.len(),
            warnings: v.warnings.clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::symphony::parser::parse_str;

    fn parse(json: &str) -> StrategyTree {
        parse_str(json).expect("test tree must parse")
    }

    #[test]
    fn valid_momentum_tree_passes_and_collects_requirements() {
        let tree = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "f", "step": "filter",
                "sort-by-fn": "cumulative-return", "sort-by-fn-params": {"window": 20},
                "select-fn": "top", "select-n": 2,
                "children": [
                    {"id": "a", "step": "asset", "ticker": "AAA", "exchange": "ARCX", "name": "A"},
                    {"id": "b", "step": "asset", "ticker": "BBB", "exchange": "ARCX", "name": "B"},
                    {"id": "c", "step": "asset", "ticker": "CCC", "exchange": "ARCX", "name": "C"}
                ]
            }]
        }"#,
        );
        let validated = validate(&tree).unwrap();
        assert_eq!(validated.manifest.tickers.len(), 3);
        // Each asset requires its cumulative return plus a current price.
        assert!(validated
            .manifest
            .metrics
            .iter()
            .any(|m| m.func == MetricFn::CumulativeReturn && m.ticker == "CCC" && m.window == 20));
        assert!(validated
            .manifest
            .metrics
            .iter()
            .any(|m| m.func == MetricFn::CurrentPrice && m.ticker == "AAA"));
    }

    #[test]
    fn out_of_range_window_is_bounds_error() {
        let tree = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "f", "step": "filter",
                "sort-by-fn": "moving-average-price", "sort-by-fn-params": {"window": 300},
                "select-fn": "top", "select-n": 1,
                "children": [{"id": "a", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S"}]
            }]
        }"#,
        );
        let err = validate(&tree).unwrap_err();
        assert_eq!(err.code(), "bounds");
    }

    #[test]
    fn benchmark_metric_without_benchmark_is_metric_error() {
        let tree = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "f", "step": "filter",
                "sort-by-fn": "beta", "sort-by-fn-params": {"window": 60},
                "select-fn": "top", "select-n": 1,
                "children": [{"id": "a", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S"}]
            }]
        }"#,
        );
        let err = validate(&tree).unwrap_err();
        assert_eq!(err.code(), "metric");
    }

    #[test]
    fn filter_selecting_more_than_children_is_structure_error() {
        let tree = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "f", "step": "filter",
                "sort-by-fn": "volatility", "sort-by-fn-params": {"window": 20},
                "select-fn": "top", "select-n": 5,
                "children": [{"id": "a", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S"}]
            }]
        }"#,
        );
        assert_eq!(validate(&tree).unwrap_err().code(), "structure");
    }

    #[test]
    fn duplicate_step_ids_are_a_cycle_error() {
        let tree = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [
                {"id": "dup", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S"},
                {"id": "dup", "step": "asset", "ticker": "AGG", "exchange": "ARCX", "name": "A"}
            ]
        }"#,
        );
        assert_eq!(validate(&tree).unwrap_err().code(), "cycle");
    }

    #[test]
    fn specified_weights_must_sum_to_one() {
        let bad = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "w", "step": "wt-cash-specified",
                "children": [
                    {"id": "a", "step": "asset", "ticker": "QQQ", "exchange": "XNAS", "name": "Q",
                     "weight": {"num": 4, "den": 5}},
                    {"id": "b", "step": "asset", "ticker": "TLT", "exchange": "XNAS", "name": "T",
                     "weight": {"num": 2, "den": 5}}
                ]
            }]
        }"#,
        );
        assert_eq!(validate(&bad).unwrap_err().code(), "structure");

        let good = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "w", "step": "wt-cash-specified",
                "children": [
                    {"id": "a", "step": "asset", "ticker": "QQQ", "exchange": "XNAS", "name": "Q",
                     "weight": {"num": 4, "den": 5}},
                    {"id": "b", "step": "asset", "ticker": "TLT", "exchange": "XNAS", "name": "T",
                     "weight": {"num": 1, "den": 5}}
                ]
            }]
        }"#,
        );
        assert!(validate(&good).is_ok());
    }

    #[test]
    fn if_step_needs_exactly_one_else() {
        let tree = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "if1", "step": "if",
                "children": [
                    {"id": "b1", "step": "if-child", "is-else-condition?": true, "children": []},
                    {"id": "b2", "step": "if-child", "is-else-condition?": true, "children": []}
                ]
            }]
        }"#,
        );
        assert_eq!(validate(&tree).unwrap_err().code(), "structure");
    }

    #[test]
    fn inverse_vol_weighting_requires_volatility_metrics() {
        let tree = parse(
            r#"{
            "id": "s", "step": "root", "name": "n", "rebalance": "daily",
            "children": [{
                "id": "w", "step": "wt-inverse-vol", "window-days": 30,
                "children": [
                    {"id": "a", "step": "asset", "ticker": "SPY", "exchange": "ARCX", "name": "S"},
                    {"id": "b", "step": "asset", "ticker": "AGG", "exchange": "ARCX", "name": "A"}
                ]
            }]
        }"#,
        );
        let validated = validate(&tree).unwrap();
        assert!(validated
            .manifest
            .metrics
            .iter()
            .any(|m| m.func == MetricFn::Volatility && m.ticker == "AGG" && m.window == 30));
    }

    #[test]
    fn empty_root_is_structure_error() {
        let tree = parse(
            r#"{"id": "s", "step": "root", "name": "n", "rebalance": "daily", "children": [
                {"id": "g", "step": "group"}
            ]}"#,
        );
        // A root with only an empty group is fine structurally; truly empty
        // roots fail at parse -> validate.
        assert!(validate(&tree).is_ok());

        let empty = StrategyTree { children: vec![], ..tree };
        assert_eq!(validate(&empty).unwrap_err().code(), "structure");
    }
}
