// =============================================================================
// Symphony parser — phase two: raw wire shapes into the typed tree
// =============================================================================
//
// Parsing is total over the wire format: every unknown discriminator, missing
// required field, or malformed number is an `EngineError::Parse`. Structural
// rules (child counts, bounds, weight sums) are the validator's job, not
// ours — a tree that parses may still fail validation.
// =============================================================================

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::error::{EngineError, Result};
use crate::symphony::schema::{NumOrStr, RawFnParams, RawRebalance, RawStep, RawWeight};
use crate::symphony::tree::{
    Comparator, Condition, MetricFn, MetricRef, Operand, Selector, StepKind, StepNode,
    StrategyTree, Weight,
};
use crate::types::{Frequency, RebalancePolicy};

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse a symphony from its JSON text.
pub fn parse_str(json: &str) -> Result<StrategyTree> {
    let raw: RawStep =
        serde_json::from_str(json).map_err(|e| EngineError::Parse(format!("invalid JSON: {e}")))?;
    parse_root(raw)
}

/// Parse a symphony from an already-decoded JSON value.
pub fn parse_value(value: &serde_json::Value) -> Result<StrategyTree> {
    let raw: RawStep = serde_json::from_value(value.clone())
        .map_err(|e| EngineError::Parse(format!("invalid JSON shape: {e}")))?;
    parse_root(raw)
}

/// Serialise a typed tree back to wire JSON. Key order is not preserved;
/// reparsing yields an equal tree.
pub fn serialize(tree: &StrategyTree) -> String {
    // RawStep serialisation cannot fail: it contains only strings/numbers.
    serde_json::to_string(&to_raw(tree)).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Raw -> typed
// ---------------------------------------------------------------------------

fn parse_root(raw: RawStep) -> Result<StrategyTree> {
    if raw.step != "root" {
        return Err(EngineError::Parse(format!(
            "top-level step must be 'root', got '{}'",
            raw.step
        )));
    }

    let name = raw
        .name
        .clone()
        .ok_or_else(|| EngineError::Parse("root step missing 'name'".into()))?;

    let rebalance = match &raw.rebalance {
        Some(RawRebalance::Frequency(token)) => Frequency::from_token(token)
            .map(RebalancePolicy::Frequency)
            .ok_or_else(|| EngineError::Parse(format!("unknown rebalance token '{token}'")))?,
        Some(RawRebalance::Threshold { corridor_width }) => {
            let corridor = Decimal::from_f64(*corridor_width).ok_or_else(|| {
                EngineError::Parse(format!("corridor-width {corridor_width} is not representable"))
            })?;
            RebalancePolicy::Threshold { corridor }
        }
        None => return Err(EngineError::Parse("root step missing 'rebalance'".into())),
    };

    let children = raw
        .children
        .iter()
        .map(parse_step)
        .collect::<Result<Vec<_>>>()?;

    Ok(StrategyTree {
        id: raw.id,
        name,
        description: raw.description,
        rebalance,
        children,
    })
}

fn parse_step(raw: &RawStep) -> Result<StepNode> {
    let kind = match raw.step.as_str() {
        "asset" => parse_asset(raw)?,
        "group" => StepKind::Group,
        "if" => StepKind::If,
        "if-child" => parse_if_branch(raw)?,
        "filter" => parse_filter(raw)?,
        "wt-cash-equal" => StepKind::WeightEqual { window_days: parse_window_days(raw)? },
        "wt-cash-specified" => StepKind::WeightSpecified { window_days: parse_window_days(raw)? },
        "wt-inverse-vol" => StepKind::WeightInverseVol { window_days: parse_window_days(raw)? },
        "wt-market-cap" => StepKind::WeightMarketCap { window_days: parse_window_days(raw)? },
        "wt-risk-parity" => StepKind::WeightRiskParity { window_days: parse_window_days(raw)? },
        other => {
            return Err(EngineError::Parse(format!(
                "unknown step type '{other}' (id {})",
                raw.id
            )))
        }
    };

    let children = raw
        .children
        .iter()
        .map(parse_step)
        .collect::<Result<Vec<_>>>()?;

    Ok(StepNode {
        id: raw.id.clone(),
        name: raw.name.clone(),
        kind,
        children,
    })
}

fn parse_asset(raw: &RawStep) -> Result<StepKind> {
    let ticker = raw
        .ticker
        .clone()
        .ok_or_else(|| EngineError::Parse(format!("asset step {} missing 'ticker'", raw.id)))?;
    let exchange = raw
        .exchange
        .clone()
        .ok_or_else(|| EngineError::Parse(format!("asset step {} missing 'exchange'", raw.id)))?;
    let label = raw.name.clone().unwrap_or_else(|| ticker.clone());

    let weight = match &raw.weight {
        Some(RawWeight { num, den }) => {
            let num = num.as_i64().ok_or_else(|| {
                EngineError::Parse(format!("asset step {} has non-integer weight numerator", raw.id))
            })?;
            Some(Weight { num, den: *den })
        }
        None => None,
    };

    Ok(StepKind::Asset { ticker, exchange, label, weight })
}

fn parse_if_branch(raw: &RawStep) -> Result<StepKind> {
    let is_else = raw.is_else_condition.ok_or_else(|| {
        EngineError::Parse(format!("if-child step {} missing 'is-else-condition?'", raw.id))
    })?;

    if is_else {
        return Ok(StepKind::IfBranch { is_else: true, condition: None });
    }

    let lhs_fn = require_metric_token(raw.lhs_fn.as_deref(), &raw.id, "lhs-fn")?;
    let lhs_ticker = raw
        .lhs_val
        .clone()
        .ok_or_else(|| EngineError::Parse(format!("if-child step {} missing 'lhs-val'", raw.id)))?;
    let lhs = metric_ref(lhs_fn, raw.lhs_fn_params.as_ref(), lhs_ticker, &raw.id)?;

    let cmp_token = raw
        .comparator
        .as_deref()
        .ok_or_else(|| EngineError::Parse(format!("if-child step {} missing 'comparator'", raw.id)))?;
    let cmp = Comparator::from_token(cmp_token)
        .ok_or_else(|| EngineError::Parse(format!("unknown comparator '{cmp_token}'")))?;

    let fixed = raw.rhs_fixed_value.unwrap_or(raw.rhs_fn.is_none());
    let rhs = if fixed {
        let text = raw.rhs_val.as_deref().ok_or_else(|| {
            EngineError::Parse(format!("if-child step {} missing fixed 'rhs-val'", raw.id))
        })?;
        let value: f64 = text.trim().parse().map_err(|_| {
            EngineError::Parse(format!("if-child step {}: rhs-val '{text}' is not numeric", raw.id))
        })?;
        Operand::Literal(value)
    } else {
        let rhs_fn = require_metric_token(raw.rhs_fn.as_deref(), &raw.id, "rhs-fn")?;
        let rhs_ticker = raw.rhs_val.clone().ok_or_else(|| {
            EngineError::Parse(format!("if-child step {} missing 'rhs-val'", raw.id))
        })?;
        Operand::Metric(metric_ref(rhs_fn, raw.rhs_fn_params.as_ref(), rhs_ticker, &raw.id)?)
    };

    Ok(StepKind::IfBranch {
        is_else: false,
        condition: Some(Condition { lhs, cmp, rhs }),
    })
}

fn parse_filter(raw: &RawStep) -> Result<StepKind> {
    let sort_token = raw
        .sort_by_fn
        .as_deref()
        .ok_or_else(|| EngineError::Parse(format!("filter step {} missing 'sort-by-fn'", raw.id)))?;
    let sort_fn = MetricFn::from_token(sort_token)
        .ok_or_else(|| EngineError::Parse(format!("unknown metric '{sort_token}'")))?;

    let (window, benchmark) = params_window_benchmark(sort_fn, raw.sort_by_fn_params.as_ref(), &raw.id)?;

    let select_token = raw
        .select_fn
        .as_deref()
        .ok_or_else(|| EngineError::Parse(format!("filter step {} missing 'select-fn'", raw.id)))?;
    let selector = Selector::from_token(select_token)
        .ok_or_else(|| EngineError::Parse(format!("unknown selector '{select_token}'")))?;

    let take = match &raw.select_n {
        None => None,
        Some(n) => {
            if n.as_str() == Some("all") {
                None
            } else {
                let v = n.as_i64().ok_or_else(|| {
                    EngineError::Parse(format!("filter step {}: select-n must be an integer or 'all'", raw.id))
                })?;
                if v < 0 {
                    return Err(EngineError::Parse(format!(
                        "filter step {}: select-n must be non-negative",
                        raw.id
                    )));
                }
                Some(v as usize)
            }
        }
    };

    Ok(StepKind::Filter { sort_fn, window, benchmark, selector, take })
}

fn parse_window_days(raw: &RawStep) -> Result<Option<u32>> {
    match &raw.window_days {
        None => Ok(None),
        Some(n) => {
            let v = n.as_i64().ok_or_else(|| {
                EngineError::Parse(format!("step {}: window-days must be an integer", raw.id))
            })?;
            if v < 0 {
                return Err(EngineError::Parse(format!(
                    "step {}: window-days must be non-negative",
                    raw.id
                )));
            }
            Ok(Some(v as u32))
        }
    }
}

fn require_metric_token(token: Option<&str>, id: &str, field: &str) -> Result<MetricFn> {
    let token =
        token.ok_or_else(|| EngineError::Parse(format!("if-child step {id} missing '{field}'")))?;
    MetricFn::from_token(token)
        .ok_or_else(|| EngineError::Parse(format!("unknown metric '{token}'")))
}

fn metric_ref(
    func: MetricFn,
    params: Option<&RawFnParams>,
    ticker: String,
    id: &str,
) -> Result<MetricRef> {
    let (window, benchmark) = params_window_benchmark(func, params, id)?;
    Ok(MetricRef { func, window, ticker, benchmark })
}

fn params_window_benchmark(
    func: MetricFn,
    params: Option<&RawFnParams>,
    id: &str,
) -> Result<(u32, Option<String>)> {
    let window = match params.and_then(|p| p.window.as_ref()) {
        None => func.default_window(),
        Some(n) => {
            let v = n
                .as_i64()
                .ok_or_else(|| EngineError::Parse(format!("step {id}: window must be an integer")))?;
            if v < 0 {
                return Err(EngineError::Parse(format!("step {id}: window must be non-negative")));
            }
            v as u32
        }
    };
    let benchmark = params.and_then(|p| p.benchmark.clone());
    Ok((window, benchmark))
}

// ---------------------------------------------------------------------------
// Typed -> raw
// ---------------------------------------------------------------------------

/// Reconstruct the wire shape of a typed tree.
pub fn to_raw(tree: &StrategyTree) -> RawStep {
    let mut root = RawStep::bare(tree.id.clone(), "root");
    root.name = Some(tree.name.clone());
    root.description = tree.description.clone();
    root.rebalance = Some(match &tree.rebalance {
        RebalancePolicy::Frequency(f) => RawRebalance::Frequency(f.token().to_string()),
        RebalancePolicy::Threshold { corridor } => RawRebalance::Threshold {
            corridor_width: corridor.to_string().parse().unwrap_or(0.0),
        },
    });
    root.children = tree.children.iter().map(step_to_raw).collect();
    root
}

fn step_to_raw(node: &StepNode) -> RawStep {
    let mut raw = RawStep::bare(node.id.clone(), node.kind.token());
    raw.name = node.name.clone();

    match &node.kind {
        StepKind::Asset { ticker, exchange, label, weight } => {
            raw.ticker = Some(ticker.clone());
            raw.exchange = Some(exchange.clone());
            raw.name = Some(label.clone());
            raw.weight = weight.map(|w| RawWeight { num: NumOrStr::Int(w.num), den: w.den });
        }
        StepKind::Group | StepKind::If => {}
        StepKind::IfBranch { is_else, condition } => {
            raw.is_else_condition = Some(*is_else);
            if let Some(cond) = condition {
                raw.lhs_fn = Some(cond.lhs.func.token().to_string());
                raw.lhs_fn_params = Some(RawFnParams {
                    window: Some(NumOrStr::Int(cond.lhs.window as i64)),
                    benchmark: cond.lhs.benchmark.clone(),
                });
                raw.lhs_val = Some(cond.lhs.ticker.clone());
                raw.comparator = Some(cond.cmp.token().to_string());
                match &cond.rhs {
                    Operand::Literal(v) => {
                        raw.rhs_val = Some(format_literal(*v));
                        raw.rhs_fixed_value = Some(true);
                    }
                    Operand::Metric(m) => {
                        raw.rhs_fn = Some(m.func.token().to_string());
                        raw.rhs_fn_params = Some(RawFnParams {
                            window: Some(NumOrStr::Int(m.window as i64)),
                            benchmark: m.benchmark.clone(),
                        });
                        raw.rhs_val = Some(m.ticker.clone());
                        raw.rhs_fixed_value = Some(false);
                    }
                }
            }
        }
        StepKind::Filter { sort_fn, window, benchmark, selector, take } => {
            raw.sort_by_fn = Some(sort_fn.token().to_string());
            raw.sort_by_fn_params = Some(RawFnParams {
                window: Some(NumOrStr::Int(*window as i64)),
                benchmark: benchmark.clone(),
            });
            raw.select_fn = Some(selector.token().to_string());
            raw.select_n = Some(match take {
                Some(n) => NumOrStr::Int(*n as i64),
                None => NumOrStr::Str("all".into()),
            });
        }
        StepKind::WeightEqual { window_days }
        | StepKind::WeightSpecified { window_days }
        | StepKind::WeightInverseVol { window_days }
        | StepKind::WeightMarketCap { window_days }
        | StepKind::WeightRiskParity { window_days } => {
            raw.window_days = window_days.map(|w| NumOrStr::Int(w as i64));
        }
    }

    raw.children = node.children.iter().map(step_to_raw).collect();
    raw
}

/// Render a literal without trailing `.0` noise so integers survive a
/// round trip textually unchanged.
fn format_literal(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}
