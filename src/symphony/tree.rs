// =============================================================================
// Typed strategy tree — the validated in-memory form of a symphony
// =============================================================================
//
// Nodes are a tagged sum type; the evaluator dispatches on the tag and never
// touches string-keyed JSON. Children are owned by their parent: trees are
// immutable per version, so no shared ownership is needed.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::RebalancePolicy;

// ---------------------------------------------------------------------------
// Metric functions
// ---------------------------------------------------------------------------

/// Closed set of metric functions usable in conditions, filters, and
/// weighting steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricFn {
    CurrentPrice,
    CumulativeReturn,
    EmaPrice,
    SmaPrice,
    MaxDrawdown,
    MovingAverageReturn,
    Rsi,
    StdevPrice,
    StdevReturn,
    Sharpe,
    Volatility,
    Beta,
    Alpha,
    Correlation,
}

impl MetricFn {
    /// Parse the wire token (kebab-case) used by the symphony JSON format.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "current-price" => Some(Self::CurrentPrice),
            "cumulative-return" => Some(Self::CumulativeReturn),
            "exponential-moving-average-price" => Some(Self::EmaPrice),
            "moving-average-price" => Some(Self::SmaPrice),
            "max-drawdown" => Some(Self::MaxDrawdown),
            "moving-average-return" => Some(Self::MovingAverageReturn),
            "relative-strength-index" => Some(Self::Rsi),
            "standard-deviation-price" => Some(Self::StdevPrice),
            "standard-deviation-return" => Some(Self::StdevReturn),
            "sharpe-ratio" => Some(Self::Sharpe),
            "volatility" => Some(Self::Volatility),
            "beta" => Some(Self::Beta),
            "alpha" => Some(Self::Alpha),
            "correlation" => Some(Self::Correlation),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::CurrentPrice => "current-price",
            Self::CumulativeReturn => "cumulative-return",
            Self::EmaPrice => "exponential-moving-average-price",
            Self::SmaPrice => "moving-average-price",
            Self::MaxDrawdown => "max-drawdown",
            Self::MovingAverageReturn => "moving-average-return",
            Self::Rsi => "relative-strength-index",
            Self::StdevPrice => "standard-deviation-price",
            Self::StdevReturn => "standard-deviation-return",
            Self::Sharpe => "sharpe-ratio",
            Self::Volatility => "volatility",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
            Self::Correlation => "correlation",
        }
    }

    /// Metrics computed against a second symbol's series.
    pub fn requires_benchmark(&self) -> bool {
        matches!(self, Self::Beta | Self::Alpha | Self::Correlation)
    }

    /// Look-back assumed when the wire format omits `window`.
    pub fn default_window(&self) -> u32 {
        match self {
            Self::CurrentPrice => 1,
            Self::Rsi => 14,
            _ => 20,
        }
    }

    /// `current-price` takes no meaningful window; range validation skips it.
    pub fn uses_window(&self) -> bool {
        !matches!(self, Self::CurrentPrice)
    }
}

impl std::fmt::Display for MetricFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

// ---------------------------------------------------------------------------
// Comparators
// ---------------------------------------------------------------------------

/// Comparison operators for conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
}

impl Comparator {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "gt" => Some(Self::Gt),
            "lt" => Some(Self::Lt),
            "gte" => Some(Self::Gte),
            "lte" => Some(Self::Lte),
            "eq" => Some(Self::Eq),
            "neq" => Some(Self::Neq),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::Eq => "eq",
            Self::Neq => "neq",
        }
    }

    /// Apply the comparison to two metric values.
    pub fn compare(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Gte => lhs >= rhs,
            Self::Lte => lhs <= rhs,
            Self::Eq => lhs == rhs,
            Self::Neq => lhs != rhs,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

// ---------------------------------------------------------------------------
// Weights and conditions
// ---------------------------------------------------------------------------

/// Exact rational weight as carried on asset nodes (`{num, den}` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weight {
    pub num: i64,
    pub den: i64,
}

impl Weight {
    /// Convert to a decimal fraction. `None` for a zero denominator.
    pub fn to_decimal(&self) -> Option<Decimal> {
        if self.den == 0 {
            return None;
        }
        Some(Decimal::from(self.num) / Decimal::from(self.den))
    }
}

/// One side's metric invocation: function, window, subject ticker, and the
/// benchmark ticker for relative metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricRef {
    pub func: MetricFn,
    pub window: u32,
    pub ticker: String,
    #[serde(default)]
    pub benchmark: Option<String>,
}

impl std::fmt::Display for MetricRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.benchmark {
            Some(b) => write!(f, "{}({},{},vs {})", self.func, self.ticker, self.window, b),
            None => write!(f, "{}({},{})", self.func, self.ticker, self.window),
        }
    }
}

/// Right-hand side of a condition: a fixed number or another metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Literal(f64),
    Metric(MetricRef),
}

/// Condition carried by a non-else branch of an `If`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub lhs: MetricRef,
    pub cmp: Comparator,
    pub rhs: Operand,
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.rhs {
            Operand::Literal(v) => write!(f, "{} {} {}", self.lhs, self.cmp, v),
            Operand::Metric(m) => write!(f, "{} {} {}", self.lhs, self.cmp, m),
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Subset-selection mode of a filter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    Top,
    Bottom,
    All,
    Random,
}

impl Selector {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "top" => Some(Self::Top),
            "bottom" => Some(Self::Bottom),
            "all" => Some(Self::All),
            "random" => Some(Self::Random),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
            Self::All => "all",
            Self::Random => "random",
        }
    }
}

/// The tagged step variants. Every variant may own children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
    /// Leaf naming one tradable symbol.
    Asset {
        ticker: String,
        exchange: String,
        label: String,
        weight: Option<Weight>,
    },
    /// Transparent container; children concatenate.
    Group,
    /// Two-branch conditional; the condition lives on the non-else branch.
    If,
    /// One branch of an `If`.
    IfBranch {
        is_else: bool,
        condition: Option<Condition>,
    },
    /// Rank children by a metric and keep a subset.
    Filter {
        sort_fn: MetricFn,
        window: u32,
        benchmark: Option<String>,
        selector: Selector,
        /// `None` means keep all (`select-n: "all"` on the wire).
        take: Option<usize>,
    },
    WeightEqual { window_days: Option<u32> },
    WeightSpecified { window_days: Option<u32> },
    WeightInverseVol { window_days: Option<u32> },
    WeightMarketCap { window_days: Option<u32> },
    WeightRiskParity { window_days: Option<u32> },
}

impl StepKind {
    /// The wire discriminator token for this variant.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Asset { .. } => "asset",
            Self::Group => "group",
            Self::If => "if",
            Self::IfBranch { .. } => "if-child",
            Self::Filter { .. } => "filter",
            Self::WeightEqual { .. } => "wt-cash-equal",
            Self::WeightSpecified { .. } => "wt-cash-specified",
            Self::WeightInverseVol { .. } => "wt-inverse-vol",
            Self::WeightMarketCap { .. } => "wt-market-cap",
            Self::WeightRiskParity { .. } => "wt-risk-parity",
        }
    }

    pub fn is_weighting(&self) -> bool {
        matches!(
            self,
            Self::WeightEqual { .. }
                | Self::WeightSpecified { .. }
                | Self::WeightInverseVol { .. }
                | Self::WeightMarketCap { .. }
                | Self::WeightRiskParity { .. }
        )
    }
}

/// One node of the strategy tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: StepKind,
    #[serde(default)]
    pub children: Vec<StepNode>,
}

/// A parsed symphony: root metadata plus the step forest under the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyTree {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rebalance: RebalancePolicy,
    pub children: Vec<StepNode>,
}

impl StrategyTree {
    /// All unique asset tickers in the tree, sorted.
    pub fn tickers(&self) -> Vec<String> {
        let mut set = std::collections::BTreeSet::new();
        fn walk(node: &StepNode, set: &mut std::collections::BTreeSet<String>) {
            if let StepKind::Asset { ticker, .. } = &node.kind {
                set.insert(ticker.clone());
            }
            for child in &node.children {
                walk(child, set);
            }
        }
        for child in &self.children {
            walk(child, &mut set);
        }
        set.into_iter().collect()
    }
}
