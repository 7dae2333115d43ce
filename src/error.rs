// =============================================================================
// Engine error taxonomy — closed set of failure kinds with stable codes
// =============================================================================
//
// Every internal failure is one of these variants. The `code()` string is
// stable and machine-readable; operators and the failure-policy table key off
// it, so renaming a code is a breaking change.
// =============================================================================

use rust_decimal::Decimal;
use thiserror::Error;

/// All failure kinds the engine can signal.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    // --- Tree validation ----------------------------------------------------
    /// Symphony JSON could not be decoded into the wire shape.
    #[error("symphony JSON could not be parsed: {0}")]
    Parse(String),

    /// The decoded tree violates a structural rule (child counts, branch
    /// marking, weight sums).
    #[error("invalid symphony structure: {0}")]
    Structure(String),

    /// The tree exceeds a complexity bound (steps, depth, assets) or a
    /// parameter is outside its allowed range.
    #[error("symphony exceeds allowed bounds: {0}")]
    Bounds(String),

    /// A metric invocation carries unknown parameters or is missing a
    /// required benchmark.
    #[error("invalid metric invocation: {0}")]
    Metric(String),

    /// A reference loop was detected while annotating the tree.
    #[error("circular reference detected: {0}")]
    Cycle(String),

    // --- Data / evaluation --------------------------------------------------
    /// No provider could supply data for a required symbol.
    #[error("market data unavailable for {symbol}: {cause}")]
    DataUnavailable { symbol: String, cause: String },

    /// The tree evaluated but produced an inconsistent or unrepresentable
    /// result.
    #[error("evaluation failed: {0}")]
    Eval(String),

    // --- Planning / execution -----------------------------------------------
    /// Positive order deltas exceed available buying power even after
    /// scaling.
    #[error("planned buys exceed buying power: need {needed}, have {available}")]
    PlanOverBudget { needed: Decimal, available: Decimal },

    /// The broker rejected a specific order.
    #[error("broker rejected order: {0}")]
    BrokerRejected(String),

    /// The broker could not be reached (network / 5xx).
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// The broker refused our credentials.
    #[error("broker authentication failed: {0}")]
    BrokerAuth(String),

    /// The execution-window deadline elapsed before completion.
    #[error("window deadline reached: {0}")]
    Timeout(String),

    // --- Post-window --------------------------------------------------------
    /// Broker positions and local records disagree after the window.
    #[error("positions diverged from broker: {0}")]
    ReconcileDivergence(String),
}

impl EngineError {
    /// Stable machine-readable code for operators and the failure policy
    /// table.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Structure(_) => "structure",
            Self::Bounds(_) => "bounds",
            Self::Metric(_) => "metric",
            Self::Cycle(_) => "cycle",
            Self::DataUnavailable { .. } => "data_unavailable",
            Self::Eval(_) => "eval_error",
            Self::PlanOverBudget { .. } => "plan_over_budget",
            Self::BrokerRejected(_) => "broker_rejected",
            Self::BrokerUnreachable(_) => "broker_unreachable",
            Self::BrokerAuth(_) => "broker_auth",
            Self::Timeout(_) => "timeout",
            Self::ReconcileDivergence(_) => "reconcile_divergence",
        }
    }

    /// Whether the error arose from symphony validation (as opposed to
    /// runtime data / broker trouble).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::Structure(_) | Self::Bounds(_) | Self::Metric(_) | Self::Cycle(_)
        )
    }
}

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
