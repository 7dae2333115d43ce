// =============================================================================
// Raw wire shapes of the symphony JSON format
// =============================================================================
//
// Phase one of the two-phase parser: these structs mirror the external JSON
// byte-for-byte (kebab-case keys, `?`-suffixed flags, numbers-as-strings) so
// that nothing downstream ever touches string-keyed JSON. Phase two
// (`parser.rs`) converts them into the typed tree.
// =============================================================================

use serde::{Deserialize, Serialize};

/// A JSON field that arrives as either an integer or an integer-in-a-string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumOrStr {
    Int(i64),
    Str(String),
}

impl NumOrStr {
    /// Numeric value, if the string form actually holds an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(s) => s.trim().parse().ok(),
        }
    }

    /// The literal string form (used for `select-n: "all"`).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Int(_) => None,
        }
    }
}

/// Rational weight attached to asset nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWeight {
    pub num: NumOrStr,
    pub den: i64,
}

/// Parameter bag of a metric invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFnParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<NumOrStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<String>,
}

/// Root `rebalance` field: a frequency token or a threshold object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawRebalance {
    Frequency(String),
    Threshold {
        #[serde(rename = "corridor-width")]
        corridor_width: f64,
    },
}

/// One step object as it appears on the wire. The `step` discriminator
/// decides which of the optional fields are meaningful; phase two enforces
/// that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStep {
    pub id: String,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // --- root ---------------------------------------------------------------
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebalance: Option<RawRebalance>,

    // --- asset --------------------------------------------------------------
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<RawWeight>,

    // --- filter -------------------------------------------------------------
    #[serde(rename = "sort-by-fn", default, skip_serializing_if = "Option::is_none")]
    pub sort_by_fn: Option<String>,
    #[serde(rename = "sort-by-fn-params", default, skip_serializing_if = "Option::is_none")]
    pub sort_by_fn_params: Option<RawFnParams>,
    #[serde(rename = "select-fn", default, skip_serializing_if = "Option::is_none")]
    pub select_fn: Option<String>,
    #[serde(rename = "select-n", default, skip_serializing_if = "Option::is_none")]
    pub select_n: Option<NumOrStr>,

    // --- if-child -----------------------------------------------------------
    #[serde(rename = "is-else-condition?", default, skip_serializing_if = "Option::is_none")]
    pub is_else_condition: Option<bool>,
    #[serde(rename = "lhs-fn", default, skip_serializing_if = "Option::is_none")]
    pub lhs_fn: Option<String>,
    #[serde(rename = "lhs-fn-params", default, skip_serializing_if = "Option::is_none")]
    pub lhs_fn_params: Option<RawFnParams>,
    #[serde(rename = "lhs-val", default, skip_serializing_if = "Option::is_none")]
    pub lhs_val: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,
    #[serde(rename = "rhs-fn", default, skip_serializing_if = "Option::is_none")]
    pub rhs_fn: Option<String>,
    #[serde(rename = "rhs-fn-params", default, skip_serializing_if = "Option::is_none")]
    pub rhs_fn_params: Option<RawFnParams>,
    #[serde(rename = "rhs-val", default, skip_serializing_if = "Option::is_none")]
    pub rhs_val: Option<String>,
    #[serde(rename = "rhs-fixed-value?", default, skip_serializing_if = "Option::is_none")]
    pub rhs_fixed_value: Option<bool>,

    // --- weighting ----------------------------------------------------------
    #[serde(rename = "window-days", default, skip_serializing_if = "Option::is_none")]
    pub window_days: Option<NumOrStr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RawStep>,
}

impl RawStep {
    /// Fresh raw step with only the universal fields set.
    pub fn bare(id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step: step.into(),
            name: None,
            description: None,
            rebalance: None,
            ticker: None,
            exchange: None,
            weight: None,
            sort_by_fn: None,
            sort_by_fn_params: None,
            select_fn: None,
            select_n: None,
            is_else_condition: None,
            lhs_fn: None,
            lhs_fn_params: None,
            lhs_val: None,
            comparator: None,
            rhs_fn: None,
            rhs_fn_params: None,
            rhs_val: None,
            rhs_fixed_value: None,
            window_days: None,
            children: Vec::new(),
        }
    }
}
