// =============================================================================
// Indicator Kernel
// =============================================================================
//
// Pure, side-effect-free numeric functions over price and return series.
// Every series is ordered NEWEST FIRST (index 0 is the latest close), matching
// how the market-data facade hands data to the evaluator.
//
// Every public function returns `Option<f64>`: `None` is the explicit
// no-value signal for insufficient data or a degenerate input. Callers must
// treat `None` as condition-false / skip-asset — never as zero. Nothing in
// this module panics.

pub mod bollinger;
pub mod drawdown;
pub mod ma;
pub mod macd;
pub mod relation;
pub mod returns;
pub mod rsi;
pub mod sharpe;
pub mod spread;

/// Trading days per year, used wherever a daily statistic is annualised.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Derive simple returns from a newest-first close series.
///
/// `r_i = (p_i - p_{i+1}) / p_{i+1}`, newest first. Pairs whose older close
/// is zero are skipped rather than producing an infinity.
pub fn returns_from_prices(prices: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(prices.len().saturating_sub(1));
    for pair in prices.windows(2) {
        let (newer, older) = (pair[0], pair[1]);
        if older != 0.0 {
            out.push((newer - older) / older);
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_newest_first() {
        // 110 today, 100 yesterday, 80 before => [+10%, +25%]
        let r = returns_from_prices(&[110.0, 100.0, 80.0]);
        assert_eq!(r.len(), 2);
        assert!((r[0] - 0.10).abs() < 1e-12);
        assert!((r[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn returns_skip_zero_denominator() {
        let r = returns_from_prices(&[10.0, 0.0, 5.0]);
        // The 10/0 pair is dropped; 0 vs 5 yields -1.0.
        assert_eq!(r.len(), 1);
        assert!((r[0] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn returns_empty_and_single() {
        assert!(returns_from_prices(&[]).is_empty());
        assert!(returns_from_prices(&[42.0]).is_empty());
    }
}
