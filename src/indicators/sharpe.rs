// =============================================================================
// Sharpe ratio — annualised excess return over annualised dispersion
// =============================================================================
//
//   daily_rf = risk_free_rate / 252
//   sharpe   = (mean_daily_return - daily_rf) * 252 / (stdev * sqrt(252))
// =============================================================================

use super::spread::stdev;
use super::TRADING_DAYS_PER_YEAR;

/// Annual risk-free rate assumed when the caller supplies none.
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;

/// Sharpe ratio over the newest `window` daily returns (newest first).
///
/// Returns `None` on insufficient data or when the return dispersion is zero
/// (the ratio would be undefined).
pub fn sharpe(returns: &[f64], window: usize, risk_free_rate: f64) -> Option<f64> {
    if window == 0 || returns.len() < window {
        return None;
    }

    let subset = &returns[..window];
    let mean = subset.iter().sum::<f64>() / window as f64;
    let sd = stdev(subset, window)?;
    if sd == 0.0 {
        return None;
    }

    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let value = (mean - daily_rf) * TRADING_DAYS_PER_YEAR / (sd * TRADING_DAYS_PER_YEAR.sqrt());
    value.is_finite().then_some(value)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_excess_returns_positive_sharpe() {
        let returns = [0.01, 0.012, 0.009, 0.011, 0.01, 0.013, 0.008, 0.01];
        let s = sharpe(&returns, 8, DEFAULT_RISK_FREE_RATE).unwrap();
        assert!(s > 0.0);
    }

    #[test]
    fn losing_series_has_negative_sharpe() {
        let returns = [-0.01, -0.012, -0.009, -0.011, -0.01, -0.013, -0.008, -0.01];
        let s = sharpe(&returns, 8, DEFAULT_RISK_FREE_RATE).unwrap();
        assert!(s < 0.0);
    }

    #[test]
    fn zero_dispersion_is_none() {
        assert_eq!(sharpe(&[0.01; 10], 10, DEFAULT_RISK_FREE_RATE), None);
    }

    #[test]
    fn insufficient_data_is_none() {
        assert_eq!(sharpe(&[0.01, 0.02], 3, DEFAULT_RISK_FREE_RATE), None);
    }

    #[test]
    fn scales_with_excess_over_risk_free() {
        let returns = [0.001, -0.001, 0.002, -0.002, 0.001, -0.001, 0.002, -0.002];
        let low_rf = sharpe(&returns, 8, 0.0).unwrap();
        let high_rf = sharpe(&returns, 8, 0.10).unwrap();
        assert!(low_rf > high_rf);
    }
}
