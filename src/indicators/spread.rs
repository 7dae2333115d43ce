// =============================================================================
// Dispersion — population standard deviation and annualised volatility
// =============================================================================

use super::TRADING_DAYS_PER_YEAR;

/// Population standard deviation over the newest `window` values.
///
/// Returns `None` when `window == 0` or fewer than `window` values exist.
pub fn stdev(values: &[f64], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }

    let subset = &values[..window];
    let mean = subset.iter().sum::<f64>() / window as f64;
    let variance = subset.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window as f64;
    let sd = variance.sqrt();
    sd.is_finite().then_some(sd)
}

/// Annualised volatility: population stdev of daily returns scaled by √252.
pub fn volatility(returns: &[f64], window: usize) -> Option<f64> {
    stdev(returns, window).map(|sd| sd * TRADING_DAYS_PER_YEAR.sqrt())
}
