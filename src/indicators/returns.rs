// =============================================================================
// Cumulative return over a trailing window
// =============================================================================

/// Cumulative return over the trailing `window + 1` closes:
/// `(newest - oldest) / oldest`, as a fraction (0.20 = +20%).
///
/// Returns `None` when `window == 0`, fewer than `window + 1` closes exist,
/// or the oldest close is zero.
pub fn cumulative_return(prices: &[f64], window: usize) -> Option<f64> {
    if window == 0 || prices.len() < window + 1 {
        return None;
    }

    let newest = prices[0];
    let oldest = prices[window];
    if oldest == 0.0 {
        return None;
    }

    let value = (newest - oldest) / oldest;
    value.is_finite().then_some(value)
}
