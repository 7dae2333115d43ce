// =============================================================================
// Maximum drawdown over a trailing window
// =============================================================================
//
// The window is scanned in chronological order tracking the running peak;
// the result is the largest (peak - value) / peak encountered, reported as a
// positive fraction (0.20 = a 20% drawdown).
// =============================================================================

/// Maximum drawdown over the newest `window` closes (newest first).
///
/// Returns `None` when `window == 0` or fewer than `window` closes exist, or
/// when the window never establishes a positive peak.
pub fn max_drawdown(prices: &[f64], window: usize) -> Option<f64> {
    if window == 0 || prices.len() < window {
        return None;
    }

    // Walk the window oldest-to-newest.
    let mut iter = prices[..window].iter().rev();
    let mut peak = *iter.next()?;
    let mut max_dd: f64 = 0.0;

    for &price in iter {
        if price > peak {
            peak = price;
        } else if peak > 0.0 {
            let dd = (peak - price) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd.is_finite().then_some(max_dd)
}
