// =============================================================================
// Relative Strength Index (RSI)
// =============================================================================
//
// Gains and losses over adjacent close pairs across the newest `window + 1`
// points, simple (unsmoothed) averages:
//
//   RS  = avg_gain / avg_loss
//   RSI = 100 - 100 / (1 + RS)
//
// When the average loss is zero (no down moves) RSI is 100 by definition.
// =============================================================================

/// Conventional default look-back.
pub const DEFAULT_RSI_WINDOW: usize = 14;

/// RSI over the newest `window + 1` closes (newest first).
///
/// Returns `None` when `window == 0` or fewer than `window + 1` closes exist.
pub fn rsi(prices: &[f64], window: usize) -> Option<f64> {
    if window == 0 || prices.len() < window + 1 {
        return None;
    }

    let mut sum_gain = 0.0;
    let mut sum_loss = 0.0;
    for i in 0..window {
        let change = prices[i] - prices[i + 1];
        if change > 0.0 {
            sum_gain += change;
        } else {
            sum_loss += change.abs();
        }
    }

    let avg_gain = sum_gain / window as f64;
    let avg_loss = sum_loss / window as f64;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    let value = 100.0 - 100.0 / (1.0 + rs);
    value.is_finite().then_some(value)
}
