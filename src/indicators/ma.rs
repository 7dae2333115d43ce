// =============================================================================
// Moving Averages — SMA, EMA, and moving-average-of-returns
// =============================================================================
//
// EMA formula:
//   multiplier = 2 / (window + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The seed is the SMA of the OLDEST `window` closes of the series; the
// recursion then walks toward the newest close. A series of exactly `window`
// closes therefore yields the plain SMA. Equal inputs give equal outputs.
// =============================================================================

use super::returns_from_prices;

/// Simple moving average of the newest `window` closes.
///
/// Returns `None` when `window == 0` or fewer than `window` closes exist.
pub fn sma(prices: &[f64], window: usize) -> Option<f64> {
    if window == 0 || prices.len() < window {
        return None;
    }
    let mean = prices[..window].iter().sum::<f64>() / window as f64;
    mean.is_finite().then_some(mean)
}

/// Exponential moving average over the whole series with look-back `window`.
///
/// Returns `None` when `window == 0` or fewer than `window` closes exist.
pub fn ema(prices: &[f64], window: usize) -> Option<f64> {
    if window == 0 || prices.len() < window {
        return None;
    }

    let multiplier = 2.0 / (window as f64 + 1.0);

    // Seed: SMA of the oldest `window` closes (the tail of a newest-first
    // series).
    let oldest = &prices[prices.len() - window..];
    let mut value = oldest.iter().sum::<f64>() / window as f64;
    if !value.is_finite() {
        return None;
    }

    // Recurse toward the newest close.
    for &close in prices[..prices.len() - window].iter().rev() {
        value = close * multiplier + value * (1.0 - multiplier);
        if !value.is_finite() {
            return None;
        }
    }

    Some(value)
}

/// SMA of simple daily returns over `window` return observations.
///
/// Needs `window + 1` closes to form `window` returns.
pub fn moving_average_return(prices: &[f64], window: usize) -> Option<f64> {
    let rets = returns_from_prices(prices);
    sma(&rets, window)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // ---- sma -------------------------------------------------------------

    #[test]
    fn sma_basic() {
        let prices = [3.0, 2.0, 1.0, 100.0];
        assert!((sma(&prices, 3).unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn sma_insufficient_data_is_none_not_zero() {
        assert_eq!(sma(&[1.0, 2.0], 3), None);
        assert_eq!(sma(&[], 1), None);
    }

    #[test]
    fn sma_zero_window() {
        assert_eq!(sma(&[1.0, 2.0, 3.0], 0), None);
    }

    // ---- ema -------------------------------------------------------------

    #[test]
    fn ema_of_exact_window_equals_sma() {
        let prices = [4.0, 3.0, 2.0, 1.0];
        let e = ema(&prices, 4).unwrap();
        let s = sma(&prices, 4).unwrap();
        assert!((e - s).abs() < 1e-12);
    }

    #[test]
    fn ema_constant_series_is_the_constant() {
        let prices = [50.0; 30];
        assert!((ema(&prices, 10).unwrap() - 50.0).abs() < 1e-12);
    }

    #[test]
    fn ema_weighs_recent_prices_more_than_sma() {
        // Rising series: EMA should sit above the all-series SMA.
        let prices: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let e = ema(&prices, 10).unwrap();
        let full_mean = prices.iter().sum::<f64>() / prices.len() as f64;
        assert!(e > full_mean);
    }

    #[test]
    fn ema_deterministic() {
        let prices: Vec<f64> = (1..=60).map(|x| (x as f64).sin() + 10.0).collect();
        assert_eq!(ema(&prices, 14), ema(&prices, 14));
    }

    #[test]
    fn ema_insufficient_data() {
        assert_eq!(ema(&[1.0, 2.0], 3), None);
    }

    // ---- moving_average_return --------------------------------------------

    #[test]
    fn mar_needs_window_plus_one_closes() {
        // 3 closes -> 2 returns; a window of 3 cannot be satisfied.
        assert_eq!(moving_average_return(&[3.0, 2.0, 1.0], 3), None);
        assert!(moving_average_return(&[3.0, 2.0, 1.0], 2).is_some());
    }

    #[test]
    fn mar_constant_growth() {
        // 10% growth per day, newest first.
        let prices = [1.331, 1.21, 1.1, 1.0];
        let v = moving_average_return(&prices, 3).unwrap();
        assert!((v - 0.1).abs() < 1e-9);
    }
}
