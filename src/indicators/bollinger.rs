// =============================================================================
// Bollinger Bands — SMA midline with k-sigma envelopes
// =============================================================================

use super::ma::sma;
use super::spread::stdev;

/// Conventional band parameters.
pub const DEFAULT_BOLLINGER_WINDOW: usize = 20;
pub const DEFAULT_BOLLINGER_K: f64 = 2.0;

/// `(upper, middle, lower)` bands over the newest `window` closes.
///
/// Returns `None` on insufficient data or a non-positive `k`.
pub fn bollinger(prices: &[f64], window: usize, k: f64) -> Option<(f64, f64, f64)> {
    if k <= 0.0 {
        return None;
    }
    let middle = sma(prices, window)?;
    let sd = stdev(prices, window)?;

    let upper = middle + k * sd;
    let lower = middle - k * sd;
    (upper.is_finite() && lower.is_finite()).then_some((upper, middle, lower))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_series_collapses_to_the_midline() {
        let prices = [50.0; 25];
        let (upper, middle, lower) = bollinger(&prices, DEFAULT_BOLLINGER_WINDOW, DEFAULT_BOLLINGER_K).unwrap();
        assert_eq!(middle, 50.0);
        assert_eq!(upper, 50.0);
        assert_eq!(lower, 50.0);
    }

    #[test]
    fn bands_are_symmetric_around_the_midline() {
        let prices: Vec<f64> = (1..=30).map(|x| (x as f64).sin() * 3.0 + 100.0).collect();
        let (upper, middle, lower) = bollinger(&prices, 20, 2.0).unwrap();
        assert!((upper - middle - (middle - lower)).abs() < 1e-9);
        assert!(upper > middle && middle > lower);
    }

    #[test]
    fn insufficient_data_is_none() {
        assert_eq!(bollinger(&[1.0; 10], 20, 2.0), None);
    }

    #[test]
    fn non_positive_k_is_none() {
        assert_eq!(bollinger(&[1.0; 25], 20, 0.0), None);
        assert_eq!(bollinger(&[1.0; 25], 20, -1.0), None);
    }
}
