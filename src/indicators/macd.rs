// =============================================================================
// MACD — Moving Average Convergence/Divergence (12 / 26 / 9)
// =============================================================================
//
// macd_line = EMA(12) - EMA(26)
// signal    = EMA(9) of the macd line
// histogram = macd_line - signal
// =============================================================================

/// Standard fast EMA period.
pub const MACD_FAST: usize = 12;
/// Standard slow EMA period.
pub const MACD_SLOW: usize = 26;
/// Standard signal EMA period.
pub const MACD_SIGNAL: usize = 9;

/// Chronological EMA series over `values` (oldest first), seeded with the SMA
/// of the first `window` values. One output per input from index `window - 1`.
fn ema_series(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || values.len() < window {
        return Vec::new();
    }
    let multiplier = 2.0 / (window as f64 + 1.0);
    let mut value = values[..window].iter().sum::<f64>() / window as f64;
    if !value.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - window + 1);
    out.push(value);
    for &v in &values[window..] {
        value = v * multiplier + value * (1.0 - multiplier);
        if !value.is_finite() {
            break;
        }
        out.push(value);
    }
    out
}

/// Latest `(macd_line, signal, histogram)` for a newest-first close series.
///
/// Needs at least `MACD_SLOW + MACD_SIGNAL - 1` closes (34); returns `None`
/// otherwise.
pub fn macd(prices: &[f64]) -> Option<(f64, f64, f64)> {
    if prices.len() < MACD_SLOW + MACD_SIGNAL - 1 {
        return None;
    }

    // The EMA recursion runs oldest-to-newest.
    let chronological: Vec<f64> = prices.iter().rev().copied().collect();

    let fast = ema_series(&chronological, MACD_FAST);
    let slow = ema_series(&chronological, MACD_SLOW);
    if fast.is_empty() || slow.is_empty() {
        return None;
    }

    // Align the two series on their common (newest) suffix.
    let common = fast.len().min(slow.len());
    let macd_line: Vec<f64> = fast[fast.len() - common..]
        .iter()
        .zip(&slow[slow.len() - common..])
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema_series(&macd_line, MACD_SIGNAL);
    let signal = *signal_series.last()?;
    let line = *macd_line.last()?;
    let histogram = line - signal;

    (line.is_finite() && signal.is_finite()).then_some((line, signal, histogram))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_series_is_all_zero() {
        let prices = [100.0; 60];
        let (line, signal, hist) = macd(&prices).unwrap();
        assert!(line.abs() < 1e-9);
        assert!(signal.abs() < 1e-9);
        assert!(hist.abs() < 1e-9);
    }

    #[test]
    fn uptrend_has_positive_macd_line() {
        let prices: Vec<f64> = (1..=80).rev().map(|x| x as f64).collect();
        let (line, _, _) = macd(&prices).unwrap();
        assert!(line > 0.0);
    }

    #[test]
    fn downtrend_has_negative_macd_line() {
        let prices: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        let (line, _, _) = macd(&prices).unwrap();
        assert!(line < 0.0);
    }

    #[test]
    fn insufficient_data_is_none() {
        let prices = [100.0; 33];
        assert_eq!(macd(&prices), None);
    }

    #[test]
    fn histogram_is_line_minus_signal() {
        let prices: Vec<f64> = (1..=80).map(|x| ((x as f64) * 0.3).sin() * 5.0 + 100.0).collect();
        let (line, signal, hist) = macd(&prices).unwrap();
        assert!((hist - (line - signal)).abs() < 1e-12);
    }
}
