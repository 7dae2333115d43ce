// =============================================================================
// Benchmark-relative statistics — beta, alpha, correlation
// =============================================================================
//
// All three operate on two newest-first daily return series over the same
// `window`. Covariance and variance are population statistics, consistent
// with the dispersion module.
// =============================================================================

use super::sharpe::DEFAULT_RISK_FREE_RATE;
use super::spread::stdev;
use super::TRADING_DAYS_PER_YEAR;

/// Population covariance over the newest `window` pairs.
fn covariance(a: &[f64], b: &[f64], window: usize) -> Option<f64> {
    if window == 0 || a.len() < window || b.len() < window {
        return None;
    }
    let (a, b) = (&a[..window], &b[..window]);
    let mean_a = a.iter().sum::<f64>() / window as f64;
    let mean_b = b.iter().sum::<f64>() / window as f64;
    let cov = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>()
        / window as f64;
    cov.is_finite().then_some(cov)
}

/// Beta of `asset` returns against `benchmark` returns.
///
/// Returns `None` on insufficient data or zero benchmark variance.
pub fn beta(asset: &[f64], benchmark: &[f64], window: usize) -> Option<f64> {
    let cov = covariance(asset, benchmark, window)?;
    let bench_sd = stdev(&benchmark[..window.min(benchmark.len())], window)?;
    let bench_var = bench_sd * bench_sd;
    if bench_var == 0.0 {
        return None;
    }
    let value = cov / bench_var;
    value.is_finite().then_some(value)
}

/// Annualised Jensen's alpha: realised return minus the CAPM-expected return.
pub fn alpha(asset: &[f64], benchmark: &[f64], window: usize, risk_free_rate: f64) -> Option<f64> {
    if window == 0 || asset.len() < window || benchmark.len() < window {
        return None;
    }
    let b = beta(asset, benchmark, window)?;

    let mean_asset = asset[..window].iter().sum::<f64>() / window as f64;
    let mean_bench = benchmark[..window].iter().sum::<f64>() / window as f64;

    let annual_asset = mean_asset * TRADING_DAYS_PER_YEAR;
    let annual_bench = mean_bench * TRADING_DAYS_PER_YEAR;

    let value = annual_asset - (risk_free_rate + b * (annual_bench - risk_free_rate));
    value.is_finite().then_some(value)
}

/// Alpha with the default risk-free assumption.
pub fn alpha_default_rf(asset: &[f64], benchmark: &[f64], window: usize) -> Option<f64> {
    alpha(asset, benchmark, window, DEFAULT_RISK_FREE_RATE)
}

/// Pearson correlation of the two return series over `window`.
pub fn correlation(asset: &[f64], benchmark: &[f64], window: usize) -> Option<f64> {
    let cov = covariance(asset, benchmark, window)?;
    let sd_a = stdev(&asset[..window.min(asset.len())], window)?;
    let sd_b = stdev(&benchmark[..window.min(benchmark.len())], window)?;
    if sd_a == 0.0 || sd_b == 0.0 {
        return None;
    }
    let value = cov / (sd_a * sd_b);
    value.is_finite().then_some(value)
}
