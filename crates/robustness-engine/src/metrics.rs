use rust_decimal::prelude::ToPrimitive;

use crate::models::*;

/// Below this standard deviation returns are treated as constant.
const ZERO_VARIANCE_EPS: f64 = 1e-12;
const DAYS_PER_YEAR: f64 = 365.25;

/// Compute the full metric snapshot for a window of trades.
///
/// Pure and deterministic: the same trades and config always produce a
/// bit-identical result. An empty slice yields an all-zero snapshot so that
/// empty walk-forward windows remain reportable.
pub fn compute_metrics(trades: &[Trade], config: &EvaluationConfig) -> MetricsResult {
    let ppy = periods_per_year(trades, config.trading_days_per_year);
    let capital = config.initial_capital.to_f64().unwrap_or(100000.0);

    let pnls: Vec<f64> = trades.iter().map(Trade::pnl_f64).collect();
    let returns: Vec<f64> = trades.iter().map(Trade::return_fraction).collect();

    let wins = pnls.iter().filter(|p| **p > 0.0).count();
    let win_rate = if trades.is_empty() {
        0.0
    } else {
        wins as f64 / trades.len() as f64 * 100.0
    };

    MetricsResult {
        trade_count: trades.len(),
        total_pnl: pnls.iter().sum(),
        sharpe_ratio: sharpe_ratio(&returns, config.risk_free_rate, ppy),
        max_drawdown_percent: max_drawdown_percent(&pnls, capital),
        profit_factor: profit_factor(&pnls),
        expectancy: expectancy(&pnls),
        win_rate,
        skewness: skewness(&returns),
        excess_kurtosis: excess_kurtosis(&returns),
        periods_per_year: ppy,
        rolling_sharpe: rolling_sharpe(&returns, config.rolling_window, config.risk_free_rate, ppy),
        volatility_buckets: volatility_buckets(trades, config, ppy, capital),
    }
}

/// Trades per year implied by the span from first entry to last exit.
///
/// Falls back to `fallback` when there are fewer than two trades or the
/// span is shorter than a day.
pub fn periods_per_year(trades: &[Trade], fallback: f64) -> f64 {
    if trades.len() < 2 {
        return fallback;
    }
    let first = trades.iter().map(|t| t.entry_time).min();
    let last = trades.iter().map(|t| t.exit_time).max();
    let span_days = match (first, last) {
        (Some(f), Some(l)) => (l - f).num_seconds() as f64 / 86_400.0,
        _ => 0.0,
    };
    if span_days < 1.0 {
        return fallback;
    }
    trades.len() as f64 / (span_days / DAYS_PER_YEAR)
}

/// Annualized Sharpe ratio of per-trade returns.
///
/// Zero variance yields 0 when the mean excess return is zero and the signed
/// `SHARPE_SENTINEL` otherwise. Fewer than two returns yield 0.
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> f64 {
    if returns.len() < 2 || periods_per_year <= 0.0 {
        return 0.0;
    }
    let rf_per_period = risk_free_rate / periods_per_year;
    let n = returns.len() as f64;
    let mean = returns.iter().map(|r| r - rf_per_period).sum::<f64>() / n;
    let var = returns
        .iter()
        .map(|r| (r - rf_per_period - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let std = var.sqrt();

    if std < ZERO_VARIANCE_EPS {
        if mean.abs() < ZERO_VARIANCE_EPS {
            0.0
        } else {
            SHARPE_SENTINEL.copysign(mean)
        }
    } else {
        (mean / std * periods_per_year.sqrt()).clamp(-SHARPE_SENTINEL, SHARPE_SENTINEL)
    }
}

/// Largest peak-to-trough decline of `initial_capital + cumulative P&L`, as
/// a percentage of the running peak. 0 for a non-decreasing curve.
pub fn max_drawdown_percent(pnls: &[f64], initial_capital: f64) -> f64 {
    let mut equity = initial_capital;
    let mut peak = initial_capital;
    let mut max_dd = 0.0_f64;
    for pnl in pnls {
        equity += pnl;
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak * 100.0;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

/// Gross profit over gross loss. `Infinite` when there are profits but no
/// losses, `Finite(0.0)` when there is no profit at all.
pub fn profit_factor(pnls: &[f64]) -> Ratio {
    let gross_profit: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = pnls.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();
    if gross_profit <= 0.0 {
        Ratio::Finite(0.0)
    } else if gross_loss <= 0.0 {
        Ratio::Infinite
    } else {
        Ratio::Finite(gross_profit / gross_loss)
    }
}

pub fn expectancy(pnls: &[f64]) -> f64 {
    if pnls.is_empty() {
        0.0
    } else {
        pnls.iter().sum::<f64>() / pnls.len() as f64
    }
}

/// Sample skewness; 0 for fewer than 3 points or constant data.
pub fn skewness(returns: &[f64]) -> f64 {
    let n = returns.len() as f64;
    if n < 3.0 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / n;
    let m2: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let m3: f64 = returns.iter().map(|r| (r - mean).powi(3)).sum::<f64>() / n;
    let std = m2.sqrt();
    if std > 1e-15 {
        m3 / std.powi(3)
    } else {
        0.0
    }
}

/// Excess kurtosis; 0 for fewer than 4 points or constant data.
pub fn excess_kurtosis(returns: &[f64]) -> f64 {
    let n = returns.len() as f64;
    if n < 4.0 {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / n;
    let m2: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let m4: f64 = returns.iter().map(|r| (r - mean).powi(4)).sum::<f64>() / n;
    if m2 > 1e-15 {
        m4 / m2.powi(2) - 3.0
    } else {
        0.0
    }
}

/// Sharpe over each trailing window of `window` trades.
pub fn rolling_sharpe(
    returns: &[f64],
    window: usize,
    risk_free_rate: f64,
    periods_per_year: f64,
) -> Vec<f64> {
    if window == 0 || returns.len() < window {
        return Vec::new();
    }
    returns
        .windows(window)
        .map(|w| sharpe_ratio(w, risk_free_rate, periods_per_year))
        .collect()
}

/// Per-trade volatility proxy: the recorded market volatility when present,
/// otherwise the trailing standard deviation of per-trade returns.
fn volatility_proxies(trades: &[Trade], window: usize) -> Vec<f64> {
    let returns: Vec<f64> = trades.iter().map(Trade::return_fraction).collect();
    let window = window.max(1);
    trades
        .iter()
        .enumerate()
        .map(|(i, t)| {
            t.volatility.unwrap_or_else(|| {
                let start = (i + 1).saturating_sub(window);
                sample_std(&returns[start..=i])
            })
        })
        .collect()
}

fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}

/// Split trades into volatility terciles by proxy rank and recompute the
/// headline metrics per bucket. Empty buckets are omitted.
fn volatility_buckets(
    trades: &[Trade],
    config: &EvaluationConfig,
    periods_per_year: f64,
    capital: f64,
) -> Vec<BucketMetrics> {
    if trades.is_empty() {
        return Vec::new();
    }
    let proxies = volatility_proxies(trades, config.rolling_window);
    let mut order: Vec<usize> = (0..trades.len()).collect();
    order.sort_by(|&a, &b| proxies[a].total_cmp(&proxies[b]).then(a.cmp(&b)));

    let n = trades.len();
    let mut members: [Vec<usize>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    for (rank, idx) in order.into_iter().enumerate() {
        members[(rank * 3 / n).min(2)].push(idx);
    }

    [VolatilityBucket::Low, VolatilityBucket::Medium, VolatilityBucket::High]
        .into_iter()
        .zip(members)
        .filter(|(_, idxs)| !idxs.is_empty())
        .map(|(bucket, mut idxs)| {
            // Back to time order so drawdown follows the real path.
            idxs.sort_unstable();
            let pnls: Vec<f64> = idxs.iter().map(|&i| trades[i].pnl_f64()).collect();
            let returns: Vec<f64> = idxs.iter().map(|&i| trades[i].return_fraction()).collect();
            BucketMetrics {
                bucket,
                trade_count: idxs.len(),
                sharpe_ratio: sharpe_ratio(&returns, config.risk_free_rate, periods_per_year),
                max_drawdown_percent: max_drawdown_percent(&pnls, capital),
                profit_factor: profit_factor(&pnls),
                expectancy: expectancy(&pnls),
            }
        })
        .collect()
}
