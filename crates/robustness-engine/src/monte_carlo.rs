use rand::seq::SliceRandom;
use rayon::prelude::*;
use rust_decimal::prelude::*;
use tracing::debug;

use crate::friction::apply_friction;
use crate::metrics::{max_drawdown_percent, periods_per_year, sharpe_ratio};
use crate::models::*;
use crate::seeding::{indexed_rng, resolve_seed, unit_rng};

impl Statistic {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TotalPnl => "total_pnl",
            Self::Sharpe => "sharpe",
        }
    }

    pub fn evaluate(&self, trades: &[Trade], config: &EvaluationConfig) -> f64 {
        match self {
            Self::TotalPnl => trades.iter().map(Trade::pnl_f64).sum(),
            Self::Sharpe => {
                let returns: Vec<f64> = trades.iter().map(Trade::return_fraction).collect();
                let ppy = periods_per_year(trades, config.trading_days_per_year);
                sharpe_ratio(&returns, config.risk_free_rate, ppy)
            }
        }
    }
}

/// Run Monte Carlo on one of the built-in statistics.
pub fn monte_carlo(
    segment: &TradeSegment,
    friction: &FrictionConfig,
    sims: usize,
    statistic: Statistic,
    config: &EvaluationConfig,
    seed: Option<u64>,
) -> MonteCarloResult {
    monte_carlo_with(segment, friction, sims, config, seed, statistic.name(), |trades| {
        statistic.evaluate(trades, config)
    })
}

/// Resample trade order and friction draws `sims` times and collect the
/// distribution of `statistic_fn`.
///
/// Each simulation permutes the trade order (timestamps are untouched) and
/// re-applies friction with its own RNG seeded from `(seed, index)`, so the
/// result is identical whether rayon runs the simulations in parallel or
/// not. `is_unstable` is set when the 5th percentile is non-positive while
/// the unreordered point estimate is positive.
pub fn monte_carlo_with<F>(
    segment: &TradeSegment,
    friction: &FrictionConfig,
    sims: usize,
    config: &EvaluationConfig,
    seed: Option<u64>,
    statistic_name: &str,
    statistic_fn: F,
) -> MonteCarloResult
where
    F: Fn(&[Trade]) -> f64 + Sync,
{
    let seed = resolve_seed(seed);
    let trades = segment.trades();

    if trades.is_empty() || sims == 0 {
        return empty_result(statistic_name, seed);
    }

    let capital = config.initial_capital.to_f64().unwrap_or(100000.0);

    // Point estimate: original order, deterministic costs only.
    let point_trades = apply_friction(
        trades,
        &friction.without_partial_fills(),
        &mut unit_rng(seed, b"point-estimate"),
    );
    let point_estimate = finite_or_zero(statistic_fn(&point_trades));

    let sim_results: Vec<(f64, f64)> = (0..sims)
        .into_par_iter()
        .map(|i| {
            let mut rng = indexed_rng(seed, i);
            let mut shuffled = trades.to_vec();
            shuffled.shuffle(&mut rng);
            let adjusted = apply_friction(&shuffled, friction, &mut rng);

            let value = finite_or_zero(statistic_fn(&adjusted));
            let pnls: Vec<f64> = adjusted.iter().map(Trade::pnl_f64).collect();
            (value, max_drawdown_percent(&pnls, capital))
        })
        .collect();

    let mut values: Vec<f64> = Vec::with_capacity(sims);
    let mut drawdowns: Vec<f64> = Vec::with_capacity(sims);
    for (value, dd) in sim_results {
        values.push(value);
        drawdowns.push(dd);
    }

    values.sort_by(f64::total_cmp);
    drawdowns.sort_by(f64::total_cmp);

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let profitable = values.iter().filter(|v| **v > 0.0).count();

    let percentile_5 = percentile(&values, 5.0);
    let is_unstable = percentile_5 <= 0.0 && point_estimate > 0.0;

    debug!(
        "Monte Carlo {}: {} sims, p5 {:.4}, p50 {:.4}, p95 {:.4}, point {:.4}",
        statistic_name,
        sims,
        percentile_5,
        percentile(&values, 50.0),
        percentile(&values, 95.0),
        point_estimate
    );

    MonteCarloResult {
        statistic: statistic_name.to_string(),
        simulations: sims,
        seed,
        point_estimate,
        mean,
        std_dev: var.sqrt(),
        percentile_5,
        percentile_25: percentile(&values, 25.0),
        percentile_50: percentile(&values, 50.0),
        percentile_75: percentile(&values, 75.0),
        percentile_95: percentile(&values, 95.0),
        probability_of_profit: profitable as f64 / n * 100.0,
        median_max_drawdown: percentile(&drawdowns, 50.0),
        max_drawdown_95: percentile(&drawdowns, 95.0),
        is_unstable,
        distribution: sample_distribution(&values, 200),
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn sample_distribution(sorted: &[f64], max_pts: usize) -> Vec<f64> {
    if sorted.len() <= max_pts {
        return sorted.to_vec();
    }
    let step = sorted.len() as f64 / max_pts as f64;
    (0..max_pts)
        .map(|i| sorted[(i as f64 * step) as usize])
        .collect()
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn empty_result(statistic_name: &str, seed: u64) -> MonteCarloResult {
    MonteCarloResult {
        statistic: statistic_name.to_string(),
        simulations: 0,
        seed,
        point_estimate: 0.0,
        mean: 0.0,
        std_dev: 0.0,
        percentile_5: 0.0,
        percentile_25: 0.0,
        percentile_50: 0.0,
        percentile_75: 0.0,
        percentile_95: 0.0,
        probability_of_profit: 0.0,
        median_max_drawdown: 0.0,
        max_drawdown_95: 0.0,
        is_unstable: false,
        distribution: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_timestamp;
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn segment(pnls: &[i64]) -> TradeSegment {
        let start = parse_timestamp("2024-03-01").unwrap();
        let trades = pnls
            .iter()
            .enumerate()
            .map(|(i, &pnl)| Trade {
                id: format!("m{i}"),
                entry_time: start + Duration::days(i as i64),
                exit_time: start + Duration::days(i as i64) + Duration::hours(2),
                side: Side::Long,
                gross_pnl: Decimal::new(pnl, 0),
                notional: Decimal::new(1000, 0),
                symbol: "ES".to_string(),
                volatility: None,
                friction_cost: Decimal::ZERO,
                fill_ratio: 1.0,
            })
            .collect();
        TradeSegment::new(trades).unwrap()
    }

    fn noisy_friction() -> FrictionConfig {
        FrictionConfig {
            commission_rate: 0.0002,
            slippage_bps: 2.0,
            partial_fill_rate: 0.9,
            partial_fill_ratio_min: 0.05,
            partial_fill_ratio_max: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_seeded_runs_are_bit_identical() {
        let seg = segment(&[40, -25, 10, -5, 30, -20, 15]);
        let config = EvaluationConfig::default();
        let a = monte_carlo(&seg, &noisy_friction(), 300, Statistic::TotalPnl, &config, Some(11));
        let b = monte_carlo(&seg, &noisy_friction(), 300, Statistic::TotalPnl, &config, Some(11));
        assert_eq!(a, b);
        assert_eq!(a.simulations, 300);
        assert_eq!(a.seed, 11);

        let c = monte_carlo(&seg, &noisy_friction(), 300, Statistic::TotalPnl, &config, Some(12));
        assert_ne!(a.distribution, c.distribution);
    }

    #[test]
    fn test_matches_sequential_execution() {
        let seg = segment(&[12, -7, 3, 9, -4]);
        let config = EvaluationConfig::default();
        let friction = noisy_friction();
        let result = monte_carlo(&seg, &friction, 50, Statistic::TotalPnl, &config, Some(5));

        let mut expected: Vec<f64> = (0..50)
            .map(|i| {
                let mut rng = indexed_rng(5, i);
                let mut shuffled = seg.trades().to_vec();
                shuffled.shuffle(&mut rng);
                let adjusted = apply_friction(&shuffled, &friction, &mut rng);
                Statistic::TotalPnl.evaluate(&adjusted, &config)
            })
            .collect();
        expected.sort_by(f64::total_cmp);
        assert_eq!(result.distribution, expected);
    }

    #[test]
    fn test_order_dependent_profit_is_unstable() {
        let seg = segment(&[100, -90]);
        let result = monte_carlo(
            &seg,
            &noisy_friction(),
            500,
            Statistic::TotalPnl,
            &EvaluationConfig::default(),
            Some(2024),
        );
        assert!(result.point_estimate > 0.0);
        assert!(result.percentile_5 <= 0.0);
        assert!(result.is_unstable);
    }

    #[test]
    fn test_consistent_winner_is_stable() {
        let seg = segment(&[10, 5, 2, 8, 4]);
        let result = monte_carlo(
            &seg,
            &FrictionConfig::default(),
            200,
            Statistic::TotalPnl,
            &EvaluationConfig::default(),
            Some(1),
        );
        assert!(!result.is_unstable);
        assert_eq!(result.percentile_5, 29.0);
        assert_eq!(result.percentile_95, 29.0);
        assert_eq!(result.probability_of_profit, 100.0);
        assert_eq!(result.median_max_drawdown, 0.0);
    }

    #[test]
    fn test_reordering_changes_drawdown_path() {
        let seg = segment(&[500, 500, 500, -400, -400, -400]);
        let result = monte_carlo(
            &seg,
            &FrictionConfig::default(),
            400,
            Statistic::TotalPnl,
            &EvaluationConfig::default(),
            Some(8),
        );
        // Total is order independent, drawdown is not.
        assert_eq!(result.std_dev, 0.0);
        assert!(result.median_max_drawdown > 0.0);
        assert!(result.max_drawdown_95 >= result.median_max_drawdown);
    }

    #[test]
    fn test_sharpe_statistic_and_empty_segment() {
        let seg = segment(&[10, -3, 6, -1, 4, 2]);
        let result = monte_carlo(
            &seg,
            &FrictionConfig::default(),
            100,
            Statistic::Sharpe,
            &EvaluationConfig::default(),
            Some(3),
        );
        assert_eq!(result.statistic, "sharpe");
        assert!(result.distribution.iter().all(|v| v.is_finite()));

        let empty = TradeSegment::new(Vec::new()).unwrap();
        let none = monte_carlo(&empty, &FrictionConfig::default(), 100, Statistic::TotalPnl, &EvaluationConfig::default(), Some(3));
        assert_eq!(none.simulations, 0);
        assert!(!none.is_unstable);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<f64> = (0..=100).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 5.0), 5.0);
        assert_eq!(percentile(&sorted, 50.0), 50.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
