use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{EvaluationError, EvaluationResult, ValidationError};
use crate::friction::{apply_friction, cost_sensitivity, DEFAULT_COST_MULTIPLIERS};
use crate::loader::{load_segment, raw_trades_from_json};
use crate::metrics::compute_metrics;
use crate::models::*;
use crate::monte_carlo::monte_carlo;
use crate::overfitting::{check_walk_forward, deflate_comparison};
use crate::seeding::{derive_seed, resolve_seed, unit_rng};
use crate::walk_forward::walk_forward;

/// Stated in every `ComparisonReport`.
pub const RANKING_CRITERION: &str =
    "robustness_score desc, then aggregate OOS Sharpe desc, then strategy name asc";

/// Strategy name used for single-list evaluations.
pub const SINGLE_STRATEGY_NAME: &str = "strategy";

/// Full pipeline for one strategy: friction, walk-forward, Monte Carlo,
/// overfitting guard and cost sensitivity.
///
/// All randomness derives from `(run_seed, name)` and nothing else about the
/// run is consulted, so the report does not depend on which other strategies
/// are evaluated alongside it.
pub fn evaluate_strategy(
    name: &str,
    segment: &TradeSegment,
    config: &EvaluationConfig,
    friction: &FrictionConfig,
    run_seed: u64,
) -> EvaluationResult<RobustnessReport> {
    let strategy_seed = derive_seed(run_seed, name.as_bytes());

    let adjusted = TradeSegment::from_ordered(apply_friction(
        segment.trades(),
        friction,
        &mut unit_rng(strategy_seed, b"friction"),
    ));
    let full_sample = compute_metrics(adjusted.trades(), config);
    let wf = walk_forward(&adjusted, config);
    let overfitting = check_walk_forward(&wf, config.oos_sharpe_drop_threshold)?;

    let monte_carlo = config.monte_carlo_enabled.then(|| {
        monte_carlo(
            segment,
            friction,
            config.monte_carlo_sims,
            config.statistic,
            config,
            Some(derive_seed(strategy_seed, b"monte-carlo")),
        )
    });

    let cost_sensitivity = cost_sensitivity(
        segment.trades(),
        friction,
        &DEFAULT_COST_MULTIPLIERS,
        config,
        derive_seed(strategy_seed, b"cost-sensitivity"),
    );

    // The insufficient-data check already carries the walk-forward flags.
    let mut flags = if wf.insufficient_data {
        Vec::new()
    } else {
        wf.flags.clone()
    };
    flags.extend(overfitting.flags.iter().cloned());

    let unstable = monte_carlo.as_ref().is_some_and(|mc| mc.is_unstable);
    if let Some(mc) = monte_carlo.as_ref().filter(|mc| mc.is_unstable) {
        flags.push(format!(
            "Monte Carlo unstable: p5 {} {:.2} <= 0 while point estimate {:.2} > 0",
            mc.statistic, mc.percentile_5, mc.point_estimate
        ));
    }
    if let Some(m) = cost_sensitivity.breakeven_multiplier {
        flags.push(format!("edge disappears at {m}x friction costs"));
    }

    let passed = overfitting.passed && !unstable && !wf.insufficient_data;

    info!(
        "Evaluated '{}': {} trades, IS Sharpe {:.3}, OOS Sharpe {:.3}, score {:.1}, {}",
        name,
        segment.len(),
        wf.aggregate_in_sample.sharpe_ratio,
        wf.aggregate_oos.sharpe_ratio,
        overfitting.robustness_score,
        if passed { "PASS" } else { "FAIL" }
    );

    Ok(RobustnessReport {
        strategy: name.to_string(),
        rank: None,
        trade_count: segment.len(),
        full_sample,
        in_sample: wf.aggregate_in_sample.clone(),
        aggregate_oos: wf.aggregate_oos.clone(),
        robustness_score: overfitting.robustness_score,
        walk_forward: wf,
        monte_carlo,
        overfitting,
        cost_sensitivity,
        passed,
        flags,
    })
}

/// Evaluate every strategy independently (in parallel) and rank them.
///
/// A strategy whose pipeline fails lands in `failures`; the rest are still
/// ranked. Configuration errors abort before any strategy runs.
pub fn compare_strategies(
    strategy_segments: &BTreeMap<String, TradeSegment>,
    config: &EvaluationConfig,
    friction: &FrictionConfig,
) -> EvaluationResult<ComparisonReport> {
    config.validate()?;
    friction.validate()?;

    let run_seed = resolve_seed(config.seed);
    debug!(
        "Comparing {} strategies with run seed {}",
        strategy_segments.len(),
        run_seed
    );

    let outcomes: Vec<(String, EvaluationResult<RobustnessReport>)> = strategy_segments
        .par_iter()
        .map(|(name, segment)| {
            let report = evaluate_strategy(name, segment, config, friction, run_seed);
            (name.clone(), report)
        })
        .collect();

    let mut entries = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (strategy, outcome) in outcomes {
        match outcome {
            Ok(report) => entries.push(report),
            Err(e) => {
                warn!("Strategy '{}' failed: {}", strategy, e);
                failures.push(StrategyFailure {
                    strategy,
                    error: e.to_string(),
                });
            }
        }
    }

    rank_reports(&mut entries);
    let deflated_sharpe = deflate_comparison(&entries);

    Ok(ComparisonReport {
        ranking_criterion: RANKING_CRITERION.to_string(),
        entries,
        failures,
        deflated_sharpe,
    })
}

/// Sort by the ranking criterion and assign contiguous 1-based ranks.
pub fn rank_reports(entries: &mut [RobustnessReport]) {
    entries.sort_by(|a, b| {
        b.robustness_score
            .total_cmp(&a.robustness_score)
            .then_with(|| {
                b.aggregate_oos
                    .sharpe_ratio
                    .total_cmp(&a.aggregate_oos.sharpe_ratio)
            })
            .then_with(|| a.strategy.cmp(&b.strategy))
    });
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = Some(i + 1);
    }
}

/// Single entry point: load raw records, evaluate and report.
///
/// Read-only over its inputs. Invalid configuration fails fast. In single
/// mode a malformed record list is an error; in comparison mode it becomes a
/// `StrategyFailure` and the other strategies proceed. A load that yields no
/// trades is evaluated as an empty segment and reported as insufficient data.
pub fn run_evaluation(
    input: EvaluationInput,
    config: &EvaluationConfig,
    friction: &FrictionConfig,
) -> EvaluationResult<EvaluationReport> {
    config.validate()?;
    friction.validate()?;

    match input {
        EvaluationInput::Single(raw) => {
            let segment = loaded_or_empty(load_segment(&raw, None)?);
            let run_seed = resolve_seed(config.seed);
            let report =
                evaluate_strategy(SINGLE_STRATEGY_NAME, &segment, config, friction, run_seed)?;
            Ok(EvaluationReport::Single(report))
        }
        EvaluationInput::Strategies(raw_by_name) => compare_loaded(
            raw_by_name.into_iter().map(|(name, raw)| (name, Ok(raw))),
            config,
            friction,
        ),
        EvaluationInput::StrategiesJson(json_by_name) => compare_loaded(
            json_by_name
                .into_iter()
                .map(|(name, value)| (name, raw_trades_from_json(value))),
            config,
            friction,
        ),
    }
}

/// Load each strategy's records; parse or load errors become
/// `StrategyFailure`s and the remaining strategies are compared.
fn compare_loaded<I>(
    strategies: I,
    config: &EvaluationConfig,
    friction: &FrictionConfig,
) -> EvaluationResult<EvaluationReport>
where
    I: IntoIterator<Item = (String, Result<Vec<RawTrade>, ValidationError>)>,
{
    let mut segments = BTreeMap::new();
    let mut load_failures = Vec::new();
    for (name, parsed) in strategies {
        match parsed.and_then(|raw| load_segment(&raw, None)) {
            Ok(load) => {
                segments.insert(name, loaded_or_empty(load));
            }
            Err(e) => {
                warn!("Strategy '{}' failed to load: {}", name, e);
                load_failures.push(StrategyFailure {
                    strategy: name,
                    error: EvaluationError::from(e).to_string(),
                });
            }
        }
    }

    let mut report = compare_strategies(&segments, config, friction)?;
    report.failures.extend(load_failures);
    report.failures.sort_by(|a, b| a.strategy.cmp(&b.strategy));
    Ok(EvaluationReport::Comparison(report))
}

fn loaded_or_empty(load: SegmentLoad) -> TradeSegment {
    load.into_segment()
        .unwrap_or_else(|| TradeSegment::from_ordered(Vec::new()))
}
