use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{ConfigurationError, EvaluationError, EvaluationResult};
use crate::models::*;

/// Compare in-sample and OOS Sharpe.
///
/// `drop = (IS - OOS) / IS` when the in-sample Sharpe is positive; the check
/// passes when `drop <= threshold`. The robustness score is `100 * (1 - drop)`
/// clamped to [0, 100]. A non-positive in-sample Sharpe makes the drop
/// `Undefined`, scores 0 and fails. Bad results are flags, never errors;
/// only malformed inputs return `Err`.
pub fn check_overfitting(
    in_sample: &MetricsResult,
    oos: &MetricsResult,
    threshold: f64,
) -> EvaluationResult<OverfittingCheck> {
    validate_threshold(threshold)?;
    if !in_sample.sharpe_ratio.is_finite() || !oos.sharpe_ratio.is_finite() {
        return Err(EvaluationError::MalformedInput(
            "Sharpe ratios must be finite".to_string(),
        ));
    }

    let mut flags = Vec::new();
    if oos.trade_count == 0 {
        flags.push("no out-of-sample trades".to_string());
    }

    if in_sample.sharpe_ratio <= 0.0 {
        flags.push(format!(
            "Sharpe drop undefined: in-sample edge non-positive (IS Sharpe {:.2}): FAIL",
            in_sample.sharpe_ratio
        ));
        return Ok(OverfittingCheck {
            sharpe_drop: Ratio::Undefined,
            robustness_score: 0.0,
            passed: false,
            flags,
        });
    }

    let drop = (in_sample.sharpe_ratio - oos.sharpe_ratio) / in_sample.sharpe_ratio;
    let passed = drop <= threshold;
    let robustness_score = robustness_score(drop);

    if drop < 0.0 {
        flags.push(format!(
            "OOS Sharpe improved {:.0}% over in-sample, threshold {:.0}%: PASS",
            -drop * 100.0,
            threshold * 100.0
        ));
    } else {
        flags.push(format!(
            "OOS Sharpe dropped {:.0}%, threshold {:.0}%: {}",
            drop * 100.0,
            threshold * 100.0,
            if passed { "PASS" } else { "FAIL" }
        ));
    }

    Ok(OverfittingCheck {
        sharpe_drop: Ratio::Finite(drop),
        robustness_score,
        passed,
        flags,
    })
}

/// Monotonic map from Sharpe drop to a 0-100 score.
pub fn robustness_score(drop: f64) -> f64 {
    ((1.0 - drop) * 100.0).clamp(0.0, 100.0)
}

/// Run the guard on a walk-forward result after checking its bookkeeping.
///
/// Insufficient data is reported as a failed check with a flag rather than
/// an error.
pub fn check_walk_forward(
    wf: &WalkForwardResult,
    threshold: f64,
) -> EvaluationResult<OverfittingCheck> {
    validate_threshold(threshold)?;
    if wf.insufficient_data != wf.windows.is_empty() {
        return Err(EvaluationError::MalformedInput(format!(
            "insufficient_data={} but {} windows",
            wf.insufficient_data,
            wf.windows.len()
        )));
    }
    if let Some((pos, w)) = wf.windows.iter().enumerate().find(|(i, w)| w.index != *i) {
        return Err(EvaluationError::MalformedInput(format!(
            "window at position {} has index {}",
            pos, w.index
        )));
    }
    if wf.aggregate_oos_trade_ids.len() != wf.aggregate_oos.trade_count {
        return Err(EvaluationError::MalformedInput(format!(
            "aggregate OOS lists {} trade ids but its metrics cover {} trades",
            wf.aggregate_oos_trade_ids.len(),
            wf.aggregate_oos.trade_count
        )));
    }

    if wf.insufficient_data {
        let mut flags = wf.flags.clone();
        flags.push("overfitting check skipped: insufficient data".to_string());
        return Ok(OverfittingCheck {
            sharpe_drop: Ratio::Undefined,
            robustness_score: 0.0,
            passed: false,
            flags,
        });
    }

    check_overfitting(&wf.aggregate_in_sample, &wf.aggregate_oos, threshold)
}

fn validate_threshold(threshold: f64) -> Result<(), ConfigurationError> {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
        return Err(ConfigurationError::OutOfRange {
            field: "oos_sharpe_drop_threshold",
            range: "(0, 1]",
            value: threshold,
        });
    }
    Ok(())
}

/// Selection-bias adjustment for the strategies of one comparison.
///
/// Picking the best of N ranked strategies inflates its Sharpe ratio. Under
/// the null of no skill the maximum of N Sharpe ratios has mean about
/// `sqrt(2 ln N)` and standard deviation about `1 / sqrt(2 ln N)` (Bailey &
/// López de Prado, 2014); each strategy's in-sample Sharpe is expressed as a
/// z-score against that maximum. Lives on `ComparisonReport`, not on the
/// per-strategy report, because it depends on how many strategies ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeflatedSharpeResult {
    pub deflated_sharpe: f64,
    pub observed_sharpe: f64,
    pub expected_max_sharpe_null: f64,
    pub std_max_sharpe_null: f64,
    /// Strategies ranked in the comparison.
    pub num_trials: usize,
    /// Training-window trades behind the observed Sharpe.
    pub num_observations: usize,
    /// Two-sided, always within [0, 1].
    pub p_value: f64,
}

/// Null distribution of the best Sharpe among `trials` skill-less strategies.
struct NullMaximum {
    expected: f64,
    std_dev: f64,
}

impl NullMaximum {
    fn for_trials(trials: usize) -> Option<Self> {
        if trials < 2 {
            return None;
        }
        let two_ln_n = 2.0 * (trials as f64).ln();
        Some(Self {
            expected: two_ln_n.sqrt(),
            std_dev: two_ln_n.recip().sqrt(),
        })
    }
}

/// Deflate every ranked strategy's aggregate in-sample Sharpe, with
/// `trials = entries.len()`.
pub fn deflate_comparison(entries: &[RobustnessReport]) -> BTreeMap<String, DeflatedSharpeResult> {
    entries
        .iter()
        .map(|r| {
            let dsr = deflated_sharpe_ratio(
                r.in_sample.sharpe_ratio,
                entries.len(),
                r.in_sample.trade_count,
                r.in_sample.skewness,
                r.in_sample.excess_kurtosis,
            );
            (r.strategy.clone(), dsr)
        })
        .collect()
}

/// Deflated Sharpe of one observation.
///
/// A lone strategy (or fewer than three returns) has nothing to deflate
/// against: the observed Sharpe comes back unchanged with `p_value = 1.0`.
pub fn deflated_sharpe_ratio(
    observed_sharpe: f64,
    num_trials: usize,
    num_observations: usize,
    skewness: f64,
    excess_kurtosis: f64,
) -> DeflatedSharpeResult {
    let null = match NullMaximum::for_trials(num_trials) {
        Some(null) if num_observations >= 3 => null,
        _ => {
            return DeflatedSharpeResult {
                deflated_sharpe: observed_sharpe,
                observed_sharpe,
                expected_max_sharpe_null: 0.0,
                std_max_sharpe_null: 0.0,
                num_trials,
                num_observations,
                p_value: 1.0,
            }
        }
    };

    let se = sharpe_standard_error(observed_sharpe, num_observations, skewness, excess_kurtosis);
    let deflated = (observed_sharpe - null.expected) / (null.std_dev + se);

    DeflatedSharpeResult {
        deflated_sharpe: deflated,
        observed_sharpe,
        expected_max_sharpe_null: null.expected,
        std_max_sharpe_null: null.std_dev,
        num_trials,
        num_observations,
        p_value: (2.0 * (1.0 - normal_cdf(deflated.abs()))).clamp(0.0, 1.0),
    }
}

/// Non-normal standard error of a Sharpe estimate, floored at `1/sqrt(T)`.
fn sharpe_standard_error(sharpe: f64, observations: usize, skewness: f64, excess_kurtosis: f64) -> f64 {
    let t = observations as f64;
    let sr2 = sharpe * sharpe;
    let var = (1.0 + sr2 / 2.0 - skewness * sharpe + excess_kurtosis * sr2 / 4.0) / t;
    var.max(t.recip()).sqrt()
}

fn normal_cdf(x: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.cdf(x),
        Err(_) => 0.5,
    }
}
