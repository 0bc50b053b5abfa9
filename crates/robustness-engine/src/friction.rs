use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::metrics::compute_metrics;
use crate::models::*;
use crate::seeding::unit_rng;

/// Floor applied to partial-fill ratios so no trade ends up with zero size.
pub const MIN_FILL_RATIO: f64 = 1e-4;

/// Cost multipliers swept by the sensitivity report (zero-cost baseline first).
pub const DEFAULT_COST_MULTIPLIERS: [f64; 4] = [0.0, 1.0, 2.0, 3.0];

/// Apply commission, spread/slippage and partial fills to every trade.
///
/// Returns a new list of the same length and order. One uniform draw is
/// taken per trade to decide the partial fill (plus one more for the ratio
/// when it triggers), so the output is reproducible for a seeded `rng`.
/// Costs are charged on the filled notional.
pub fn apply_friction<R: Rng + ?Sized>(
    trades: &[Trade],
    friction: &FrictionConfig,
    rng: &mut R,
) -> Vec<Trade> {
    let legs = if friction.commission_per_leg { 2 } else { 1 };
    let commission_rate =
        Decimal::from_f64(friction.commission_rate).unwrap_or(Decimal::ZERO) * Decimal::from(legs);
    let crossing_rate = Decimal::from_f64((friction.spread_bps + friction.slippage_bps) / 10_000.0)
        .unwrap_or(Decimal::ZERO);
    let min_ratio = Decimal::from_f64(MIN_FILL_RATIO).unwrap_or(Decimal::ONE);

    trades
        .iter()
        .map(|trade| {
            let fill_ratio = draw_fill_ratio(friction, rng);
            let ratio = Decimal::from_f64(fill_ratio).unwrap_or(Decimal::ONE);

            let mut notional = trade.notional * ratio;
            if notional <= Decimal::ZERO {
                notional = trade.notional * min_ratio;
            }
            let gross_pnl = trade.gross_pnl * ratio;

            let commission = notional * commission_rate;
            let crossing = notional * crossing_rate;
            let cost = commission + crossing;

            Trade {
                gross_pnl: gross_pnl - cost,
                notional,
                friction_cost: trade.friction_cost + cost,
                fill_ratio: trade.fill_ratio * fill_ratio,
                ..trade.clone()
            }
        })
        .collect()
}

fn draw_fill_ratio<R: Rng + ?Sized>(friction: &FrictionConfig, rng: &mut R) -> f64 {
    let u: f64 = rng.gen();
    if u >= friction.partial_fill_rate {
        return 1.0;
    }
    let lo = friction.partial_fill_ratio_min.max(MIN_FILL_RATIO);
    let hi = friction.partial_fill_ratio_max.max(lo);
    let ratio = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
    ratio.clamp(MIN_FILL_RATIO, 1.0)
}

/// Re-run friction at several cost multipliers to see how fast the edge
/// erodes. Every multiplier reuses the same partial-fill draws.
pub fn cost_sensitivity(
    trades: &[Trade],
    friction: &FrictionConfig,
    multipliers: &[f64],
    config: &EvaluationConfig,
    seed: u64,
) -> CostSensitivity {
    let points: Vec<CostSensitivityPoint> = multipliers
        .iter()
        .map(|&multiplier| {
            let mut rng = unit_rng(seed, b"cost-sensitivity");
            let adjusted = apply_friction(trades, &friction.scaled(multiplier), &mut rng);
            let metrics = compute_metrics(&adjusted, config);
            CostSensitivityPoint {
                multiplier,
                total_pnl: metrics.total_pnl,
                sharpe_ratio: metrics.sharpe_ratio,
                expectancy: metrics.expectancy,
            }
        })
        .collect();

    let breakeven_multiplier = points
        .iter()
        .find(|p| p.total_pnl <= 0.0)
        .map(|p| p.multiplier);

    CostSensitivity {
        points,
        breakeven_multiplier,
    }
}
