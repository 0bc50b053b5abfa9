use std::collections::HashSet;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;

use robustness_engine::*;

fn arb_trades(max_len: usize) -> impl Strategy<Value = Vec<Trade>> {
    prop::collection::vec((0i64..400 * 24, 0i64..72, -5_000i64..5_000, 100i64..50_000), 0..max_len)
        .prop_map(|rows| {
            let base = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
            rows.into_iter()
                .enumerate()
                .map(|(i, (entry_h, hold_h, pnl_cents, notional))| {
                    let entry = base + Duration::hours(entry_h);
                    Trade {
                        id: format!("p{i}"),
                        entry_time: entry,
                        exit_time: entry + Duration::hours(hold_h),
                        side: if i % 2 == 0 { Side::Long } else { Side::Short },
                        gross_pnl: Decimal::new(pnl_cents, 2),
                        notional: Decimal::new(notional, 0),
                        symbol: "XYZ".to_string(),
                        volatility: None,
                        friction_cost: Decimal::ZERO,
                        fill_ratio: 1.0,
                    }
                })
                .collect()
        })
}

fn raw_from(trades: &[Trade]) -> Vec<RawTrade> {
    trades
        .iter()
        .map(|t| RawTrade {
            id: Some(t.id.clone()),
            entry_time: Some(t.entry_time.to_rfc3339()),
            exit_time: Some(t.exit_time.to_rfc3339()),
            side: Some(match t.side {
                Side::Long => "long".to_string(),
                Side::Short => "short".to_string(),
            }),
            notional: Some(t.notional),
            gross_pnl: Some(t.gross_pnl),
            symbol: Some(t.symbol.clone()),
            volatility: t.volatility,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn friction_never_increases_pnl(
        trades in arb_trades(40),
        commission in 0.0f64..0.01,
        spread in 0.0f64..50.0,
        slippage in 0.0f64..50.0,
        seed in any::<u64>(),
    ) {
        let friction = FrictionConfig {
            commission_rate: commission,
            spread_bps: spread,
            slippage_bps: slippage,
            partial_fill_rate: 0.0,
            ..Default::default()
        };
        let adjusted = apply_friction(&trades, &friction, &mut StdRng::seed_from_u64(seed));
        prop_assert_eq!(adjusted.len(), trades.len());
        for (before, after) in trades.iter().zip(&adjusted) {
            prop_assert!(after.gross_pnl <= before.gross_pnl);
            prop_assert!(after.friction_cost >= Decimal::ZERO);
        }
    }

    #[test]
    fn robustness_score_is_bounded(
        is_sharpe in -100.0f64..100.0,
        oos_sharpe in -100.0f64..100.0,
        threshold in 0.01f64..=1.0,
    ) {
        let empty = compute_metrics(&[], &EvaluationConfig::default());
        let in_sample = MetricsResult { sharpe_ratio: is_sharpe, ..empty.clone() };
        let oos = MetricsResult { sharpe_ratio: oos_sharpe, ..empty };
        let check = check_overfitting(&in_sample, &oos, threshold).unwrap();
        prop_assert!((0.0..=100.0).contains(&check.robustness_score));
        if let Some(drop) = check.sharpe_drop.finite() {
            prop_assert_eq!(check.passed, drop <= threshold);
        } else {
            prop_assert!(!check.passed);
        }
    }

    #[test]
    fn aggregate_oos_never_contains_training_trades(
        trades in arb_trades(120),
        train in 5i64..60,
        test in 1i64..30,
        step in 1i64..40,
    ) {
        let segment = TradeSegment::new(trades).unwrap();
        let config = EvaluationConfig {
            train_days: train,
            test_days: test,
            step_days: step,
            ..Default::default()
        };
        let result = walk_forward(&segment, &config);
        let oos: HashSet<&String> = result.aggregate_oos_trade_ids.iter().collect();
        prop_assert_eq!(oos.len(), result.aggregate_oos.trade_count);
        for window in &result.windows {
            for id in &window.train_trade_ids {
                prop_assert!(!oos.contains(id));
            }
        }
        prop_assert!(check_walk_forward(&result, config.oos_sharpe_drop_threshold).is_ok());
    }

    #[test]
    fn loading_is_idempotent(trades in arb_trades(60)) {
        let raw = raw_from(&trades);
        let first = load_segment(&raw, None).unwrap();
        let second = load_segment(&raw, None).unwrap();
        prop_assert_eq!(&first, &second);
        if let SegmentLoad::Loaded(segment) = first {
            prop_assert!(segment
                .trades()
                .windows(2)
                .all(|w| w[0].entry_time <= w[1].entry_time));
        }
    }
}
