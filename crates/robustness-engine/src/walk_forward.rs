use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::metrics::compute_metrics;
use crate::models::*;

/// Rolling train/test validation over a (friction-adjusted) segment.
///
/// Windows start at the earliest entry time and advance by `step_days`
/// while the test window still ends on or before the last entry time. A
/// trade belongs to a window when its `entry_time` falls in the half-open
/// interval. Windows with no trades are kept, so the window count depends
/// only on the config and the data span. Trades entering at or after the
/// last window's `test_end` are never tested; their count is flagged.
///
/// The aggregate OOS metric is computed once over the concatenated
/// test-window trades (deduplicated, time order); trades that training
/// windows also used are excluded according to `config.oos_purity`.
pub fn walk_forward(segment: &TradeSegment, config: &EvaluationConfig) -> WalkForwardResult {
    let trades = segment.trades();
    let (first, last) = match (segment.first_entry(), segment.last_entry()) {
        (Some(f), Some(l)) => (f, l),
        _ => return insufficient(config, "insufficient data: no trades".to_string()),
    };

    let (train, test, step) = match (
        Duration::try_days(config.train_days),
        Duration::try_days(config.test_days),
        Duration::try_days(config.step_days),
    ) {
        (Some(train), Some(test), Some(step)) => (train, test, step),
        _ => {
            return insufficient(
                config,
                "insufficient data: window lengths exceed the representable time range".to_string(),
            )
        }
    };
    let span = last - first;

    if train.checked_add(&test).map_or(true, |total| total > span) {
        let flag = format!(
            "insufficient data: span {:.1} days < train {} + test {} days",
            span.num_seconds() as f64 / 86_400.0,
            config.train_days,
            config.test_days
        );
        warn!("{flag}");
        return insufficient(config, flag);
    }

    // Index ranges into the sorted trade list, one pair per window.
    let mut bounds: Vec<(DateTime<Utc>, std::ops::Range<usize>, std::ops::Range<usize>)> = Vec::new();
    let mut start = first;
    while let Some((train_end, test_end)) = window_ends(start, train, test) {
        if test_end > last {
            break;
        }
        let train_range = slice_range(trades, start, train_end);
        let test_range = slice_range(trades, train_end, test_end);
        bounds.push((start, train_range, test_range));
        match start.checked_add_signed(step) {
            Some(next) => start = next,
            None => break,
        }
    }

    // Entries at or after the final test_end sit outside every half-open test window.
    let untested_tail = bounds
        .last()
        .map_or(0, |(_, _, test_range)| trades.len() - test_range.end);

    let mut windows = Vec::with_capacity(bounds.len());
    let mut trained: BTreeSet<usize> = BTreeSet::new();
    let mut tested: BTreeSet<usize> = BTreeSet::new();
    let mut sequential_leak: BTreeSet<usize> = BTreeSet::new();

    for (index, (start, train_range, test_range)) in bounds.iter().enumerate() {
        let (train_end, test_end) = match window_ends(*start, train, test) {
            Some(ends) => ends,
            None => break,
        };
        let train_trades = &trades[train_range.clone()];
        let test_trades = &trades[test_range.clone()];

        trained.extend(train_range.clone());
        for i in test_range.clone() {
            // Already seen by this or an earlier training window.
            if trained.contains(&i) {
                sequential_leak.insert(i);
            }
            tested.insert(i);
        }

        let in_sample = compute_metrics(train_trades, config);
        let out_of_sample = compute_metrics(test_trades, config);
        debug!(
            "Walk-forward window {}: {} train / {} test trades, IS Sharpe {:.3}, OOS Sharpe {:.3}",
            index,
            train_trades.len(),
            test_trades.len(),
            in_sample.sharpe_ratio,
            out_of_sample.sharpe_ratio
        );

        windows.push(WalkForwardWindow {
            index,
            train_start: *start,
            train_end,
            test_start: train_end,
            test_end,
            train_trade_ids: train_trades.iter().map(|t| t.id.clone()).collect(),
            test_trade_ids: test_trades.iter().map(|t| t.id.clone()).collect(),
            in_sample,
            out_of_sample,
        });
    }

    let oos_indices: Vec<usize> = tested
        .iter()
        .copied()
        .filter(|i| match config.oos_purity {
            OosPurity::Strict => !trained.contains(i),
            OosPurity::Sequential => !sequential_leak.contains(i),
        })
        .collect();
    let excluded_oos_trades = tested.len() - oos_indices.len();

    let oos_trades: Vec<Trade> = oos_indices.iter().map(|&i| trades[i].clone()).collect();
    let is_trades: Vec<Trade> = trained.iter().map(|&i| trades[i].clone()).collect();
    let aggregate_oos = compute_metrics(&oos_trades, config);
    let aggregate_in_sample = compute_metrics(&is_trades, config);

    let positive = windows
        .iter()
        .filter(|w| w.out_of_sample.sharpe_ratio > 0.0)
        .count();
    let oos_positive_window_ratio = if windows.is_empty() {
        0.0
    } else {
        positive as f64 / windows.len() as f64
    };

    let walk_forward_efficiency = if aggregate_in_sample.sharpe_ratio > 0.0 {
        Ratio::Finite(aggregate_oos.sharpe_ratio / aggregate_in_sample.sharpe_ratio)
    } else {
        Ratio::Undefined
    };

    let mut flags = Vec::new();
    let empty_tests = windows.iter().filter(|w| w.test_trade_ids.is_empty()).count();
    if empty_tests > 0 {
        flags.push(format!(
            "{} of {} test windows contained no trades",
            empty_tests,
            windows.len()
        ));
    }
    if excluded_oos_trades > 0 {
        flags.push(format!(
            "{} test-window trade(s) also used for training were excluded from aggregate OOS",
            excluded_oos_trades
        ));
    }
    if untested_tail > 0 {
        flags.push(format!(
            "{} trade(s) at or after the final test window end were not tested out-of-sample",
            untested_tail
        ));
    }
    if oos_trades.is_empty() {
        flags.push("aggregate OOS has no trades".to_string());
    }

    WalkForwardResult {
        windows,
        aggregate_in_sample,
        aggregate_oos,
        aggregate_oos_trade_ids: oos_trades.iter().map(|t| t.id.clone()).collect(),
        excluded_oos_trades,
        insufficient_data: false,
        oos_positive_window_ratio,
        walk_forward_efficiency,
        flags,
    }
}

fn window_ends(
    start: DateTime<Utc>,
    train: Duration,
    test: Duration,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let train_end = start.checked_add_signed(train)?;
    let test_end = train_end.checked_add_signed(test)?;
    Some((train_end, test_end))
}

fn slice_range(trades: &[Trade], start: DateTime<Utc>, end: DateTime<Utc>) -> std::ops::Range<usize> {
    let lo = trades.partition_point(|t| t.entry_time < start);
    let hi = trades.partition_point(|t| t.entry_time < end);
    lo..hi.max(lo)
}

fn insufficient(config: &EvaluationConfig, flag: String) -> WalkForwardResult {
    let empty = compute_metrics(&[], config);
    WalkForwardResult {
        windows: Vec::new(),
        aggregate_in_sample: empty.clone(),
        aggregate_oos: empty,
        aggregate_oos_trade_ids: Vec::new(),
        excluded_oos_trades: 0,
        insufficient_data: true,
        oos_positive_window_ratio: 0.0,
        walk_forward_efficiency: Ratio::Undefined,
        flags: vec![flag],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::parse_timestamp;
    use rust_decimal::Decimal;
    use std::collections::HashSet;

    fn daily_trades(days: i64) -> TradeSegment {
        let start = parse_timestamp("2024-01-01").unwrap();
        let trades = (0..days)
            .map(|d| {
                let entry = start + Duration::days(d);
                Trade {
                    id: format!("d{d}"),
                    entry_time: entry,
                    exit_time: entry + Duration::hours(4),
                    side: Side::Long,
                    gross_pnl: Decimal::new(if d % 4 == 0 { -8 } else { 5 }, 0),
                    notional: Decimal::new(1000, 0),
                    symbol: "QQQ".to_string(),
                    volatility: None,
                    friction_cost: Decimal::ZERO,
                    fill_ratio: 1.0,
                }
            })
            .collect();
        TradeSegment::new(trades).unwrap()
    }

    fn config(train: i64, test: i64, step: i64) -> EvaluationConfig {
        EvaluationConfig {
            train_days: train,
            test_days: test,
            step_days: step,
            ..Default::default()
        }
    }

    #[test]
    fn test_insufficient_span_yields_zero_windows() {
        // 26 daily trades span 25 days
        let result = walk_forward(&daily_trades(26), &config(30, 10, 10));
        assert!(result.windows.is_empty());
        assert!(result.insufficient_data);
        assert!(result.flags[0].contains("insufficient data"));
        assert_eq!(result.aggregate_oos.trade_count, 0);
    }

    #[test]
    fn test_window_count_is_predictable() {
        // Span 99 days; windows start at 0, 10, ... while start + 40 <= 99
        let result = walk_forward(&daily_trades(100), &config(30, 10, 10));
        assert!(!result.insufficient_data);
        assert_eq!(result.windows.len(), 6);
        for w in &result.windows {
            assert_eq!(w.train_trade_ids.len(), 30);
            assert_eq!(w.test_trade_ids.len(), 10);
        }
    }

    #[test]
    fn test_untested_tail_is_flagged() {
        // Last test window is [80, 90); days 90..=99 are never tested.
        let result = walk_forward(&daily_trades(100), &config(30, 10, 10));
        assert!(result
            .flags
            .iter()
            .any(|f| f.starts_with("10 trade(s) at or after the final test window end")));

        // Span 40 days: the single test window ends exactly on the last entry.
        let exact = walk_forward(&daily_trades(41), &config(30, 10, 10));
        assert_eq!(exact.windows.len(), 1);
        assert!(exact.flags.iter().any(|f| f.starts_with("1 trade(s) at or after")));
    }

    #[test]
    fn test_oversized_windows_do_not_panic() {
        let result = walk_forward(&daily_trades(30), &config(200_000_000_000, 10, 10));
        assert!(result.insufficient_data);
        assert!(result.windows.is_empty());

        let result = walk_forward(&daily_trades(30), &config(100_000_000_000, 100_000_000_000, 10));
        assert!(result.insufficient_data);
    }

    #[test]
    fn test_strict_oos_is_disjoint_from_all_training() {
        let result = walk_forward(&daily_trades(100), &config(30, 10, 10));
        let oos: HashSet<&String> = result.aggregate_oos_trade_ids.iter().collect();
        for w in &result.windows {
            for id in &w.train_trade_ids {
                assert!(!oos.contains(id), "trade {id} leaked into aggregate OOS");
            }
        }
        // Only the final test window is never reused for training.
        assert_eq!(result.aggregate_oos.trade_count, 10);
        assert_eq!(result.excluded_oos_trades, 50);
    }

    #[test]
    fn test_sequential_purity_keeps_each_test_window() {
        let mut cfg = config(30, 10, 10);
        cfg.oos_purity = OosPurity::Sequential;
        let result = walk_forward(&daily_trades(100), &cfg);
        // Test windows tile days 30..90 without gaps or overlap.
        assert_eq!(result.aggregate_oos.trade_count, 60);
        assert_eq!(result.excluded_oos_trades, 0);
        for (k, w) in result.windows.iter().enumerate() {
            let oos: HashSet<&String> = w.test_trade_ids.iter().collect();
            for earlier in &result.windows[..=k] {
                assert!(earlier.train_trade_ids.iter().all(|id| !oos.contains(id)));
            }
        }
    }

    #[test]
    fn test_non_overlapping_windows_keep_all_test_trades() {
        let result = walk_forward(&daily_trades(120), &config(20, 10, 30));
        assert_eq!(result.windows.len(), 3);
        assert_eq!(result.excluded_oos_trades, 0);
        assert_eq!(result.aggregate_oos.trade_count, 30);
        let ids = &result.aggregate_oos_trade_ids;
        assert_eq!(ids.first().map(String::as_str), Some("d20"));
    }

    #[test]
    fn test_empty_windows_are_reported() {
        let start = parse_timestamp("2024-01-01").unwrap();
        let mk = |id: &str, day: i64| Trade {
            id: id.to_string(),
            entry_time: start + Duration::days(day),
            exit_time: start + Duration::days(day),
            side: Side::Short,
            gross_pnl: Decimal::new(3, 0),
            notional: Decimal::new(500, 0),
            symbol: "IWM".to_string(),
            volatility: None,
            friction_cost: Decimal::ZERO,
            fill_ratio: 1.0,
        };
        let segment = TradeSegment::new(vec![mk("a", 0), mk("b", 1), mk("c", 60)]).unwrap();
        let result = walk_forward(&segment, &config(10, 10, 10));
        assert_eq!(result.windows.len(), 5);
        assert!(result.windows.iter().all(|w| w.test_trade_ids.is_empty()));
        assert!(result.flags.iter().any(|f| f.contains("contained no trades")));
        assert_eq!(result.windows[1].out_of_sample.trade_count, 0);
    }
}
