use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, RecordIssue, RecordProblem, ValidationError};
use crate::overfitting::DeflatedSharpeResult;

/// Cap applied to every Sharpe ratio so reports never carry infinities.
pub const SHARPE_SENTINEL: f64 = 100.0;

// --- Trades ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Accepts the spellings found in broker exports ("long", "BUY", "short", "sell").
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" | "l" => Some(Self::Long),
            "short" | "sell" | "s" => Some(Self::Short),
            _ => None,
        }
    }
}

/// A closed trade as handed over by the caller. Every field is optional so
/// that malformed rows can be reported instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTrade {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub entry_time: Option<String>,
    #[serde(default)]
    pub exit_time: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub notional: Option<Decimal>,
    #[serde(default)]
    pub gross_pnl: Option<Decimal>,
    #[serde(default)]
    pub symbol: Option<String>,
    /// Optional market volatility at trade time, used for regime bucketing.
    #[serde(default)]
    pub volatility: Option<f64>,
}

/// One closed round-trip. Never mutated; friction produces new trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub side: Side,
    pub gross_pnl: Decimal,
    pub notional: Decimal,
    pub symbol: String,
    pub volatility: Option<f64>,
    /// Total friction deducted from `gross_pnl` (zero for raw trades).
    pub friction_cost: Decimal,
    /// Fraction of the intended size that filled (1.0 for raw trades).
    pub fill_ratio: f64,
}

impl Trade {
    pub fn pnl_f64(&self) -> f64 {
        self.gross_pnl.to_f64().unwrap_or(0.0)
    }

    /// P&L as a fraction of notional.
    pub fn return_fraction(&self) -> f64 {
        let notional = self.notional.to_f64().unwrap_or(0.0);
        if notional > 0.0 {
            self.pnl_f64() / notional
        } else {
            0.0
        }
    }
}

/// Trades of one strategy sorted by `entry_time`, with unique ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSegment {
    trades: Vec<Trade>,
}

impl TradeSegment {
    /// Build a segment from already-typed trades, sorting them and rejecting
    /// duplicate ids or non-positive notionals.
    pub fn new(mut trades: Vec<Trade>) -> Result<Self, ValidationError> {
        let mut issues = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (index, trade) in trades.iter().enumerate() {
            if trade.notional <= Decimal::ZERO {
                issues.push(RecordIssue {
                    index,
                    id: Some(trade.id.clone()),
                    problem: RecordProblem::NonPositiveNotional,
                });
            }
            if trade.exit_time < trade.entry_time {
                issues.push(RecordIssue {
                    index,
                    id: Some(trade.id.clone()),
                    problem: RecordProblem::ExitBeforeEntry,
                });
            }
            if !seen.insert(trade.id.clone()) {
                issues.push(RecordIssue {
                    index,
                    id: Some(trade.id.clone()),
                    problem: RecordProblem::DuplicateId(trade.id.clone()),
                });
            }
        }
        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }
        sort_trades(&mut trades);
        Ok(Self { trades })
    }

    /// Wrap trades whose order and ids are already known to be valid, e.g.
    /// the output of friction on an existing segment.
    pub(crate) fn from_ordered(trades: Vec<Trade>) -> Self {
        debug_assert!(trades
            .windows(2)
            .all(|w| w[0].entry_time <= w[1].entry_time));
        Self { trades }
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn into_trades(self) -> Vec<Trade> {
        self.trades
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn first_entry(&self) -> Option<DateTime<Utc>> {
        self.trades.first().map(|t| t.entry_time)
    }

    pub fn last_entry(&self) -> Option<DateTime<Utc>> {
        self.trades.last().map(|t| t.entry_time)
    }
}

pub(crate) fn sort_trades(trades: &mut [Trade]) {
    trades.sort_by(|a, b| {
        a.entry_time
            .cmp(&b.entry_time)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Half-open `[start, end)` filter applied to trade entry times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }
}

/// Outcome of loading: an empty filter result is a reportable state, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "segment", rename_all = "snake_case")]
pub enum SegmentLoad {
    Loaded(TradeSegment),
    Empty,
}

impl SegmentLoad {
    pub fn into_segment(self) -> Option<TradeSegment> {
        match self {
            Self::Loaded(segment) => Some(segment),
            Self::Empty => None,
        }
    }
}

// --- Sentinel ratios ---

/// A ratio that may be unbounded or undefined, kept out of IEEE-754 special values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Ratio {
    Finite(f64),
    Infinite,
    Undefined,
}

impl Ratio {
    pub fn finite(&self) -> Option<f64> {
        match self {
            Self::Finite(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }
}

// --- Configuration ---

/// Upper bound for window lengths (about 27 000 years), far inside chrono's range.
pub const MAX_WINDOW_DAYS: i64 = 10_000_000;
const WINDOW_DAYS_RANGE: &str = "[1, 10000000] days";

/// Largest cost rate (as a fraction of notional) accepted by `FrictionConfig`.
pub const MAX_COST_RATE: f64 = 1e6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrictionConfig {
    /// Fraction of notional charged per round-trip (or per leg, see below).
    pub commission_rate: f64,
    pub spread_bps: f64,
    pub slippage_bps: f64,
    /// Probability that a trade only partially filled.
    pub partial_fill_rate: f64,
    pub partial_fill_ratio_min: f64,
    pub partial_fill_ratio_max: f64,
    /// Charge commission on entry and exit instead of once per round-trip.
    #[serde(default)]
    pub commission_per_leg: bool,
}

impl Default for FrictionConfig {
    fn default() -> Self {
        Self {
            commission_rate: 0.0,
            spread_bps: 0.0,
            slippage_bps: 0.0,
            partial_fill_rate: 0.0,
            partial_fill_ratio_min: 1.0,
            partial_fill_ratio_max: 1.0,
            commission_per_leg: false,
        }
    }
}

impl FrictionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, value) in [
            ("commission_rate", self.commission_rate),
            ("spread_bps", self.spread_bps),
            ("slippage_bps", self.slippage_bps),
        ] {
            require_finite(field, value)?;
            if value < 0.0 {
                return Err(ConfigurationError::Negative { field, value });
            }
        }
        // Costs are charged in Decimal; rates it cannot hold would silently become zero.
        for (field, value) in [
            ("commission_rate", self.commission_rate),
            ("spread_bps + slippage_bps", (self.spread_bps + self.slippage_bps) / 10_000.0),
        ] {
            if value > MAX_COST_RATE {
                return Err(ConfigurationError::OutOfRange {
                    field,
                    range: "[0, 1e6] as a fraction of notional",
                    value,
                });
            }
        }
        require_finite("partial_fill_rate", self.partial_fill_rate)?;
        if !(0.0..=1.0).contains(&self.partial_fill_rate) {
            return Err(ConfigurationError::OutOfRange {
                field: "partial_fill_rate",
                range: "[0, 1]",
                value: self.partial_fill_rate,
            });
        }
        for (field, value) in [
            ("partial_fill_ratio_min", self.partial_fill_ratio_min),
            ("partial_fill_ratio_max", self.partial_fill_ratio_max),
        ] {
            require_finite(field, value)?;
            if value <= 0.0 || value > 1.0 {
                return Err(ConfigurationError::OutOfRange {
                    field,
                    range: "(0, 1]",
                    value,
                });
            }
        }
        if self.partial_fill_ratio_min > self.partial_fill_ratio_max {
            return Err(ConfigurationError::FillRatioBounds {
                min: self.partial_fill_ratio_min,
                max: self.partial_fill_ratio_max,
            });
        }
        Ok(())
    }

    /// Same fill model with every cost multiplied by `multiplier`.
    pub fn scaled(&self, multiplier: f64) -> Self {
        Self {
            commission_rate: self.commission_rate * multiplier,
            spread_bps: self.spread_bps * multiplier,
            slippage_bps: self.slippage_bps * multiplier,
            ..self.clone()
        }
    }

    /// Costs only; partial fills disabled.
    pub fn without_partial_fills(&self) -> Self {
        Self {
            partial_fill_rate: 0.0,
            ..self.clone()
        }
    }
}

/// Statistic sampled by the Monte Carlo engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    #[default]
    TotalPnl,
    Sharpe,
}

/// Which test-window trades may feed the aggregate OOS metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OosPurity {
    /// Exclude any trade that appears in any training window, including the
    /// training windows of later folds.
    #[default]
    Strict,
    /// Exclude only trades seen by the same or an earlier training window.
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Annualized, as a fraction (0.02 = 2%).
    pub risk_free_rate: f64,
    pub train_days: i64,
    pub test_days: i64,
    pub step_days: i64,
    /// Maximum tolerated relative drop from in-sample to OOS Sharpe.
    pub oos_sharpe_drop_threshold: f64,
    pub monte_carlo_sims: usize,
    /// Trailing window, in trades, for rolling Sharpe and the volatility proxy.
    pub rolling_window: usize,
    /// Base equity the P&L curve is stacked on for drawdown percentages.
    pub initial_capital: Decimal,
    /// Run-level seed; `None` draws one from the process RNG.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_true")]
    pub monte_carlo_enabled: bool,
    #[serde(default)]
    pub statistic: Statistic,
    /// Annualization fallback when the trade span is shorter than a day.
    #[serde(default = "default_trading_days")]
    pub trading_days_per_year: f64,
    #[serde(default)]
    pub oos_purity: OosPurity,
}

fn default_true() -> bool {
    true
}

fn default_trading_days() -> f64 {
    252.0
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            train_days: 180,
            test_days: 60,
            step_days: 60,
            oos_sharpe_drop_threshold: 0.3,
            monte_carlo_sims: 1000,
            rolling_window: 20,
            initial_capital: Decimal::new(100_000, 0),
            seed: None,
            monte_carlo_enabled: true,
            statistic: Statistic::TotalPnl,
            trading_days_per_year: default_trading_days(),
            oos_purity: OosPurity::Strict,
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        require_finite("risk_free_rate", self.risk_free_rate)?;
        if self.risk_free_rate < 0.0 {
            return Err(ConfigurationError::Negative {
                field: "risk_free_rate",
                value: self.risk_free_rate,
            });
        }
        for (field, value) in [
            ("train_days", self.train_days),
            ("test_days", self.test_days),
            ("step_days", self.step_days),
        ] {
            if value <= 0 {
                return Err(ConfigurationError::NonPositive {
                    field,
                    value: value as f64,
                });
            }
            if value > MAX_WINDOW_DAYS {
                return Err(ConfigurationError::OutOfRange {
                    field,
                    range: WINDOW_DAYS_RANGE,
                    value: value as f64,
                });
            }
        }
        if self.train_days + self.test_days > MAX_WINDOW_DAYS {
            return Err(ConfigurationError::OutOfRange {
                field: "train_days + test_days",
                range: WINDOW_DAYS_RANGE,
                value: (self.train_days + self.test_days) as f64,
            });
        }
        require_finite("oos_sharpe_drop_threshold", self.oos_sharpe_drop_threshold)?;
        if self.oos_sharpe_drop_threshold <= 0.0 || self.oos_sharpe_drop_threshold > 1.0 {
            return Err(ConfigurationError::OutOfRange {
                field: "oos_sharpe_drop_threshold",
                range: "(0, 1]",
                value: self.oos_sharpe_drop_threshold,
            });
        }
        if self.monte_carlo_sims < 1 {
            return Err(ConfigurationError::NonPositive {
                field: "monte_carlo_sims",
                value: 0.0,
            });
        }
        if self.rolling_window < 1 {
            return Err(ConfigurationError::NonPositive {
                field: "rolling_window",
                value: 0.0,
            });
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(ConfigurationError::NonPositive {
                field: "initial_capital",
                value: self.initial_capital.to_f64().unwrap_or(0.0),
            });
        }
        require_finite("trading_days_per_year", self.trading_days_per_year)?;
        if self.trading_days_per_year <= 0.0 {
            return Err(ConfigurationError::NonPositive {
                field: "trading_days_per_year",
                value: self.trading_days_per_year,
            });
        }
        Ok(())
    }
}

fn require_finite(field: &'static str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigurationError::NotFinite { field })
    }
}

// --- Metrics ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityBucket {
    Low,
    Medium,
    High,
}

/// Headline metrics recomputed over one volatility regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketMetrics {
    pub bucket: VolatilityBucket,
    pub trade_count: usize,
    pub sharpe_ratio: f64,
    pub max_drawdown_percent: f64,
    pub profit_factor: Ratio,
    pub expectancy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsResult {
    pub trade_count: usize,
    pub total_pnl: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_percent: f64,
    pub profit_factor: Ratio,
    /// Average P&L per trade.
    pub expectancy: f64,
    pub win_rate: f64, // 0-100
    pub skewness: f64,
    pub excess_kurtosis: f64,
    pub periods_per_year: f64,
    pub rolling_sharpe: Vec<f64>,
    pub volatility_buckets: Vec<BucketMetrics>,
}

// --- Walk-forward ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardWindow {
    pub index: usize,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
    pub train_trade_ids: Vec<String>,
    pub test_trade_ids: Vec<String>,
    pub in_sample: MetricsResult,
    pub out_of_sample: MetricsResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub windows: Vec<WalkForwardWindow>,
    /// Metrics over the union of training-window trades.
    pub aggregate_in_sample: MetricsResult,
    /// Metrics over the concatenated test-window trades only.
    pub aggregate_oos: MetricsResult,
    pub aggregate_oos_trade_ids: Vec<String>,
    /// Test-window trades left out of the aggregate because training reused them.
    pub excluded_oos_trades: usize,
    pub insufficient_data: bool,
    /// Fraction of windows whose OOS Sharpe is positive.
    pub oos_positive_window_ratio: f64,
    /// Aggregate OOS Sharpe / aggregate in-sample Sharpe.
    pub walk_forward_efficiency: Ratio,
    pub flags: Vec<String>,
}

// --- Monte Carlo ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub statistic: String,
    pub simulations: usize,
    pub seed: u64,
    /// Statistic on the unreordered trades with deterministic costs only.
    pub point_estimate: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub percentile_5: f64,
    pub percentile_25: f64,
    pub percentile_50: f64,
    pub percentile_75: f64,
    pub percentile_95: f64,
    pub probability_of_profit: f64, // 0-100
    pub median_max_drawdown: f64,
    pub max_drawdown_95: f64,
    pub is_unstable: bool,
    /// Sorted statistic values, thinned to at most 200 points.
    pub distribution: Vec<f64>,
}

// --- Overfitting ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverfittingCheck {
    /// Relative Sharpe drop; `Undefined` when the in-sample edge is non-positive.
    pub sharpe_drop: Ratio,
    pub robustness_score: f64,
    pub passed: bool,
    pub flags: Vec<String>,
}

// --- Friction sensitivity ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSensitivityPoint {
    pub multiplier: f64,
    pub total_pnl: f64,
    pub sharpe_ratio: f64,
    pub expectancy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSensitivity {
    pub points: Vec<CostSensitivityPoint>,
    /// First swept multiplier at which total P&L is no longer positive.
    pub breakeven_multiplier: Option<f64>,
}

// --- Reports ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessReport {
    pub strategy: String,
    pub rank: Option<usize>,
    pub trade_count: usize,
    /// Friction-adjusted metrics over the whole history, test windows included.
    pub full_sample: MetricsResult,
    /// Aggregate over training-window trades; what the guard compares.
    pub in_sample: MetricsResult,
    pub aggregate_oos: MetricsResult,
    pub walk_forward: WalkForwardResult,
    pub monte_carlo: Option<MonteCarloResult>,
    pub overfitting: OverfittingCheck,
    pub cost_sensitivity: CostSensitivity,
    pub robustness_score: f64,
    pub passed: bool,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyFailure {
    pub strategy: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub ranking_criterion: String,
    pub entries: Vec<RobustnessReport>,
    pub failures: Vec<StrategyFailure>,
    /// Selection-bias adjustment of each ranked strategy's in-sample Sharpe,
    /// given how many strategies this comparison ranked.
    pub deflated_sharpe: BTreeMap<String, DeflatedSharpeResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "trades", rename_all = "snake_case")]
pub enum EvaluationInput {
    Single(Vec<RawTrade>),
    Strategies(BTreeMap<String, Vec<RawTrade>>),
    /// Per-strategy JSON trade arrays, parsed strategy by strategy so that
    /// one unparseable list only fails its own strategy.
    StrategiesJson(BTreeMap<String, serde_json::Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "report", rename_all = "snake_case")]
pub enum EvaluationReport {
    Single(RobustnessReport),
    Comparison(ComparisonReport),
}
