use anyhow::{Context, Result};
use robustness_engine::{EvaluationConfig, FrictionConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Settings for one manual evaluation run, read from the environment.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub trades_path: PathBuf,
    pub evaluation: EvaluationConfig,
    pub friction: FrictionConfig,
}

impl CliConfig {
    /// `path_arg` (the first positional argument) wins over `EVAL_TRADES_PATH`.
    pub fn from_env(path_arg: Option<String>) -> Result<Self> {
        let defaults = EvaluationConfig::default();
        let friction_defaults = FrictionConfig::default();

        let trades_path = match path_arg {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(
                env::var("EVAL_TRADES_PATH")
                    .context("no trade file given: pass a path or set EVAL_TRADES_PATH")?,
            ),
        };

        let seed = match env::var("EVAL_SEED") {
            Ok(raw) => Some(raw.trim().parse().context("EVAL_SEED must be an unsigned integer")?),
            Err(_) => defaults.seed,
        };

        let evaluation = EvaluationConfig {
            risk_free_rate: env_or("EVAL_RISK_FREE_RATE", defaults.risk_free_rate)?,
            train_days: env_or("EVAL_TRAIN_DAYS", defaults.train_days)?,
            test_days: env_or("EVAL_TEST_DAYS", defaults.test_days)?,
            step_days: env_or("EVAL_STEP_DAYS", defaults.step_days)?,
            oos_sharpe_drop_threshold: env_or("EVAL_DROP_THRESHOLD", defaults.oos_sharpe_drop_threshold)?,
            monte_carlo_sims: env_or("EVAL_MC_SIMS", defaults.monte_carlo_sims)?,
            rolling_window: env_or("EVAL_ROLLING_WINDOW", defaults.rolling_window)?,
            seed,
            ..defaults
        };

        let friction = FrictionConfig {
            commission_rate: env_or("EVAL_COMMISSION_RATE", friction_defaults.commission_rate)?,
            spread_bps: env_or("EVAL_SPREAD_BPS", friction_defaults.spread_bps)?,
            slippage_bps: env_or("EVAL_SLIPPAGE_BPS", friction_defaults.slippage_bps)?,
            partial_fill_rate: env_or("EVAL_PARTIAL_FILL_RATE", friction_defaults.partial_fill_rate)?,
            ..friction_defaults
        };

        evaluation.validate().context("invalid evaluation settings")?;
        friction.validate().context("invalid friction settings")?;

        Ok(Self {
            trades_path,
            evaluation,
            friction,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}
