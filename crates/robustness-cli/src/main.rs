use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use robustness_engine::{
    parse_csv_trades, parse_json_trades, run_evaluation, EvaluationInput, EvaluationReport,
};

mod config;

use config::CliConfig;

fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    // 2. Configuration
    let config = CliConfig::from_env(std::env::args().nth(1))?;
    tracing::info!("Evaluating trades from {}", config.trades_path.display());
    tracing::info!(
        "  Windows: train {}d / test {}d / step {}d",
        config.evaluation.train_days,
        config.evaluation.test_days,
        config.evaluation.step_days
    );
    tracing::info!(
        "  Drop threshold: {:.0}%, Monte Carlo sims: {}",
        config.evaluation.oos_sharpe_drop_threshold * 100.0,
        config.evaluation.monte_carlo_sims
    );

    // 3. Load and evaluate
    let input = read_input(&config.trades_path)?;
    let report = run_evaluation(input, &config.evaluation, &config.friction)
        .context("evaluation failed")?;

    match &report {
        EvaluationReport::Single(r) => tracing::info!(
            "Score {:.1}, {}",
            r.robustness_score,
            if r.passed { "PASS" } else { "FAIL" }
        ),
        EvaluationReport::Comparison(c) => tracing::info!(
            "Ranked {} strategies, {} failed to load",
            c.entries.len(),
            c.failures.len()
        ),
    }

    // 4. Report on stdout
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// A `.csv` file is one strategy. A JSON array is one strategy; a JSON
/// object maps strategy names to trade arrays, and a strategy whose array
/// does not parse is reported as a failure next to the others.
fn read_input(path: &Path) -> Result<EvaluationInput> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if is_csv {
        let raw = parse_csv_trades(&contents).context("failed to parse CSV trades")?;
        return Ok(EvaluationInput::Single(raw));
    }

    let value: serde_json::Value =
        serde_json::from_str(&contents).context("trade file is not valid JSON")?;
    match value {
        serde_json::Value::Array(_) => {
            let raw = parse_json_trades(&contents).context("failed to parse JSON trades")?;
            Ok(EvaluationInput::Single(raw))
        }
        // Each strategy is parsed by the engine so a bad list only fails itself.
        serde_json::Value::Object(strategies) => Ok(EvaluationInput::StrategiesJson(
            strategies.into_iter().collect::<BTreeMap<_, _>>(),
        )),
        _ => bail!("expected a JSON array of trades or an object of strategy -> trades"),
    }
}
