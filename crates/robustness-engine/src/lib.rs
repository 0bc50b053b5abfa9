pub mod error;
pub mod models;
pub mod seeding;
pub mod loader;
pub mod metrics;
pub mod friction;
pub mod walk_forward;
pub mod monte_carlo;
pub mod overfitting;
pub mod comparison;


pub use error::{ConfigurationError, EvaluationError, EvaluationResult, RecordIssue, RecordProblem, ValidationError};
pub use models::*;
pub use loader::{load_segment, parse_csv_trades, parse_json_trades, raw_trades_from_json};
pub use metrics::compute_metrics;
pub use friction::{apply_friction, cost_sensitivity};
pub use walk_forward::walk_forward;
pub use monte_carlo::{monte_carlo, monte_carlo_with};
pub use overfitting::{
    check_overfitting, check_walk_forward, deflate_comparison, deflated_sharpe_ratio, DeflatedSharpeResult,
};
pub use comparison::{compare_strategies, evaluate_strategy, run_evaluation};
