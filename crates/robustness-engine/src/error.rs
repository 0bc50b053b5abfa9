use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What is wrong with a single raw trade record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RecordProblem {
    MissingEntryTime,
    MissingExitTime,
    UnparseableTimestamp(String),
    ExitBeforeEntry,
    MissingNotional,
    NonPositiveNotional,
    MissingSide,
    UnknownSide(String),
    MissingPnl,
    MissingSymbol,
    DuplicateId(String),
    Unparseable(String),
}

impl fmt::Display for RecordProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingEntryTime => write!(f, "missing entry_time"),
            Self::MissingExitTime => write!(f, "missing exit_time"),
            Self::UnparseableTimestamp(raw) => write!(f, "unparseable timestamp '{raw}'"),
            Self::ExitBeforeEntry => write!(f, "exit_time is before entry_time"),
            Self::MissingNotional => write!(f, "missing notional"),
            Self::NonPositiveNotional => write!(f, "notional must be > 0"),
            Self::MissingSide => write!(f, "missing side"),
            Self::UnknownSide(raw) => write!(f, "unknown side '{raw}'"),
            Self::MissingPnl => write!(f, "missing gross_pnl"),
            Self::MissingSymbol => write!(f, "missing symbol"),
            Self::DuplicateId(id) => write!(f, "duplicate trade id '{id}'"),
            Self::Unparseable(msg) => write!(f, "unparseable record: {msg}"),
        }
    }
}

/// One offending record, located by its position in the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIssue {
    pub index: usize,
    pub id: Option<String>,
    pub problem: RecordProblem,
}

impl fmt::Display for RecordIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "record #{} ({id}): {}", self.index, self.problem),
            None => write!(f, "record #{}: {}", self.index, self.problem),
        }
    }
}

/// Malformed or insufficient input data. Always lists every bad record.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{} malformed trade record(s): {}", .issues.len(), render_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<RecordIssue>,
}

fn render_issues(issues: &[RecordIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("{field} must be >= 0, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be > 0, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("{field} must be within {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f64,
    },

    #[error("{field} is not a finite number")]
    NotFinite { field: &'static str },

    #[error("partial_fill_ratio_min ({min}) exceeds partial_fill_ratio_max ({max})")]
    FillRatioBounds { min: f64, max: f64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Malformed input: {0}")]
    MalformedInput(String),
}

pub type EvaluationResult<T> = Result<T, EvaluationError>;
