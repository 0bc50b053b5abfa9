use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::{RecordIssue, RecordProblem, ValidationError};
use crate::models::*;

/// Normalize raw records into a time-ordered segment.
///
/// Every malformed record is reported in a single `ValidationError`; nothing
/// is dropped silently. When `range` filters out every valid trade the
/// result is `SegmentLoad::Empty` rather than an error.
pub fn load_segment(
    raw: &[RawTrade],
    range: Option<TimeRange>,
) -> Result<SegmentLoad, ValidationError> {
    let mut issues: Vec<RecordIssue> = Vec::new();
    let mut trades: Vec<Trade> = Vec::with_capacity(raw.len());
    let mut seen_ids: HashSet<String> = HashSet::with_capacity(raw.len());

    for (index, record) in raw.iter().enumerate() {
        let before = issues.len();
        let mut problem = |p: RecordProblem| {
            issues.push(RecordIssue {
                index,
                id: record.id.clone(),
                problem: p,
            })
        };

        let entry_time = match record.entry_time.as_deref() {
            None => {
                problem(RecordProblem::MissingEntryTime);
                None
            }
            Some(s) => parse_timestamp(s).or_else(|| {
                problem(RecordProblem::UnparseableTimestamp(s.to_string()));
                None
            }),
        };
        let exit_time = match record.exit_time.as_deref() {
            None => {
                problem(RecordProblem::MissingExitTime);
                None
            }
            Some(s) => parse_timestamp(s).or_else(|| {
                problem(RecordProblem::UnparseableTimestamp(s.to_string()));
                None
            }),
        };
        if let (Some(entry), Some(exit)) = (entry_time, exit_time) {
            if exit < entry {
                problem(RecordProblem::ExitBeforeEntry);
            }
        }

        let side = match record.side.as_deref() {
            None => {
                problem(RecordProblem::MissingSide);
                None
            }
            Some(s) => Side::parse(s).or_else(|| {
                problem(RecordProblem::UnknownSide(s.to_string()));
                None
            }),
        };

        match record.notional {
            None => problem(RecordProblem::MissingNotional),
            Some(n) if n <= Decimal::ZERO => problem(RecordProblem::NonPositiveNotional),
            Some(_) => {}
        }
        if record.gross_pnl.is_none() {
            problem(RecordProblem::MissingPnl);
        }

        let symbol = record
            .symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if symbol.is_none() {
            problem(RecordProblem::MissingSymbol);
        }

        let id = record
            .id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}", symbol.unwrap_or("trade"), index));
        if !seen_ids.insert(id.clone()) {
            problem(RecordProblem::DuplicateId(id.clone()));
        }

        if issues.len() > before {
            continue;
        }

        // All required fields were checked above.
        if let (Some(entry_time), Some(exit_time), Some(side), Some(notional), Some(gross_pnl), Some(symbol)) = (
            entry_time,
            exit_time,
            side,
            record.notional,
            record.gross_pnl,
            symbol,
        ) {
            trades.push(Trade {
                id,
                entry_time,
                exit_time,
                side,
                gross_pnl,
                notional,
                symbol: symbol.to_string(),
                volatility: record.volatility.filter(|v| v.is_finite() && *v >= 0.0),
                friction_cost: Decimal::ZERO,
                fill_ratio: 1.0,
            });
        }
    }

    if !issues.is_empty() {
        warn!("Rejected trade input: {} malformed record(s)", issues.len());
        return Err(ValidationError { issues });
    }

    let total = trades.len();
    if let Some(range) = range {
        trades.retain(|t| range.contains(t.entry_time));
        debug!("Time filter kept {} of {} trades", trades.len(), total);
    }

    if trades.is_empty() {
        warn!("Trade segment is empty after loading");
        return Ok(SegmentLoad::Empty);
    }

    sort_trades(&mut trades);
    Ok(SegmentLoad::Loaded(TradeSegment::from_ordered(trades)))
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse a JSON array of trade objects. Rows that do not fit the record
/// shape are reported individually.
pub fn parse_json_trades(json: &str) -> Result<Vec<RawTrade>, ValidationError> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| ValidationError {
        issues: vec![RecordIssue {
            index: 0,
            id: None,
            problem: RecordProblem::Unparseable(e.to_string()),
        }],
    })?;
    raw_trades_from_json(value)
}

/// Same as [`parse_json_trades`] for an already-decoded JSON value.
pub fn raw_trades_from_json(value: serde_json::Value) -> Result<Vec<RawTrade>, ValidationError> {
    let values = match value {
        serde_json::Value::Array(values) => values,
        other => {
            return Err(ValidationError {
                issues: vec![RecordIssue {
                    index: 0,
                    id: None,
                    problem: RecordProblem::Unparseable(format!(
                        "expected an array of trades, found {}",
                        json_kind(&other)
                    )),
                }],
            })
        }
    };

    let mut issues = Vec::new();
    let mut rows = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        let id = value.get("id").and_then(|v| v.as_str()).map(str::to_string);
        match serde_json::from_value::<RawTrade>(value) {
            Ok(row) => rows.push(row),
            Err(e) => issues.push(RecordIssue {
                index,
                id,
                problem: RecordProblem::Unparseable(e.to_string()),
            }),
        }
    }

    if issues.is_empty() {
        Ok(rows)
    } else {
        Err(ValidationError { issues })
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Parse CSV with a header row naming the record fields
/// (`id,entry_time,exit_time,side,notional,gross_pnl,symbol,volatility`).
pub fn parse_csv_trades(csv_data: &str) -> Result<Vec<RawTrade>, ValidationError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let mut issues = Vec::new();
    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<RawTrade>().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => issues.push(RecordIssue {
                index,
                id: None,
                problem: RecordProblem::Unparseable(e.to_string()),
            }),
        }
    }

    if issues.is_empty() {
        Ok(rows)
    } else {
        Err(ValidationError { issues })
    }
}
