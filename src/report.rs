//! Rendering for the maintenance tools: per-function summaries and tool
//! calls extracted from stored transcripts.

use crate::scorer::ProblemSet;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const SEPARATOR_WIDTH: usize = 85;
const UNKNOWN_FUNCTION: &str = "Unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSummary {
    pub function_name: String,
    pub success: i64,
    pub failure: i64,
}

impl FunctionSummary {
    pub fn total(&self) -> i64 {
        self.success + self.failure
    }

    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.success as f64 / self.total() as f64 * 100.0
        }
    }
}

/// Fold `(function_name, result, count)` rows into one summary per function.
/// Anything other than `"true"` counts as a failure.
pub fn summarize_rows(
    rows: impl IntoIterator<Item = (Option<String>, String, i64)>,
    sort_by_rate: bool,
) -> Vec<FunctionSummary> {
    let mut by_name: BTreeMap<String, FunctionSummary> = BTreeMap::new();
    for (name, result, count) in rows {
        let name = name.unwrap_or_else(|| UNKNOWN_FUNCTION.to_string());
        let entry = by_name.entry(name.clone()).or_insert(FunctionSummary {
            function_name: name,
            success: 0,
            failure: 0,
        });
        if result == "true" {
            entry.success += count;
        } else {
            entry.failure += count;
        }
    }

    let mut summaries: Vec<FunctionSummary> = by_name.into_values().collect();
    if sort_by_rate {
        summaries.sort_by(|a, b| {
            b.success_rate()
                .partial_cmp(&a.success_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.function_name.cmp(&b.function_name))
        });
    }
    summaries
}

/// `pass@k` when every function was attempted the same number of times.
pub fn uniform_pass_at_k(summaries: &[FunctionSummary]) -> Option<(i64, f64)> {
    let k = summaries.first()?.total();
    if k <= 1 || summaries.iter().any(|s| s.total() != k) {
        return None;
    }
    let passed = summaries.iter().filter(|s| s.success > 0).count();
    Some((k, passed as f64 / summaries.len() as f64 * 100.0))
}

fn table_row(name: &str, success: &str, failure: &str, total: &str, rate: &str) -> String {
    format!(
        "{:<40} {:>10} {:>10} {:>10} {:>10}",
        name, success, failure, total, rate
    )
}

pub fn render_table(summaries: &[FunctionSummary]) -> String {
    let separator = "-".repeat(SEPARATOR_WIDTH);
    let mut lines = vec![
        table_row("Function Name", "Success", "Failure", "Total", "Success Rate"),
        separator.clone(),
    ];

    let mut total = FunctionSummary {
        function_name: "TOTAL".to_string(),
        success: 0,
        failure: 0,
    };
    for s in summaries {
        total.success += s.success;
        total.failure += s.failure;
        lines.push(summary_row(s));
    }
    lines.push(separator);
    lines.push(summary_row(&total));
    lines.push(String::new());
    lines.push(format!("Over-all score: {:.0}%", total.success_rate()));
    if let Some((k, rate)) = uniform_pass_at_k(summaries) {
        lines.push(format!("pass@{}: {:.0}%", k, rate));
    }
    lines.join("\n")
}

fn summary_row(s: &FunctionSummary) -> String {
    table_row(
        &s.function_name,
        &s.success.to_string(),
        &s.failure.to_string(),
        &s.total().to_string(),
        &format!("{:>9.0}%", s.success_rate()),
    )
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn render_csv(summaries: &[FunctionSummary]) -> String {
    let mut lines = vec!["function_name,success,failure,total,success_rate".to_string()];
    for s in summaries {
        lines.push(format!(
            "{},{},{},{},{:.2}",
            csv_field(&s.function_name),
            s.success,
            s.failure,
            s.total(),
            s.success_rate()
        ));
    }
    lines.join("\n")
}

fn calling_tool_marker() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(r"\n\s*### SYSTEM: calling tool\n").ok())
        .as_ref()
}

fn blank_line() -> Option<&'static Regex> {
    static BLANK: OnceLock<Option<Regex>> = OnceLock::new();
    BLANK.get_or_init(|| Regex::new(r"\n\s*\n").ok()).as_ref()
}

/// Tool-call lines from a stored transcript, one group per model turn.
pub fn extract_tool_calls(log: &str) -> Vec<Vec<String>> {
    let (Some(marker), Some(blank)) = (calling_tool_marker(), blank_line()) else {
        return Vec::new();
    };
    marker
        .split(log)
        .skip(1)
        .map(|block| {
            let end = blank.find(block).map_or(block.len(), |m| m.start());
            block[..end]
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|calls| !calls.is_empty())
        .collect()
}

pub fn render_tool_calls(attempt_id: &str, function_name: Option<&str>, log: &str) -> String {
    let mut out = format!(
        "=== Log for attempt '{}' (function: {}) ===\n",
        attempt_id,
        function_name.unwrap_or(UNKNOWN_FUNCTION)
    );
    for group in extract_tool_calls(log) {
        out.push('\n');
        out.push_str(&group.join("\n"));
        out.push('\n');
    }
    out
}

pub fn render_problem_sets(sets: &BTreeMap<String, Vec<ProblemSet>>) -> String {
    let mut lines = vec![
        "Available problem sets:".to_string(),
        "======================".to_string(),
    ];
    for (category, sets) in sets {
        lines.push(format!("\n{}:", category));
        for set in sets {
            lines.push(format!("  - {} :: {}", set.name, set.id));
        }
    }
    lines.join("\n")
}
