//! Results database.
//!
//! `RunStore` is what the run controller writes through. Every write is its
//! own statement and commits on its own, so a crash loses at most the
//! attempt in flight.

pub mod postgres;

use crate::bench::AttemptReport;
use crate::scorer::{Attempt, ProblemName, Score};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

pub use postgres::PgStore;

/// Value of `attempts.result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Passed,
    Failed,
    /// Skipped after the run crashed on it.
    Error,
}

impl AttemptResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptResult::Passed => "true",
            AttemptResult::Failed => "false",
            AttemptResult::Error => "error",
        }
    }

    pub fn from_passed(passed: bool) -> Self {
        if passed {
            AttemptResult::Passed
        } else {
            AttemptResult::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub run_id: String,
    pub model_identifier: String,
    /// Full version from the server; only the major part is stored.
    pub benchmark_version: String,
    pub config: Value,
    pub labels: Vec<String>,
}

/// Major component of a dotted version string.
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Written to `runs.failure_info` when a run dies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_type: String,
    pub error_message: String,
    pub traceback: String,
    pub current_attempt: Option<Attempt>,
    #[serde(default)]
    pub all_attempts: Vec<Attempt>,
    pub failure_datetime: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedRun {
    pub failure_info: FailureInfo,
    pub benchmark_version: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub score: Score,
    pub percent: f64,
    pub total_run_time: f64,
    pub total_api_calls: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassAtK {
    pub pass_at_k: f64,
    /// Most attempts any one problem had.
    pub k: i64,
    pub problems_passed: i64,
    pub total_problems: i64,
}

impl PassAtK {
    /// From `(function_name, result)` rows of one run.
    pub fn from_results<'a>(rows: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut per_problem: std::collections::BTreeMap<&str, (i64, bool)> = Default::default();
        for (function_name, result) in rows {
            let entry = per_problem.entry(function_name).or_insert((0, false));
            entry.0 += 1;
            entry.1 |= result.eq_ignore_ascii_case("true");
        }
        let k = per_problem.values().map(|(n, _)| *n).max().unwrap_or(0);
        let total_problems = per_problem.len() as i64;
        let problems_passed = per_problem.values().filter(|(_, passed)| *passed).count() as i64;
        let pass_at_k = if total_problems > 0 {
            problems_passed as f64 / total_problems as f64
        } else {
            0.0
        };
        PassAtK {
            pass_at_k,
            k,
            problems_passed,
            total_problems,
        }
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &NewRun) -> Result<()>;

    async fn add_attempt(&self, run_id: &str, report: &AttemptReport) -> Result<()>;

    /// Record an attempt that was skipped after a crash.
    async fn fail_attempt(&self, run_id: &str, attempt_id: &str) -> Result<()>;

    async fn save_run_result(&self, run_id: &str, result: &RunResult) -> Result<()>;

    async fn save_run_failure(&self, run_id: &str, info: &FailureInfo) -> Result<()>;

    /// The run's failure info, if it has any.
    async fn get_failed_run(&self, run_id: &str) -> Result<Option<FailedRun>>;

    /// Ids of attempts already recorded for the run.
    async fn get_completed_attempts(&self, run_id: &str) -> Result<HashSet<String>>;

    async fn add_problem_names(&self, names: &[ProblemName]) -> Result<()>;

    async fn calculate_pass_at_k(&self, run_id: &str) -> Result<PassAtK>;
}
