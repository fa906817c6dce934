use super::{
    major_version, AttemptResult, FailedRun, FailureInfo, NewRun, PassAtK, RunResult, RunStore,
};
use crate::bench::AttemptReport;
use crate::scorer::ProblemName;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashSet;
use uuid::Uuid;

/// One row of the per-function summary: `(function_name, result, count)`.
pub type SummaryRow = (Option<String>, String, i64);

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("'{}' is not a UUID", id))
}

impl PgStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("Failed to connect to the results database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to apply database migrations")?;
        Ok(Self { pool })
    }

    /// Append `label` to a run. `false` when the run doesn't exist.
    pub async fn add_label(&self, run_id: &str, label: &str) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE runs SET labels = array_append(COALESCE(labels, '{}'), $2) WHERE id = $1",
        )
        .bind(parse_id(run_id)?)
        .bind(label)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn run_exists(&self, run_id: &str) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM runs WHERE id = $1")
            .bind(parse_id(run_id)?)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Runs carrying any of `labels`.
    pub async fn run_ids_by_labels(&self, labels: &[String]) -> Result<Vec<String>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM runs WHERE labels && $1 ORDER BY datetime_start")
                .bind(labels)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id.to_string()).collect())
    }

    pub async fn attempt_summary(&self, run_ids: &[String]) -> Result<Vec<SummaryRow>> {
        let ids = run_ids
            .iter()
            .map(|id| parse_id(id))
            .collect::<Result<Vec<_>>>()?;
        let rows: Vec<SummaryRow> = sqlx::query_as(
            "SELECT function_name, result, COUNT(id) FROM attempts
             WHERE run_id = ANY($1)
             GROUP BY function_name, result
             ORDER BY function_name",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// `(complete_log, function_name)` of an attempt.
    pub async fn attempt_log(
        &self,
        attempt_id: &str,
    ) -> Result<Option<(Option<String>, Option<String>)>> {
        let row = sqlx::query_as("SELECT complete_log, function_name FROM attempts WHERE id = $1")
            .bind(parse_id(attempt_id)?)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn create_run(&self, run: &NewRun) -> Result<()> {
        let labels = (!run.labels.is_empty()).then(|| run.labels.clone());
        sqlx::query(
            "INSERT INTO runs (id, model_identifier, benchmark_version, config, datetime_start, labels)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(parse_id(&run.run_id)?)
        .bind(&run.model_identifier)
        .bind(major_version(&run.benchmark_version))
        .bind(&run.config)
        .bind(chrono::Local::now().naive_local())
        .bind(labels)
        .execute(&self.pool)
        .await
        .context("Failed to create run")?;
        Ok(())
    }

    async fn add_attempt(&self, run_id: &str, report: &AttemptReport) -> Result<()> {
        sqlx::query(
            "INSERT INTO attempts (id, run_id, result, time_taken, tool_calls, complete_log, api_calls)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(parse_id(&report.attempt_id)?)
        .bind(parse_id(run_id)?)
        .bind(AttemptResult::from_passed(report.passed).as_str())
        .bind(report.time_taken)
        .bind(report.tool_calls as i32)
        .bind(&report.complete_log)
        .bind(report.api_calls as i64)
        .execute(&self.pool)
        .await
        .context("Failed to record attempt")?;
        Ok(())
    }

    async fn fail_attempt(&self, run_id: &str, attempt_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO attempts (id, run_id, result) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(parse_id(attempt_id)?)
        .bind(parse_id(run_id)?)
        .bind(AttemptResult::Error.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to record skipped attempt")?;
        Ok(())
    }

    async fn save_run_result(&self, run_id: &str, result: &RunResult) -> Result<()> {
        let score = serde_json::to_value(result.score)?;
        sqlx::query(
            "UPDATE runs SET total_run_time = $2, final_score = $3, score_percent = $4, total_api_calls = $5
             WHERE id = $1",
        )
        .bind(parse_id(run_id)?)
        .bind(result.total_run_time)
        .bind(score)
        .bind(result.percent)
        .bind(result.total_api_calls)
        .execute(&self.pool)
        .await
        .context("Failed to save run result")?;
        Ok(())
    }

    async fn save_run_failure(&self, run_id: &str, info: &FailureInfo) -> Result<()> {
        let info = serde_json::to_value(info)?;
        sqlx::query("UPDATE runs SET failure_info = $2 WHERE id = $1")
            .bind(parse_id(run_id)?)
            .bind(info)
            .execute(&self.pool)
            .await
            .context("Failed to save run failure")?;
        Ok(())
    }

    async fn get_failed_run(&self, run_id: &str) -> Result<Option<FailedRun>> {
        let row: Option<(Value, String, Value)> = sqlx::query_as(
            "SELECT failure_info, benchmark_version, config FROM runs
             WHERE id = $1 AND failure_info IS NOT NULL",
        )
        .bind(parse_id(run_id)?)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(failure_info, benchmark_version, config)| {
            Ok(FailedRun {
                failure_info: serde_json::from_value(failure_info)
                    .context("Stored failure info is not readable")?,
                benchmark_version,
                config,
            })
        })
        .transpose()
    }

    async fn get_completed_attempts(&self, run_id: &str) -> Result<HashSet<String>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM attempts WHERE run_id = $1")
            .bind(parse_id(run_id)?)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id.to_string()).collect())
    }

    async fn add_problem_names(&self, names: &[ProblemName]) -> Result<()> {
        for name in names {
            sqlx::query("UPDATE attempts SET function_name = $1 WHERE id = $2")
                .bind(&name.function_name)
                .bind(parse_id(&name.id)?)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn calculate_pass_at_k(&self, run_id: &str) -> Result<PassAtK> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT function_name, result FROM attempts
             WHERE run_id = $1 AND function_name IS NOT NULL",
        )
        .bind(parse_id(run_id)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(PassAtK::from_results(
            rows.iter().map(|(f, r)| (f.as_str(), r.as_str())),
        ))
    }
}
