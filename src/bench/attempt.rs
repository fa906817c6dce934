use super::decide::decide;
use super::executor::format_call_history;
use super::investigate::{investigate, InvestigationOutcome, InvestigationTarget};
use super::prompts::initial_messages;
use super::verify::{verify, VerificationTarget};
use super::HarnessError;
use crate::config::RunMode;
use crate::llm::RateLimitedModel;
use crate::printer::Printer;
use crate::scorer::{Attempt, Scorer};
use anyhow::Result;
use std::time::Instant;

/// What an attempt needs besides the attempt itself.
#[derive(Clone, Copy)]
pub struct AttemptEnv<'a> {
    /// The model under test.
    pub model: &'a RateLimitedModel,
    /// Fixed model for the decision and verification phases of a
    /// three-phase run. Defaults to `model`.
    pub judge: Option<&'a RateLimitedModel>,
    pub scorer: &'a dyn Scorer,
    pub mode: RunMode,
}

impl AttemptEnv<'_> {
    /// Model calls made so far across both models.
    pub fn total_calls(&self) -> u64 {
        self.model.total_calls() + self.judge.map_or(0, RateLimitedModel::total_calls)
    }
}

/// A finished attempt, ready to record.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub attempt_id: String,
    pub passed: bool,
    pub time_taken: f64,
    pub tool_calls: u32,
    pub api_calls: u64,
    pub complete_log: String,
}

fn spec_display(attempt: &Attempt) -> String {
    let tags: Vec<&str> = attempt.arg_spec.iter().map(|t| t.as_str()).collect();
    format!("[{}]", tags.join(", "))
}

/// Investigate, optionally decide, then verify one attempt.
///
/// An investigation overrun is returned as `HarnessError::InvestigationOverrun`.
pub async fn run_attempt(
    env: &AttemptEnv<'_>,
    attempt: &Attempt,
    mut printer: Printer,
) -> Result<AttemptReport> {
    let started = Instant::now();
    let calls_before = env.total_calls();
    let spec = spec_display(attempt);

    printer.print(format!("\n### SYSTEM: interrogating function with args {}", spec));

    let mut messages = initial_messages(attempt.test_limit);
    let outcome = investigate(
        env.model,
        env.scorer,
        InvestigationTarget {
            attempt_id: &attempt.attempt_id,
            arg_spec: &attempt.arg_spec,
            output_type: attempt.output_type,
            test_limit: attempt.test_limit,
        },
        &mut messages,
        &mut printer,
    )
    .await?;

    let (call_history, tool_calls) = match outcome {
        InvestigationOutcome::Completed {
            call_history,
            tool_calls,
        } => (call_history, tool_calls),
        InvestigationOutcome::Overrun { turns } => {
            return Err(HarnessError::InvestigationOverrun { turns }.into());
        }
    };

    let passed = match env.mode {
        RunMode::TwoPhase => {
            printer.print(format!("\n### SYSTEM: verifying function with args {}", spec));
            verify(
                env.model,
                env.scorer,
                VerificationTarget {
                    attempt_id: &attempt.attempt_id,
                    arg_spec: &attempt.arg_spec,
                    tool_withdrawn: true,
                },
                &messages,
                &mut printer,
            )
            .await?
        }
        RunMode::ThreePhase => {
            let judge = env.judge.unwrap_or(env.model);
            let evidence = format_call_history(&call_history, &attempt.arg_spec, attempt.output_type);

            printer.print(format!(
                "\n### SYSTEM: making decision based on tool calls {}",
                spec
            ));
            printer.print(&evidence);
            let decision = decide(judge, &evidence, &mut printer).await?;

            printer.print(format!("\n### SYSTEM: verifying function with args {}", spec));
            verify(
                judge,
                env.scorer,
                VerificationTarget {
                    attempt_id: &attempt.attempt_id,
                    arg_spec: &attempt.arg_spec,
                    tool_withdrawn: false,
                },
                &decision,
                &mut printer,
            )
            .await?
        }
    };

    Ok(AttemptReport {
        attempt_id: attempt.attempt_id.clone(),
        passed,
        time_taken: started.elapsed().as_secs_f64(),
        tool_calls,
        api_calls: env.total_calls().saturating_sub(calls_before),
        complete_log: printer.into_transcript(),
    })
}
