//! Whole-attempt scenarios against a scripted model, a fake scorer and an
//! in-memory results store.

use super::normalize::TypeTag;
use super::{run_attempt, AttemptEnv, HarnessError};
use crate::config::{ModelSettings, ModelTarget, Provider, RunConfig, RunMode};
use crate::llm::{
    Completion, CompletionRequest, Message, ModelAdapter, ProviderError, RateLimitedModel,
    RetryPolicy, ToolArguments, ToolCall,
};
use crate::printer::Printer;
use crate::run::{complete_run, process_attempts, resume_failed_run, ResumeMode, RunContext};
use crate::scorer::{
    Attempt, FunctionOutput, ProblemName, RunCompletion, Score, Scorer, ScorerError,
    ScorerResult, VerificationCase, VerificationStatus,
};
use crate::store::{FailedRun, FailureInfo, NewRun, PassAtK, RunResult, RunStore};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

// ---------------------------------------------------------------------------
// Scripted model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SeenRequest {
    had_tools: bool,
    messages: Vec<Message>,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<Completion, ProviderError>>,
    /// Served once `replies` runs out.
    fallback: Option<Completion>,
    seen: Vec<SeenRequest>,
}

#[derive(Clone, Default)]
struct ScriptedModel {
    script: Arc<Mutex<Script>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<Completion, ProviderError>>) -> Self {
        let model = Self::default();
        model.script.lock().unwrap().replies = replies.into();
        model
    }

    fn with_fallback(self, fallback: Completion) -> Self {
        self.script.lock().unwrap().fallback = Some(fallback);
        self
    }

    fn seen(&self) -> Vec<SeenRequest> {
        self.script.lock().unwrap().seen.clone()
    }

    fn limited(&self) -> RateLimitedModel {
        RateLimitedModel::new(Box::new(self.clone()), 0.0, RetryPolicy::none())
    }
}

#[async_trait]
impl ModelAdapter for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let mut script = self.script.lock().unwrap();
        script.seen.push(SeenRequest {
            had_tools: request.tools.is_some(),
            messages: request.messages.to_vec(),
        });
        match script.replies.pop_front() {
            Some(reply) => reply,
            None => script.fallback.clone().ok_or(ProviderError::EmptyResponse),
        }
    }

    fn name(&self) -> String {
        "scripted/model".to_string()
    }
}

fn text(body: &str) -> Result<Completion, ProviderError> {
    Ok(Completion {
        text: Some(body.to_string()),
        ..Default::default()
    })
}

fn tool_turn(calls: &[Value]) -> Completion {
    Completion {
        text: Some("Let me test it.".to_string()),
        tool_calls: calls
            .iter()
            .enumerate()
            .map(|(i, args)| ToolCall {
                id: format!("call_{}", i),
                name: "mystery_function".to_string(),
                arguments: ToolArguments::from_value(args.clone()),
            })
            .collect(),
        ..Default::default()
    }
}

fn prediction(value: Value) -> Result<Completion, ProviderError> {
    text(&format!(
        "Sure.\n{}",
        json!({"thoughts": "it adds the numbers", "expected_output": value})
    ))
}

// ---------------------------------------------------------------------------
// Fake scorer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScorerState {
    cases: VecDeque<(Value, Value)>,
    pending: Option<Value>,
    /// Verdicts served ahead of comparing against the expected output.
    statuses: VecDeque<VerificationStatus>,
    /// Served as a soft 400 on the next `next-verification`.
    verification_error: Option<String>,
    test_calls: Vec<Vec<Value>>,
    verification_requests: u32,
    submissions: Vec<Value>,
    resets: Vec<String>,
}

struct FakeScorer {
    function: fn(&[Value]) -> Value,
    reset_ok: bool,
    completion: Option<RunCompletion>,
    state: Mutex<ScorerState>,
}

fn add(args: &[Value]) -> Value {
    json!(args.iter().filter_map(Value::as_i64).sum::<i64>())
}

impl FakeScorer {
    fn adder(cases: Vec<(Value, Value)>) -> Self {
        Self {
            function: add,
            reset_ok: true,
            completion: None,
            state: Mutex::new(ScorerState {
                cases: cases.into(),
                ..Default::default()
            }),
        }
    }

    fn with_statuses(self, statuses: Vec<VerificationStatus>) -> Self {
        self.state.lock().unwrap().statuses = statuses.into();
        self
    }
}

#[async_trait]
impl Scorer for FakeScorer {
    async fn test_function(&self, _attempt_id: &str, args: &[Value]) -> ScorerResult<FunctionOutput> {
        self.state.lock().unwrap().test_calls.push(args.to_vec());
        Ok(FunctionOutput {
            output: Some((self.function)(args)),
            error: false,
        })
    }

    async fn next_verification(&self, _attempt_id: &str) -> ScorerResult<Option<VerificationCase>> {
        let mut state = self.state.lock().unwrap();
        state.verification_requests += 1;
        if let Some(body) = state.verification_error.take() {
            return Err(ScorerError::Http { status: 400, body });
        }
        Ok(state.cases.pop_front().map(|(input, expected)| {
            state.pending = Some(expected);
            VerificationCase {
                input,
                output_type: Some(TypeTag::Integer),
            }
        }))
    }

    async fn attempt_verification(
        &self,
        _attempt_id: &str,
        prediction: &Value,
    ) -> ScorerResult<VerificationStatus> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(prediction.clone());
        let expected = state.pending.take();
        if let Some(status) = state.statuses.pop_front() {
            return Ok(status);
        }
        Ok(if expected.as_ref() != Some(prediction) {
            VerificationStatus::Wrong
        } else if state.cases.is_empty() {
            VerificationStatus::Done
        } else {
            VerificationStatus::Correct
        })
    }

    async fn complete_run(&self) -> ScorerResult<RunCompletion> {
        Ok(self.completion.clone().unwrap_or(RunCompletion {
            run_time: Value::Null,
            score: Score {
                numerator: 0,
                denominator: 0,
            },
            percent: 0.0,
            problem_names: Vec::new(),
        }))
    }

    async fn reset_attempt(&self, attempt_id: &str) -> ScorerResult<bool> {
        self.state.lock().unwrap().resets.push(attempt_id.to_string());
        Ok(self.reset_ok)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredAttempt {
    run_id: String,
    attempt_id: String,
    function_name: Option<String>,
    result: String,
}

#[derive(Default)]
struct MemoryStore {
    runs: Mutex<HashMap<String, FailedRun>>,
    failures: Mutex<HashMap<String, FailureInfo>>,
    results: Mutex<HashMap<String, RunResult>>,
    attempts: Mutex<Vec<StoredAttempt>>,
}

impl MemoryStore {
    fn results_for(&self, run_id: &str) -> Vec<(String, String)> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.run_id == run_id)
            .map(|a| (a.attempt_id.clone(), a.result.clone()))
            .collect()
    }

    fn push(&self, run_id: &str, attempt_id: &str, result: &str) {
        self.attempts.lock().unwrap().push(StoredAttempt {
            run_id: run_id.to_string(),
            attempt_id: attempt_id.to_string(),
            function_name: None,
            result: result.to_string(),
        });
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: &NewRun) -> anyhow::Result<()> {
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run.run_id.clone(),
            FailedRun {
                failure_info: FailureInfo {
                    error_type: String::new(),
                    error_message: String::new(),
                    traceback: String::new(),
                    current_attempt: None,
                    all_attempts: Vec::new(),
                    failure_datetime: String::new(),
                },
                benchmark_version: run.benchmark_version.clone(),
                config: run.config.clone(),
            },
        );
        Ok(())
    }

    async fn add_attempt(&self, run_id: &str, report: &super::AttemptReport) -> anyhow::Result<()> {
        let result = if report.passed { "true" } else { "false" };
        self.push(run_id, &report.attempt_id, result);
        Ok(())
    }

    async fn fail_attempt(&self, run_id: &str, attempt_id: &str) -> anyhow::Result<()> {
        let exists = self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.attempt_id == attempt_id);
        if !exists {
            self.push(run_id, attempt_id, "error");
        }
        Ok(())
    }

    async fn save_run_result(&self, run_id: &str, result: &RunResult) -> anyhow::Result<()> {
        self.results
            .lock()
            .unwrap()
            .insert(run_id.to_string(), result.clone());
        Ok(())
    }

    async fn save_run_failure(&self, run_id: &str, info: &FailureInfo) -> anyhow::Result<()> {
        self.failures
            .lock()
            .unwrap()
            .insert(run_id.to_string(), info.clone());
        Ok(())
    }

    async fn get_failed_run(&self, run_id: &str) -> anyhow::Result<Option<FailedRun>> {
        let Some(info) = self.failures.lock().unwrap().get(run_id).cloned() else {
            return Ok(None);
        };
        Ok(self.runs.lock().unwrap().get(run_id).map(|run| FailedRun {
            failure_info: info,
            benchmark_version: run.benchmark_version.clone(),
            config: run.config.clone(),
        }))
    }

    async fn get_completed_attempts(&self, run_id: &str) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .results_for(run_id)
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    async fn add_problem_names(&self, names: &[ProblemName]) -> anyhow::Result<()> {
        let mut attempts = self.attempts.lock().unwrap();
        for name in names {
            for attempt in attempts.iter_mut().filter(|a| a.attempt_id == name.id) {
                attempt.function_name = Some(name.function_name.clone());
            }
        }
        Ok(())
    }

    async fn calculate_pass_at_k(&self, run_id: &str) -> anyhow::Result<PassAtK> {
        let attempts = self.attempts.lock().unwrap();
        Ok(PassAtK::from_results(attempts.iter().filter_map(|a| {
            (a.run_id == run_id)
                .then_some(())
                .and(a.function_name.as_deref())
                .map(|f| (f, a.result.as_str()))
        })))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn attempt(id: &str, test_limit: u32) -> Attempt {
    Attempt {
        attempt_id: id.to_string(),
        arg_spec: vec![TypeTag::Integer, TypeTag::Integer],
        output_type: Some(TypeTag::Integer),
        test_limit,
        extra: Default::default(),
    }
}

fn run_config() -> RunConfig {
    RunConfig {
        base_url: "http://localhost:3000/api/".to_string(),
        run_mode: RunMode::TwoPhase,
        subset: None,
        target: ModelTarget {
            provider: Provider::OpenAi,
            model_name: "scripted".to_string(),
            settings: ModelSettings {
                model: "scripted-1".to_string(),
                rate_limit: 0.0,
                temperature: None,
                reasoning_effort: None,
                max_tokens: None,
                extra_body: None,
                strip_think_blocks: false,
            },
        },
        decision: None,
        run_type: Some("official".to_string()),
    }
}

fn env<'a>(model: &'a RateLimitedModel, scorer: &'a FakeScorer) -> AttemptEnv<'a> {
    AttemptEnv {
        model,
        judge: None,
        scorer,
        mode: RunMode::TwoPhase,
    }
}

/// Investigates `(3, 4)` and `(1, 1)` in one turn, concludes, then predicts 10.
fn adding_model() -> ScriptedModel {
    ScriptedModel::new(vec![
        Ok(tool_turn(&[json!({"a": 3, "b": 4}), json!({"b": 1, "a": 1})])),
        text("The function adds its two arguments."),
        prediction(json!(10)),
    ])
}

// ---------------------------------------------------------------------------
// Attempt scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_phase_attempt_passes() {
    let model = adding_model();
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(report.tool_calls, 2);
    assert_eq!(report.api_calls, 3);
    assert!(report.complete_log.contains("(3, 4) → 7"));
    assert!(report.complete_log.contains("(1, 1) → 2"));
    assert!(report.complete_log.contains("### SYSTEM: The tool was used 2 times."));
    assert!(report.complete_log.contains("### SYSTEM: CORRECT"));

    let state = scorer.state.lock().unwrap();
    assert_eq!(state.test_calls, vec![vec![json!(3), json!(4)], vec![json!(1), json!(1)]]);
    assert_eq!(state.submissions, vec![json!(10)]);

    // Verification runs on the investigation conversation without the tool
    let seen = model.seen();
    assert!(seen[0].had_tools);
    assert!(!seen[2].had_tools);
    assert!(seen[2]
        .messages
        .iter()
        .any(|m| matches!(m, Message::ToolResult { content, .. } if content == "7")));
}

#[tokio::test]
async fn test_overrun_fails_once_at_turn_ceiling() {
    let model = ScriptedModel::new(Vec::new()).with_fallback(tool_turn(&[json!({"a": 1, "b": 2})]));
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);

    let err = run_attempt(&env(&limited, &scorer), &attempt("a1", 3), Printer::silent(80))
        .await
        .unwrap_err();

    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::InvestigationOverrun { turns }) => assert_eq!(*turns, 8),
        other => panic!("expected overrun, got {:?}", other),
    }
    assert_eq!(model.seen().len(), 8);
    assert_eq!(scorer.state.lock().unwrap().verification_requests, 0);
}

#[tokio::test]
async fn test_wrong_prediction_short_circuits() {
    let model = ScriptedModel::new(vec![
        Ok(tool_turn(&[json!({"a": 3, "b": 4})])),
        text("It adds."),
        prediction(json!(3)),
    ]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![
        (json!([1, 1]), json!(2)),
        (json!([2, 2]), json!(4)),
    ]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(!report.passed);
    let state = scorer.state.lock().unwrap();
    assert_eq!(state.verification_requests, 1);
    assert_eq!(state.submissions, vec![json!(3)]);
    assert!(report.complete_log.contains("### SYSTEM: WRONG"));
}

#[tokio::test]
async fn test_unparseable_predictions_fail_after_three_tries() {
    let model = ScriptedModel::new(vec![
        text("I think it adds."),
        text("the answer is ten"),
        text("{\"thoughts\": \"oops\""),
        text("{\"thoughts\": \"no output key\"}"),
    ]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(!report.passed);
    assert_eq!(report.tool_calls, 0);
    assert_eq!(model.seen().len(), 4);
    assert!(scorer.state.lock().unwrap().submissions.is_empty());
}

#[tokio::test]
async fn test_parse_retry_recovers() {
    let model = ScriptedModel::new(vec![
        text("I think it adds."),
        text("ten, probably"),
        prediction(json!(10)),
    ]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();
    assert!(report.passed);
}

#[tokio::test]
async fn test_truncated_prediction_fails_without_retry() {
    let model = ScriptedModel::new(vec![text("It adds."), Err(ProviderError::Truncated)]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();
    assert!(!report.passed);
    assert_eq!(model.seen().len(), 2);
}

#[tokio::test]
async fn test_three_phase_uses_judge_for_decision_and_verification() {
    let investigator = ScriptedModel::new(vec![
        Ok(tool_turn(&[json!({"a": 3, "b": 4})])),
        text("Done investigating."),
    ]);
    let judge = ScriptedModel::new(vec![text("It adds two integers."), prediction(json!(10))]);
    let (inv, jdg) = (investigator.limited(), judge.limited());
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);
    let env = AttemptEnv {
        model: &inv,
        judge: Some(&jdg),
        scorer: &scorer,
        mode: RunMode::ThreePhase,
    };

    let report = run_attempt(&env, &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(report.api_calls, 4);
    assert_eq!(investigator.seen().len(), 2);

    let seen = judge.seen();
    assert!(!seen[0].had_tools);
    assert!(seen[0]
        .messages
        .iter()
        .any(|m| matches!(m, Message::User(t) if t.contains("(3, 4) → 7"))));
    // Verification continues from the decision, which never saw tool traffic
    assert!(!seen[1]
        .messages
        .iter()
        .any(|m| matches!(m, Message::ToolResult { .. })));
}

// ---------------------------------------------------------------------------
// Verification scenarios
// ---------------------------------------------------------------------------

fn predicting_model(predictions: &[i64]) -> ScriptedModel {
    let mut replies = vec![
        Ok(tool_turn(&[json!({"a": 3, "b": 4})])),
        text("The function adds its two arguments."),
    ];
    replies.extend(predictions.iter().map(|p| prediction(json!(p))));
    ScriptedModel::new(replies)
}

fn three_cases() -> Vec<(Value, Value)> {
    vec![
        (json!([5, 5]), json!(10)),
        (json!([2, 3]), json!(5)),
        (json!([1, 1]), json!(2)),
    ]
}

#[tokio::test]
async fn test_correct_verdict_moves_to_next_case() {
    let model = predicting_model(&[10, 5]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(three_cases()[..2].to_vec())
        .with_statuses(vec![VerificationStatus::Correct, VerificationStatus::Correct]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(report.passed);
    let state = scorer.state.lock().unwrap();
    assert_eq!(state.submissions, vec![json!(10), json!(5)]);
    // The third request finds no case left
    assert_eq!(state.verification_requests, 3);
    assert_eq!(report.complete_log.matches("### SYSTEM: CORRECT").count(), 2);
}

#[tokio::test]
async fn test_done_verdict_stops_with_cases_left() {
    let model = predicting_model(&[10]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(three_cases()).with_statuses(vec![VerificationStatus::Done]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(report.passed);
    let state = scorer.state.lock().unwrap();
    assert_eq!(state.verification_requests, 1);
    assert_eq!(state.submissions, vec![json!(10)]);
    assert_eq!(state.cases.len(), 2);
}

#[tokio::test]
async fn test_wrong_after_correct_fails_attempt() {
    let model = predicting_model(&[10, 6]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(three_cases());

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(!report.passed);
    let state = scorer.state.lock().unwrap();
    assert_eq!(state.submissions, vec![json!(10), json!(6)]);
    assert_eq!(state.verification_requests, 2);
    assert!(report.complete_log.contains("### SYSTEM: CORRECT"));
    assert!(report.complete_log.contains("### SYSTEM: WRONG"));
}

#[tokio::test]
async fn test_no_verification_cases_passes() {
    let model = ScriptedModel::new(vec![text("It adds.")]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(Vec::new());

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(model.seen().len(), 1);
    let state = scorer.state.lock().unwrap();
    assert_eq!(state.verification_requests, 1);
    assert!(state.submissions.is_empty());
}

#[tokio::test]
async fn test_next_verification_error_crashes_attempt() {
    let model = predicting_model(&[10]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(three_cases());
    scorer.state.lock().unwrap().verification_error = Some("attempt not found".to_string());
    let store = MemoryStore::default();
    let ctx = RunContext {
        run_id: "r1",
        env: env(&limited, &scorer),
        store: &store,
        echo: false,
    };
    let queue = vec![attempt("a1", 10)];

    let err = process_attempts(&ctx, &queue, &queue).await.unwrap_err();

    assert_eq!(crate::run::error_type(&err), "Http");
    assert!(store.results_for("r1").is_empty());
    let failures = store.failures.lock().unwrap();
    let info = failures.get("r1").unwrap();
    assert_eq!(info.current_attempt.as_ref().unwrap().attempt_id, "a1");
    assert!(info.error_message.contains("attempt not found"));
}

#[tokio::test]
async fn test_parse_failures_are_kept_in_transcript() {
    let model = ScriptedModel::new(vec![
        text("It adds."),
        text("ten"),
        text("still ten"),
        text("definitely ten"),
    ]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(!report.passed);
    assert!(report.complete_log.contains("### SYSTEM: parse attempt 1 failed"));
    assert!(report.complete_log.contains("### SYSTEM: parse attempt 3 failed"));
}

#[tokio::test]
async fn test_truncation_notice_is_kept_in_transcript() {
    let model = ScriptedModel::new(vec![text("It adds."), Err(ProviderError::Truncated)]);
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);

    let report = run_attempt(&env(&limited, &scorer), &attempt("a1", 10), Printer::silent(80))
        .await
        .unwrap();

    assert!(report
        .complete_log
        .contains("### SYSTEM: prediction was cut off at the output token limit"));
}

// ---------------------------------------------------------------------------
// Run lifecycle scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_process_attempts_records_results() {
    let model = adding_model();
    let limited = model.limited();
    let scorer = FakeScorer::adder(vec![(json!([5, 5]), json!(10))]);
    let store = MemoryStore::default();
    let ctx = RunContext {
        run_id: "r1",
        env: env(&limited, &scorer),
        store: &store,
        echo: false,
    };
    let queue = vec![attempt("a1", 10)];

    process_attempts(&ctx, &queue, &queue).await.unwrap();

    assert_eq!(
        store.results_for("r1"),
        vec![("a1".to_string(), "true".to_string())]
    );
    assert!(store.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_crash_records_failure_with_current_attempt() {
    let model = ScriptedModel::new(Vec::new()).with_fallback(tool_turn(&[json!({"a": 1, "b": 1})]));
    let limited = model.limited();
    let scorer = FakeScorer::adder(Vec::new());
    let store = MemoryStore::default();
    let ctx = RunContext {
        run_id: "r1",
        env: env(&limited, &scorer),
        store: &store,
        echo: false,
    };
    let queue = vec![attempt("a1", 1), attempt("a2", 1)];

    let err = process_attempts(&ctx, &queue, &queue).await.unwrap_err();
    assert!(err.downcast_ref::<HarnessError>().is_some());

    let failures = store.failures.lock().unwrap();
    let info = failures.get("r1").unwrap();
    assert_eq!(info.error_type, "InvestigationOverrun");
    assert_eq!(info.current_attempt.as_ref().unwrap().attempt_id, "a1");
    assert_eq!(info.all_attempts.len(), 2);
    assert!(store.results_for("r1").is_empty());
}

async fn seeded_failed_run(store: &MemoryStore, current: &str) {
    store
        .create_run(&NewRun {
            run_id: "r1".to_string(),
            model_identifier: "openai/scripted-1".to_string(),
            benchmark_version: "2".to_string(),
            config: run_config().to_json().unwrap(),
            labels: Vec::new(),
        })
        .await
        .unwrap();
    store.push("r1", "a1", "true");
    let all: Vec<Attempt> = ["a1", "a2", "a3", "a4"].iter().map(|id| attempt(id, 10)).collect();
    let current = all.iter().find(|a| a.attempt_id == current).cloned();
    store
        .save_run_failure(
            "r1",
            &FailureInfo {
                error_type: "Timeout".to_string(),
                error_message: "request timed out".to_string(),
                traceback: String::new(),
                current_attempt: current,
                all_attempts: all,
                failure_datetime: "2026-10-19 12:00:00".to_string(),
            },
        )
        .await
        .unwrap();
}

fn ids(attempts: &[Attempt]) -> Vec<&str> {
    attempts.iter().map(|a| a.attempt_id.as_str()).collect()
}

#[tokio::test]
async fn test_resume_skip_drops_failed_attempt() {
    let store = MemoryStore::default();
    seeded_failed_run(&store, "a2").await;
    let scorer = FakeScorer::adder(Vec::new());

    let run = resume_failed_run(&store, &scorer, "r1", ResumeMode::Skip)
        .await
        .unwrap();

    assert_eq!(ids(&run.queue), vec!["a3", "a4"]);
    assert_eq!(run.all_attempts.len(), 4);
    assert_eq!(run.config, run_config());
    assert!(store
        .results_for("r1")
        .contains(&("a2".to_string(), "error".to_string())));
    assert!(scorer.state.lock().unwrap().resets.is_empty());
}

#[tokio::test]
async fn test_resume_retry_resets_and_keeps_attempt() {
    let store = MemoryStore::default();
    seeded_failed_run(&store, "a2").await;
    let scorer = FakeScorer::adder(Vec::new());

    let run = resume_failed_run(&store, &scorer, "r1", ResumeMode::Retry)
        .await
        .unwrap();

    assert_eq!(ids(&run.queue), vec!["a2", "a3", "a4"]);
    assert_eq!(scorer.state.lock().unwrap().resets, vec!["a2".to_string()]);
}

#[tokio::test]
async fn test_resume_retry_refused_reset_is_fatal() {
    let store = MemoryStore::default();
    seeded_failed_run(&store, "a2").await;
    let mut scorer = FakeScorer::adder(Vec::new());
    scorer.reset_ok = false;

    let err = resume_failed_run(&store, &scorer, "r1", ResumeMode::Retry)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::UnresumableRun(_))
    ));
}

#[tokio::test]
async fn test_resume_without_failure_is_unresumable() {
    let store = MemoryStore::default();
    let scorer = FakeScorer::adder(Vec::new());
    let err = resume_failed_run(&store, &scorer, "missing", ResumeMode::Skip)
        .await
        .unwrap_err();
    assert_eq!(crate::run::error_type(&err), "UnresumableRun");
}

#[tokio::test]
async fn test_complete_run_names_attempts_and_scores() {
    let store = MemoryStore::default();
    store.push("r1", "a1", "false");
    store.push("r1", "a2", "true");
    let mut scorer = FakeScorer::adder(Vec::new());
    scorer.completion = Some(RunCompletion {
        run_time: json!("00:01:00"),
        score: Score {
            numerator: 1,
            denominator: 2,
        },
        percent: 50.0,
        problem_names: vec![
            ProblemName {
                id: "a1".to_string(),
                function_name: "add".to_string(),
            },
            ProblemName {
                id: "a2".to_string(),
                function_name: "add".to_string(),
            },
        ],
    });

    let summary = complete_run(&scorer, &store, "r1", "scripted-1", Instant::now(), 6)
        .await
        .unwrap();

    assert_eq!(summary.pass_at_k.k, 2);
    assert_eq!(summary.pass_at_k.problems_passed, 1);
    let results = store.results.lock().unwrap();
    let saved = results.get("r1").unwrap();
    assert_eq!(saved.total_api_calls, 6);
    assert_eq!(saved.score.numerator, 1);
}
