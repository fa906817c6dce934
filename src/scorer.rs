//! Client for the remote scoring server.
//!
//! Every POST carries the run id (`null` before a run exists). A 400 with an
//! `error` body is a soft failure the caller sees as `{output, error: true}`,
//! except an invalid problem set which aborts the run.

use crate::bench::normalize::TypeTag;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT_SECS: u64 = 600;
const INVALID_PROBLEM_SET: &str = "Invalid exam set:";

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("{0}")]
    InvalidProblemSet(String),
    #[error("scoring server returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("couldn't reach scoring server: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response from scoring server: {0}")]
    Decode(String),
}

impl ScorerError {
    pub fn variant_name(&self) -> &'static str {
        match self {
            ScorerError::InvalidProblemSet(_) => "InvalidProblemSet",
            ScorerError::Http { .. } => "Http",
            ScorerError::Transport(_) => "Transport",
            ScorerError::Decode(_) => "Decode",
        }
    }
}

pub type ScorerResult<T> = std::result::Result<T, ScorerError>;

/// One attempt as issued by `start-run`. Fields the client doesn't use are
/// kept so the queue can be written back verbatim into failure info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Attempt {
    pub attempt_id: String,
    pub arg_spec: Vec<TypeTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<TypeTag>,
    pub test_limit: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StartRunRequest {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_per_problem: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_run_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunStart {
    pub run_id: String,
    pub run_type: String,
    pub benchmark_version: String,
    pub attempts: Vec<Attempt>,
}

/// Result of one `test-function` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOutput {
    /// `None` when the server omitted `output`.
    pub output: Option<Value>,
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationCase {
    pub input: Value,
    pub output_type: Option<TypeTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    Correct,
    Wrong,
    Done,
    Other(String),
}

impl VerificationStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "correct" => VerificationStatus::Correct,
            "wrong" => VerificationStatus::Wrong,
            "done" => VerificationStatus::Done,
            other => VerificationStatus::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub numerator: i64,
    pub denominator: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProblemName {
    pub id: String,
    pub function_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunCompletion {
    #[serde(default)]
    pub run_time: Value,
    pub score: Score,
    pub percent: f64,
    #[serde(default)]
    pub problem_names: Vec<ProblemName>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProblemSet {
    pub name: String,
    pub id: String,
}

/// The per-run operations the benchmark loops call.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn test_function(&self, attempt_id: &str, args: &[Value]) -> ScorerResult<FunctionOutput>;

    /// `None` once the server has no more cases.
    async fn next_verification(&self, attempt_id: &str) -> ScorerResult<Option<VerificationCase>>;

    async fn attempt_verification(
        &self,
        attempt_id: &str,
        prediction: &Value,
    ) -> ScorerResult<VerificationStatus>;

    async fn complete_run(&self) -> ScorerResult<RunCompletion>;

    /// Ask the server to forget an attempt so it can be re-run.
    async fn reset_attempt(&self, attempt_id: &str) -> ScorerResult<bool>;
}

/// HTTP client for the scoring server, optionally bound to a run.
#[derive(Debug, Clone)]
pub struct HttpScorer {
    client: reqwest::Client,
    base_url: Url,
    run_id: Option<String>,
}

impl HttpScorer {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
            run_id: None,
        })
    }

    /// A copy of this client that tags every request with `run_id`.
    pub fn for_run(&self, run_id: &str) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            run_id: Some(run_id.to_string()),
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub async fn start_run(&self, request: &StartRunRequest) -> ScorerResult<RunStart> {
        let body = serde_json::to_value(request).map_err(|e| ScorerError::Decode(e.to_string()))?;
        let response = self.post("start-run", body).await?;
        if response.get("error").and_then(Value::as_bool) == Some(true) {
            return Err(ScorerError::Http {
                status: 400,
                body: response_error_text(&response),
            });
        }
        decode(response)
    }

    pub async fn problem_sets(&self) -> ScorerResult<BTreeMap<String, Vec<ProblemSet>>> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "problem-sets")]
            problem_sets: BTreeMap<String, Vec<ProblemSet>>,
        }

        let url = self.endpoint("problem-sets")?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ScorerError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        let envelope: Envelope =
            serde_json::from_str(&text).map_err(|e| ScorerError::Decode(format!("{}: {}", e, text)))?;
        Ok(envelope.problem_sets)
    }

    fn endpoint(&self, path: &str) -> ScorerResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ScorerError::Decode(format!("bad endpoint {}: {}", path, e)))
    }

    /// POST `body` plus `run-id`, returning the response object with an
    /// `error` flag added.
    async fn post(&self, path: &str, mut body: Value) -> ScorerResult<Value> {
        if let Value::Object(map) = &mut body {
            map.insert(
                "run-id".to_string(),
                self.run_id.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }

        let url = self.endpoint(path)?;
        tracing::debug!(%url, "scorer request");
        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::warn!(path, status = status.as_u16(), "scorer returned an error");
            let parsed: Option<Value> = serde_json::from_str(&text).ok();
            let message = parsed
                .as_ref()
                .and_then(|v| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string);

            return match (status.as_u16(), message) {
                (400, Some(msg)) if msg.contains(INVALID_PROBLEM_SET) => {
                    Err(ScorerError::InvalidProblemSet(msg))
                }
                (400, Some(msg)) => Ok(json!({"output": msg, "error": true})),
                (code, _) => Err(ScorerError::Http {
                    status: code,
                    body: text,
                }),
            };
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| ScorerError::Decode(format!("{}: {}", e, text)))?;
        Ok(with_error_flag(parsed))
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn test_function(&self, attempt_id: &str, args: &[Value]) -> ScorerResult<FunctionOutput> {
        let response = self
            .post("test-function", json!({"attempt-id": attempt_id, "args": args}))
            .await?;
        Ok(function_output(&response))
    }

    async fn next_verification(&self, attempt_id: &str) -> ScorerResult<Option<VerificationCase>> {
        let response = self
            .post("next-verification", json!({"attempt-id": attempt_id}))
            .await?;
        verification_case(&response)
    }

    async fn attempt_verification(
        &self,
        attempt_id: &str,
        prediction: &Value,
    ) -> ScorerResult<VerificationStatus> {
        let response = self
            .post(
                "attempt-verification",
                json!({"attempt-id": attempt_id, "prediction": prediction}),
            )
            .await?;
        let status = response
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ScorerError::Decode(format!("no status in {}", response)))?;
        Ok(VerificationStatus::parse(status))
    }

    async fn complete_run(&self) -> ScorerResult<RunCompletion> {
        let response = self.post("complete-run", json!({})).await?;
        decode(response)
    }

    async fn reset_attempt(&self, attempt_id: &str) -> ScorerResult<bool> {
        let response = self
            .post("developer/reset-attempt", json!({"attempt-id": attempt_id}))
            .await?;
        Ok(response.get("status").and_then(Value::as_str) == Some("success"))
    }
}

fn normalize_base_url(base_url: &str) -> anyhow::Result<Url> {
    let with_slash = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };
    Url::parse(&with_slash).map_err(|e| anyhow::anyhow!("Invalid base-url '{}': {}", base_url, e))
}

fn with_error_flag(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.entry("error").or_insert(Value::Bool(false));
            Value::Object(map)
        }
        other => other,
    }
}

fn response_error_text(response: &Value) -> String {
    response
        .get("output")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

fn decode<T: serde::de::DeserializeOwned>(response: Value) -> ScorerResult<T> {
    serde_json::from_value(response.clone())
        .map_err(|e| ScorerError::Decode(format!("{}: {}", e, response)))
}

fn function_output(response: &Value) -> FunctionOutput {
    FunctionOutput {
        output: response.get("output").cloned(),
        error: response.get("error").and_then(Value::as_bool).unwrap_or(false),
    }
}

/// Null, `false`, an empty object and a missing or null `next-verification`
/// all mean there are no more cases. A soft 400 is an error, not the end.
fn verification_case(response: &Value) -> ScorerResult<Option<VerificationCase>> {
    if response.get("error").and_then(Value::as_bool) == Some(true) {
        return Err(ScorerError::Http {
            status: 400,
            body: response_error_text(response),
        });
    }
    let input = match response.get("next-verification") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => return Ok(None),
        Some(input) => input.clone(),
    };
    let output_type = response
        .get("output-type")
        .and_then(|v| serde_json::from_value::<TypeTag>(v.clone()).ok());
    Ok(Some(VerificationCase { input, output_type }))
}
