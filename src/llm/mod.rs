//! Provider-neutral conversation types and the `ModelAdapter` seam.
//!
//! The benchmark loops only ever speak in these types. Each adapter converts
//! them to its vendor's wire format and back.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod rate_limit;

use crate::bench::normalize::TypeTag;
use crate::config::{ModelTarget, Provider};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub use rate_limit::{RateLimitedModel, RetryPolicy};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("provider overloaded: {0}")]
    Overloaded(String),
    #[error("provider server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider returned no candidates")]
    EmptyResponse,
    #[error("response truncated at the output token limit")]
    Truncated,
    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("couldn't decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_))
    }

    pub fn is_overloaded(&self) -> bool {
        matches!(self, ProviderError::Overloaded(_))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, ProviderError::ServerError { .. })
    }

    pub fn is_empty_response(&self) -> bool {
        matches!(self, ProviderError::EmptyResponse)
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            ProviderError::Timeout => "Timeout",
            ProviderError::RateLimited(_) => "RateLimited",
            ProviderError::Overloaded(_) => "Overloaded",
            ProviderError::ServerError { .. } => "ServerError",
            ProviderError::EmptyResponse => "EmptyResponse",
            ProviderError::Truncated => "Truncated",
            ProviderError::Http { .. } => "Http",
            ProviderError::Transport(_) => "Transport",
            ProviderError::Decode(_) => "Decode",
        }
    }

    /// Map a non-success HTTP status to the error the retry policy sees.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ProviderError::RateLimited(body),
            529 => ProviderError::Overloaded(body),
            500..=599 if body.contains("overloaded") => ProviderError::Overloaded(body),
            500..=599 => ProviderError::ServerError { status, body },
            _ => ProviderError::Http { status, body },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Arguments of a tool call as the model sent them.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Json(Map<String, Value>),
    /// Not a JSON object; kept verbatim so the turn can be replayed.
    Malformed(String),
}

impl ToolArguments {
    /// Parse an OpenAI-style JSON-encoded argument string.
    pub fn from_encoded(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => ToolArguments::Json(map),
            _ => ToolArguments::Malformed(raw.to_string()),
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => ToolArguments::Json(map),
            other => ToolArguments::Malformed(other.to_string()),
        }
    }

    pub fn encoded(&self) -> String {
        match self {
            ToolArguments::Json(map) => Value::Object(map.clone()).to_string(),
            ToolArguments::Malformed(raw) => raw.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ToolArguments::Json(map) => Value::Object(map.clone()),
            ToolArguments::Malformed(raw) => Value::String(raw.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: ToolArguments,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System(String),
    User(String),
    Assistant {
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
        /// Opaque provider blocks (thinking, redacted thinking) that must be
        /// sent back unchanged on the next turn.
        thinking: Vec<Value>,
    },
    ToolResult {
        call_id: String,
        name: String,
        /// JSON-encoded output of the call.
        content: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System(text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message::User(text.into())
    }

    pub fn assistant_text(text: Option<String>) -> Self {
        Message::Assistant {
            text,
            tool_calls: Vec::new(),
            thinking: Vec::new(),
        }
    }
}

/// The single tool offered to the model: named parameters `a`, `b`, ...
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, TypeTag>,
}

impl ToolSchema {
    /// JSON Schema for the parameters object, in lower-case JSON Schema types.
    pub fn parameters_json(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|(key, tag)| (key.clone(), json!({"type": tag.json_schema_type()})))
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.parameters.keys().collect::<Vec<_>>(),
            "additionalProperties": false,
        })
    }
}

/// JSON Schema for the `{thoughts, expected_output}` prediction object.
pub fn prediction_schema(output_type: TypeTag) -> Value {
    json!({
        "type": "object",
        "properties": {
            "thoughts": {"type": "string"},
            "expected_output": {"type": output_type.json_schema_type()},
        },
        "required": ["thoughts", "expected_output"],
        "additionalProperties": false,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub messages: &'a [Message],
    pub tools: Option<&'a ToolSchema>,
    /// Request provider-native structured output for a prediction of this
    /// type. Ignored by adapters without structured output.
    pub prediction: Option<TypeTag>,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(messages: &'a [Message]) -> Self {
        Self {
            messages,
            tools: None,
            prediction: None,
        }
    }

    pub fn with_tools(mut self, tools: &'a ToolSchema) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_prediction(mut self, output_type: Option<TypeTag>) -> Self {
        self.prediction = output_type;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub thinking: Vec<Value>,
    pub raw: Value,
}

impl Completion {
    /// The assistant turn to append to the conversation.
    pub fn to_message(&self) -> Message {
        Message::Assistant {
            text: self.text.clone(),
            tool_calls: self.tool_calls.clone(),
            thinking: self.thinking.clone(),
        }
    }
}

/// How much of the conversation the verification request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationContext {
    Full,
    /// Only the final assistant turn. Needed where a request containing tool
    /// traffic must also declare the tools.
    LastMessage,
}

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError>;

    /// `provider/model` for logs.
    fn name(&self) -> String;

    fn supports_structured_output(&self) -> bool {
        false
    }

    fn verification_context(&self) -> VerificationContext {
        VerificationContext::Full
    }
}

/// Build the adapter for `target` wrapped in its provider's rate limiter.
pub fn build_model(target: &ModelTarget, api_key: String) -> anyhow::Result<RateLimitedModel> {
    let adapter: Box<dyn ModelAdapter> = match target.provider {
        Provider::OpenAi | Provider::DeepSeek | Provider::Xai | Provider::Fireworks => {
            Box::new(openai::OpenAiCompatible::new(target, api_key)?)
        }
        Provider::Anthropic => Box::new(anthropic::Anthropic::new(target, api_key)?),
        Provider::Google => Box::new(google::Gemini::new(target, api_key)?),
    };
    Ok(RateLimitedModel::new(
        adapter,
        target.settings.rate_limit,
        RetryPolicy::for_provider(target.provider),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_arguments_from_encoded() {
        match ToolArguments::from_encoded(r#"{"a": 3, "b": 4}"#) {
            ToolArguments::Json(map) => assert_eq!(map.get("b"), Some(&json!(4))),
            other => panic!("expected json, got {:?}", other),
        }
        assert_eq!(
            ToolArguments::from_encoded("{\"a\": 3"),
            ToolArguments::Malformed("{\"a\": 3".to_string())
        );
        assert_eq!(
            ToolArguments::from_encoded("[1, 2]"),
            ToolArguments::Malformed("[1, 2]".to_string())
        );
    }

    #[test]
    fn test_parameters_json() {
        let schema = ToolSchema {
            name: "mystery_function".to_string(),
            description: String::new(),
            parameters: [
                ("a".to_string(), TypeTag::Integer),
                ("b".to_string(), TypeTag::Float),
            ]
            .into_iter()
            .collect(),
        };
        assert_eq!(
            schema.parameters_json(),
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "number"}},
                "required": ["a", "b"],
                "additionalProperties": false
            })
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(ProviderError::from_status(429, String::new()).is_rate_limited());
        assert!(ProviderError::from_status(529, String::new()).is_overloaded());
        assert!(ProviderError::from_status(500, "overloaded_error".into()).is_overloaded());
        assert!(ProviderError::from_status(503, String::new()).is_server_error());
        assert_eq!(
            ProviderError::from_status(400, "bad".into()).variant_name(),
            "Http"
        );
    }

    #[test]
    fn test_prediction_schema_boolean() {
        let schema = prediction_schema(TypeTag::Boolean);
        assert_eq!(schema["properties"]["expected_output"]["type"], "boolean");
        assert_eq!(schema["required"], json!(["thoughts", "expected_output"]));
    }
}
