//! Anthropic messages API.
//!
//! A model name ending in `+thinking` turns on extended thinking with
//! interleaved thinking between tool calls.

use super::{
    Completion, CompletionRequest, Message, ModelAdapter, ProviderError, ToolArguments, ToolCall,
    VerificationContext,
};
use crate::config::ModelTarget;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const THINKING_SUFFIX: &str = "+thinking";
const THINKING_BETA: &str = "interleaved-thinking-2025-05-14";
const THINKING_MAX_TOKENS: u32 = 32000;
const THINKING_BUDGET: u32 = 20000;
const THINKING_TIMEOUT_SECS: u64 = 1200;
const DEFAULT_MAX_TOKENS: u32 = 8192;
const DEFAULT_TIMEOUT_SECS: u64 = 600;

pub struct Anthropic {
    client: reqwest::Client,
    api_key: String,
    model: String,
    thinking: bool,
    max_tokens: u32,
    temperature: Option<f64>,
}

impl Anthropic {
    pub fn new(target: &ModelTarget, api_key: String) -> anyhow::Result<Self> {
        let settings = &target.settings;
        let (model, thinking) = match settings.model.strip_suffix(THINKING_SUFFIX) {
            Some(base) => (base.to_string(), true),
            None => (settings.model.clone(), false),
        };
        let timeout = if thinking {
            THINKING_TIMEOUT_SECS
        } else {
            DEFAULT_TIMEOUT_SECS
        };
        let default_max = if thinking {
            THINKING_MAX_TOKENS
        } else {
            DEFAULT_MAX_TOKENS
        };
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout))
                .build()?,
            api_key,
            model,
            thinking,
            max_tokens: settings.max_tokens.unwrap_or(default_max),
            temperature: settings.temperature,
        })
    }

    fn build_body(&self, request: &CompletionRequest<'_>) -> Value {
        let (system, messages) = wire_messages(request.messages);
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": messages,
        });
        if let Value::Object(map) = &mut body {
            if let Some(system) = system {
                map.insert("system".to_string(), Value::String(system));
            }
            if let Some(schema) = request.tools {
                map.insert(
                    "tools".to_string(),
                    json!([{
                        "name": schema.name,
                        "description": schema.description,
                        "input_schema": {
                            "type": "object",
                            "properties": schema.parameters_json()["properties"].clone(),
                            "required": schema.parameters.keys().collect::<Vec<_>>(),
                        },
                    }]),
                );
            }
            if self.thinking {
                map.insert(
                    "thinking".to_string(),
                    json!({"type": "enabled", "budget_tokens": THINKING_BUDGET}),
                );
            }
            if let Some(t) = self.temperature {
                map.insert("temperature".to_string(), json!(t));
            }
        }
        body
    }
}

/// Convert to Anthropic messages: system text is lifted out, consecutive
/// tool results are grouped into one user turn.
fn wire_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut out: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    let flush = |pending: &mut Vec<Value>, out: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({"role": "user", "content": std::mem::take(pending)}));
        }
    };

    for message in messages {
        match message {
            Message::System(text) => {
                system = Some(match system.take() {
                    Some(existing) => format!("{}\n\n{}", existing, text),
                    None => text.clone(),
                });
            }
            Message::ToolResult {
                call_id, content, ..
            } => pending_results.push(json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": content,
            })),
            Message::User(text) => {
                flush(&mut pending_results, &mut out);
                out.push(json!({"role": "user", "content": text}));
            }
            Message::Assistant {
                text,
                tool_calls,
                thinking,
            } => {
                flush(&mut pending_results, &mut out);
                let mut blocks: Vec<Value> = thinking.clone();
                if let Some(text) = text {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments.to_value(),
                    }));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
        }
    }
    flush(&mut pending_results, &mut out);
    (system, out)
}

fn parse_response(text: &str) -> Result<Completion, ProviderError> {
    let raw: Value =
        serde_json::from_str(text).map_err(|e| ProviderError::Decode(format!("{}: {}", e, text)))?;
    let content = raw
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Decode(format!("no content in {}", text)))?;

    let mut completion = Completion::default();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") if completion.text.is_none() => {
                completion.text = block.get("text").and_then(Value::as_str).map(str::to_string);
            }
            Some("tool_use") => completion.tool_calls.push(ToolCall {
                id: string_field(block, "id"),
                name: string_field(block, "name"),
                arguments: ToolArguments::from_value(
                    block.get("input").cloned().unwrap_or(Value::Object(Map::new())),
                ),
            }),
            Some("thinking") | Some("redacted_thinking") => completion.thinking.push(block.clone()),
            _ => {}
        }
    }
    completion.raw = raw;
    Ok(completion)
}

fn string_field(block: &Value, key: &str) -> String {
    block
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl ModelAdapter for Anthropic {
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let body = self.build_body(request);
        let mut builder = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");
        if self.thinking {
            builder = builder.header("anthropic-beta", THINKING_BETA);
        }

        let response = builder.json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), text));
        }
        parse_response(&text)
    }

    fn name(&self) -> String {
        let suffix = if self.thinking { THINKING_SUFFIX } else { "" };
        format!("anthropic/{}{}", self.model, suffix)
    }

    fn verification_context(&self) -> VerificationContext {
        VerificationContext::LastMessage
    }
}
