//! Gemini `generateContent`.

use super::{
    Completion, CompletionRequest, Message, ModelAdapter, ProviderError, ToolArguments, ToolCall,
};
use crate::bench::normalize::TypeTag;
use crate::config::ModelTarget;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const REQUEST_TIMEOUT_SECS: u64 = 600;

pub struct Gemini {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

impl Gemini {
    pub fn new(target: &ModelTarget, api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()?,
            api_key,
            model: target.settings.model.clone(),
            temperature: target.settings.temperature,
            max_tokens: target.settings.max_tokens,
        })
    }

    fn build_body(&self, request: &CompletionRequest<'_>) -> Value {
        let (system, contents) = wire_contents(request.messages);
        let mut body = Map::new();
        body.insert("contents".to_string(), Value::Array(contents));
        if let Some(system) = system {
            body.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": system}]}),
            );
        }
        if let Some(schema) = request.tools {
            let properties: Map<String, Value> = schema
                .parameters
                .iter()
                .map(|(key, tag)| (key.clone(), json!({"type": tag.openapi_type()})))
                .collect();
            body.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": [{
                    "name": schema.name,
                    "description": schema.description,
                    "parameters": {
                        "type": "OBJECT",
                        "properties": properties,
                        "required": schema.parameters.keys().collect::<Vec<_>>(),
                    },
                }]}]),
            );
        }

        let mut generation = Map::new();
        if let Some(t) = self.temperature {
            generation.insert("temperature".to_string(), json!(t));
        }
        if let Some(max) = self.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(max));
        }
        if let Some(output_type) = request.prediction {
            generation.insert("responseMimeType".to_string(), json!("application/json"));
            generation.insert("responseSchema".to_string(), response_schema(output_type));
        }
        if !generation.is_empty() {
            body.insert("generationConfig".to_string(), Value::Object(generation));
        }
        Value::Object(body)
    }
}

fn response_schema(output_type: TypeTag) -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "thoughts": {"type": "STRING"},
            "expected_output": {"type": output_type.openapi_type()},
        },
        "required": ["thoughts", "expected_output"],
    })
}

/// Model turns that came back from Gemini are replayed from their original
/// parts (kept in `thinking`) so thought signatures survive.
fn wire_contents(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut contents: Vec<Value> = Vec::new();
    let mut responses: Vec<Value> = Vec::new();

    fn flush(responses: &mut Vec<Value>, contents: &mut Vec<Value>) {
        if !responses.is_empty() {
            contents.push(json!({"role": "user", "parts": std::mem::take(responses)}));
        }
    }

    for message in messages {
        match message {
            Message::System(text) => system = Some(text.clone()),
            Message::User(text) => {
                flush(&mut responses, &mut contents);
                contents.push(json!({"role": "user", "parts": [{"text": text}]}));
            }
            Message::ToolResult { name, content, .. } => {
                let result: Value =
                    serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.clone()));
                responses.push(json!({
                    "functionResponse": {"name": name, "response": {"result": result}}
                }));
            }
            Message::Assistant {
                text,
                tool_calls,
                thinking,
            } => {
                flush(&mut responses, &mut contents);
                let parts: Vec<Value> = if !thinking.is_empty() {
                    thinking.clone()
                } else {
                    let mut parts = Vec::new();
                    if let Some(text) = text {
                        parts.push(json!({"text": text}));
                    }
                    for call in tool_calls {
                        parts.push(json!({
                            "functionCall": {"name": call.name, "args": call.arguments.to_value()}
                        }));
                    }
                    parts
                };
                contents.push(json!({"role": "model", "parts": parts}));
            }
        }
    }
    flush(&mut responses, &mut contents);
    (system, contents)
}

fn parse_response(text: &str, structured: bool) -> Result<Completion, ProviderError> {
    let raw: Value =
        serde_json::from_str(text).map_err(|e| ProviderError::Decode(format!("{}: {}", e, text)))?;
    let candidate = raw
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or(ProviderError::EmptyResponse)?;

    if structured && candidate.get("finishReason").and_then(Value::as_str) == Some("MAX_TOKENS") {
        return Err(ProviderError::Truncated);
    }

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .ok_or(ProviderError::EmptyResponse)?;

    let mut text_out = String::new();
    let mut tool_calls = Vec::new();
    for part in &parts {
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text_out.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            tool_calls.push(ToolCall {
                id,
                name: call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: ToolArguments::from_value(
                    call.get("args").cloned().unwrap_or(Value::Object(Map::new())),
                ),
            });
        }
    }

    Ok(Completion {
        text: (!text_out.is_empty()).then_some(text_out),
        tool_calls,
        thinking: parts,
        raw,
    })
}

#[async_trait]
impl ModelAdapter for Gemini {
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let url = format!("{}/{}:generateContent", API_BASE, self.model);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.build_body(request))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), text));
        }
        parse_response(&text, request.prediction.is_some())
    }

    fn name(&self) -> String {
        format!("google/{}", self.model)
    }

    fn supports_structured_output(&self) -> bool {
        true
    }
}
