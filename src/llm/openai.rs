//! OpenAI-compatible chat completions.
//!
//! Serves OpenAI itself plus DeepSeek, xAI and Fireworks, which differ in
//! base URL and in how (or whether) they accept a response schema.

use super::{
    prediction_schema, Completion, CompletionRequest, Message, ModelAdapter, ProviderError,
    ToolArguments, ToolCall, ToolSchema,
};
use crate::config::{ModelTarget, Provider};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 600;

/// How a provider takes a response schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StructuredOutput {
    /// `response_format: {type: json_schema, json_schema: {strict: true}}`
    JsonSchema,
    /// `response_format: {type: json_object, schema}`
    JsonObject,
    None,
}

fn provider_profile(provider: Provider) -> (&'static str, &'static str, StructuredOutput) {
    match provider {
        Provider::DeepSeek => ("https://api.deepseek.com", "system", StructuredOutput::None),
        Provider::Xai => ("https://api.x.ai/v1", "system", StructuredOutput::JsonSchema),
        Provider::Fireworks => (
            "https://api.fireworks.ai/inference/v1",
            "system",
            StructuredOutput::JsonObject,
        ),
        _ => ("https://api.openai.com/v1", "developer", StructuredOutput::JsonSchema),
    }
}

pub struct OpenAiCompatible {
    client: reqwest::Client,
    provider: Provider,
    url: String,
    api_key: String,
    model: String,
    system_role: &'static str,
    structured: StructuredOutput,
    temperature: Option<f64>,
    reasoning_effort: Option<String>,
    max_tokens: Option<u32>,
    extra_body: Option<Value>,
    strip_think_blocks: bool,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    description: String,
    strict: bool,
    parameters: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

impl OpenAiCompatible {
    pub fn new(target: &ModelTarget, api_key: String) -> anyhow::Result<Self> {
        let (base_url, system_role, structured) = provider_profile(target.provider);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let settings = &target.settings;
        Ok(Self {
            client,
            provider: target.provider,
            url: format!("{}/chat/completions", base_url),
            api_key,
            model: settings.model.clone(),
            system_role,
            structured,
            temperature: settings.temperature,
            reasoning_effort: settings.reasoning_effort.clone(),
            max_tokens: settings.max_tokens,
            extra_body: settings.extra_body.clone(),
            strip_think_blocks: settings.strip_think_blocks,
        })
    }

    fn wire_messages(&self, messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|message| match message {
                Message::System(text) => WireMessage {
                    role: self.system_role.to_string(),
                    content: Some(text.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                },
                Message::User(text) => WireMessage {
                    role: "user".to_string(),
                    content: Some(text.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                },
                Message::Assistant {
                    text, tool_calls, ..
                } => {
                    let content = match (text, self.strip_think_blocks) {
                        (Some(t), true) => Some(remove_think_blocks(t)),
                        (t, _) => t.clone(),
                    };
                    let calls = (!tool_calls.is_empty()).then(|| {
                        tool_calls
                            .iter()
                            .map(|call| WireToolCall {
                                id: call.id.clone(),
                                call_type: "function".to_string(),
                                function: WireFunctionCall {
                                    name: call.name.clone(),
                                    arguments: call.arguments.encoded(),
                                },
                            })
                            .collect()
                    });
                    WireMessage {
                        role: "assistant".to_string(),
                        content,
                        tool_calls: calls,
                        tool_call_id: None,
                    }
                }
                Message::ToolResult {
                    call_id, content, ..
                } => WireMessage {
                    role: "tool".to_string(),
                    content: Some(content.clone()),
                    tool_calls: None,
                    tool_call_id: Some(call_id.clone()),
                },
            })
            .collect()
    }

    fn response_format(&self, request: &CompletionRequest<'_>) -> Option<Value> {
        let output_type = request.prediction?;
        let schema = prediction_schema(output_type);
        match self.structured {
            StructuredOutput::JsonSchema => Some(json!({
                "type": "json_schema",
                "json_schema": {"name": "prediction", "strict": true, "schema": schema},
            })),
            StructuredOutput::JsonObject => Some(json!({"type": "json_object", "schema": schema})),
            StructuredOutput::None => None,
        }
    }

    fn build_body(&self, request: &CompletionRequest<'_>) -> Result<Value, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages: self.wire_messages(request.messages),
            tools: request.tools.map(|schema| vec![wire_tool(schema)]),
            response_format: self.response_format(request),
            temperature: self.temperature,
            reasoning_effort: self.reasoning_effort.as_deref(),
            max_tokens: self.max_tokens,
        };
        let mut body = serde_json::to_value(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        if let (Value::Object(map), Some(Value::Object(extra))) = (&mut body, &self.extra_body) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        Ok(body)
    }
}

fn wire_tool(schema: &ToolSchema) -> WireTool {
    WireTool {
        tool_type: "function",
        function: WireFunction {
            name: schema.name.clone(),
            description: schema.description.clone(),
            strict: true,
            parameters: schema.parameters_json(),
        },
    }
}

/// Remove `<think>...</think>` spans, including the tags.
pub fn remove_think_blocks(text: &str) -> String {
    static THINK: OnceLock<Option<Regex>> = OnceLock::new();
    match THINK.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").ok()) {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

fn parse_response(text: &str, structured: bool) -> Result<Completion, ProviderError> {
    let raw: Value =
        serde_json::from_str(text).map_err(|e| ProviderError::Decode(format!("{}: {}", e, text)))?;
    let parsed: ChatResponse = serde_json::from_value(raw.clone())
        .map_err(|e| ProviderError::Decode(format!("{}: {}", e, text)))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or(ProviderError::EmptyResponse)?;

    if structured && choice.finish_reason.as_deref() == Some("length") {
        return Err(ProviderError::Truncated);
    }

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: ToolArguments::from_encoded(&call.function.arguments),
        })
        .collect();

    Ok(Completion {
        text: choice.message.content,
        tool_calls,
        thinking: Vec::new(),
        raw,
    })
}

#[async_trait]
impl ModelAdapter for OpenAiCompatible {
    async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        let body = self.build_body(request)?;
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
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
        format!("{}/{}", self.provider, self.model)
    }

    fn supports_structured_output(&self) -> bool {
        self.structured != StructuredOutput::None
    }
}
