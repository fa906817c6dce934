//! Executes the model's tool calls against the mystery function.

use super::normalize::{normalize_args, TypeTag};
use super::prompts::{INVALID_JSON_REPLY, MISSING_OUTPUT};
use crate::llm::{Message, ToolArguments, ToolCall};
use crate::printer::Printer;
use crate::scorer::Scorer;
use anyhow::{Context, Result};
use serde_json::Value;

/// One successful observation of the mystery function.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub args: Vec<Value>,
    pub output: Value,
}

/// Display a value the way the transcript shows it: strings bare unless
/// the declared type is `string`, in which case they are double-quoted.
fn format_value(value: &Value, tag: Option<TypeTag>) -> String {
    let bare = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if tag == Some(TypeTag::String) {
        format!("\"{}\"", bare)
    } else {
        bare
    }
}

/// `a` for one argument, `(a, b)` for several.
pub fn format_inputs(args: &[Value], arg_spec: &[TypeTag]) -> String {
    let parts: Vec<String> = args
        .iter()
        .enumerate()
        .map(|(i, v)| format_value(v, arg_spec.get(i).copied()))
        .collect();
    if parts.len() > 1 {
        format!("({})", parts.join(", "))
    } else {
        parts.join(", ")
    }
}

pub fn format_tool_call(
    args: &[Value],
    arg_spec: &[TypeTag],
    output_type: Option<TypeTag>,
    output: &Value,
) -> String {
    format!(
        "{} → {}",
        format_inputs(args, arg_spec),
        format_value(output, output_type)
    )
}

/// Runs tool calls for one attempt and accumulates the evidence.
pub struct ToolCallExecutor<'a> {
    scorer: &'a dyn Scorer,
    attempt_id: &'a str,
    arg_spec: &'a [TypeTag],
    output_type: Option<TypeTag>,
    history: Vec<CallRecord>,
}

impl<'a> ToolCallExecutor<'a> {
    pub fn new(
        scorer: &'a dyn Scorer,
        attempt_id: &'a str,
        arg_spec: &'a [TypeTag],
        output_type: Option<TypeTag>,
    ) -> Self {
        Self {
            scorer,
            attempt_id,
            arg_spec,
            output_type,
            history: Vec::new(),
        }
    }

    /// Run one call and return the tool-result message for the conversation.
    ///
    /// Soft failures (malformed arguments, a scorer-reported error, a missing
    /// output) are printed and answered but leave no evidence. Only transport
    /// and protocol failures from the scorer are returned as errors.
    pub async fn execute(&mut self, call: &ToolCall, printer: &mut Printer) -> Result<Message> {
        let keyed = match &call.arguments {
            ToolArguments::Json(map) => map,
            ToolArguments::Malformed(raw) => {
                tracing::warn!(call_id = %call.id, raw = %raw, "tool call arguments are not valid JSON");
                printer.indented_print(format!("{} → {}", raw, INVALID_JSON_REPLY));
                return Ok(self.reply(call, INVALID_JSON_REPLY.to_string()));
            }
        };
        let args = normalize_args(keyed);

        let response = self
            .scorer
            .test_function(self.attempt_id, &args)
            .await
            .context("test-function request failed")?;

        let (output, failed) = match response.output {
            Some(output) => (output, response.error),
            None => (Value::String(MISSING_OUTPUT.to_string()), true),
        };

        printer.indented_print(format_tool_call(&args, self.arg_spec, self.output_type, &output));

        let content = serde_json::to_string(&output).context("Failed to encode tool output")?;
        if !failed {
            self.history.push(CallRecord { args, output });
        }
        Ok(self.reply(call, content))
    }

    fn reply(&self, call: &ToolCall, content: String) -> Message {
        Message::ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content,
        }
    }

    pub fn history(&self) -> &[CallRecord] {
        &self.history
    }

    pub fn into_history(self) -> Vec<CallRecord> {
        self.history
    }
}

/// One line per successful call, in call order.
pub fn format_call_history(
    history: &[CallRecord],
    arg_spec: &[TypeTag],
    output_type: Option<TypeTag>,
) -> String {
    history
        .iter()
        .map(|record| format_tool_call(&record.args, arg_spec, output_type, &record.output))
        .collect::<Vec<_>>()
        .join("\n")
}
