//! The verification loop.
//!
//! Fetch a case, ask for a prediction, parse it, submit it. A `wrong`
//! verdict fails the attempt at once; running out of cases or a `done`
//! verdict passes it.

use super::executor::format_inputs;
use super::normalize::{normalize_value, TypeTag};
use super::parse::{parse_prediction, Prediction};
use super::prompts::verification_message;
use crate::llm::{CompletionRequest, Message, ProviderError, RateLimitedModel, VerificationContext};
use crate::printer::Printer;
use crate::scorer::{Scorer, VerificationStatus};
use anyhow::{Context, Result};
use serde_json::Value;

/// Model calls per case before an unparseable answer counts as a failure.
pub const PARSE_ATTEMPTS: u32 = 3;

/// Render a verification input the way tool calls are shown.
pub fn format_verification_input(input: &Value, arg_spec: &[TypeTag]) -> String {
    match input {
        Value::Array(values) => format_inputs(values, arg_spec),
        Value::Object(_) => match normalize_value(input) {
            Ok(values) => format_inputs(&values, arg_spec),
            Err(_) => input.to_string(),
        },
        scalar => format_inputs(std::slice::from_ref(scalar), arg_spec),
    }
}

fn display_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VerificationTarget<'a> {
    pub attempt_id: &'a str,
    pub arg_spec: &'a [TypeTag],
    /// Whether the conversation still shows tool calls the model can no
    /// longer make.
    pub tool_withdrawn: bool,
}

/// Ask for a prediction until one parses. `None` means give up on this case.
async fn request_prediction(
    model: &RateLimitedModel,
    request: &CompletionRequest<'_>,
    printer: &mut Printer,
) -> Result<Option<Prediction>> {
    for attempt in 1..=PARSE_ATTEMPTS {
        let completion = match model.complete(request).await {
            Ok(completion) => completion,
            Err(ProviderError::Truncated) => {
                printer.print("\n### SYSTEM: prediction was cut off at the output token limit");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let text = completion.text.unwrap_or_default();
        match parse_prediction(&text) {
            Ok(prediction) => return Ok(Some(prediction)),
            Err(err) => {
                printer.print(format!("\n### SYSTEM: parse attempt {} failed: {}", attempt, err));
                tracing::warn!(attempt, error = %err, "unparseable prediction");
            }
        }
    }
    Ok(None)
}

pub async fn verify(
    model: &RateLimitedModel,
    scorer: &dyn Scorer,
    target: VerificationTarget<'_>,
    messages: &[Message],
    printer: &mut Printer,
) -> Result<bool> {
    let mut cases = 0u32;

    while let Some(case) = scorer
        .next_verification(target.attempt_id)
        .await
        .context("next-verification request failed")?
    {
        cases += 1;
        let formatted = format_verification_input(&case.input, target.arg_spec);
        printer.print("\n### SYSTEM: inputs:");
        printer.indented_print(&formatted);

        let prompt = verification_message(&formatted, target.tool_withdrawn);
        let mut vmessages: Vec<Message> = match model.adapter().verification_context() {
            VerificationContext::Full => messages.to_vec(),
            VerificationContext::LastMessage => messages.last().cloned().into_iter().collect(),
        };
        vmessages.push(prompt);

        let structured = model.adapter().supports_structured_output();
        let request = CompletionRequest::new(&vmessages)
            .with_prediction(if structured { case.output_type } else { None });

        let Some(prediction) = request_prediction(model, &request, printer).await? else {
            printer.print("\n### SYSTEM: no usable prediction");
            printer.print("\n### SYSTEM: WRONG");
            return Ok(false);
        };

        printer.print("\n--- LLM ---");
        printer.indented_print(&prediction.thoughts);
        printer.print("");
        printer.indented_print(format!("`{}`", display_output(&prediction.expected_output)));

        let status = scorer
            .attempt_verification(target.attempt_id, &prediction.expected_output)
            .await
            .context("attempt-verification request failed")?;

        if status == VerificationStatus::Wrong {
            printer.print("\n### SYSTEM: WRONG");
            return Ok(false);
        }
        printer.print("\n### SYSTEM: CORRECT");
        if status == VerificationStatus::Done {
            break;
        }
    }

    if cases == 0 {
        tracing::warn!(attempt_id = target.attempt_id, "scorer issued no verification cases");
    }
    Ok(true)
}
