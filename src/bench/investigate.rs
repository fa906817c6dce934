//! The investigation loop: let the model call the mystery function until it
//! stops on its own.

use super::executor::{CallRecord, ToolCallExecutor};
use super::normalize::{assign_positional_keys, NormalizeError, TypeTag};
use super::prompts::{TOOL_DESCRIPTION, TOOL_NAME};
use crate::llm::{CompletionRequest, Message, RateLimitedModel, ToolSchema};
use crate::printer::Printer;
use crate::scorer::Scorer;
use anyhow::Result;

/// Turns allowed beyond the test limit before the loop gives up. The test
/// limit itself is enforced by the scorer; this only catches a model that
/// keeps talking without finishing.
pub const TURN_HEADROOM: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum InvestigationOutcome {
    /// The model answered without calling the tool.
    Completed {
        call_history: Vec<CallRecord>,
        tool_calls: u32,
    },
    /// Every turn was spent without reaching a final answer.
    Overrun { turns: u32 },
}

pub fn mystery_function_schema(arg_spec: &[TypeTag]) -> Result<ToolSchema, NormalizeError> {
    Ok(ToolSchema {
        name: TOOL_NAME.to_string(),
        description: TOOL_DESCRIPTION.to_string(),
        parameters: assign_positional_keys(arg_spec)?,
    })
}

/// Inputs the loop needs from the attempt.
#[derive(Debug, Clone, Copy)]
pub struct InvestigationTarget<'a> {
    pub attempt_id: &'a str,
    pub arg_spec: &'a [TypeTag],
    pub output_type: Option<TypeTag>,
    pub test_limit: u32,
}

/// Run the loop, appending every turn to `messages`.
pub async fn investigate(
    model: &RateLimitedModel,
    scorer: &dyn Scorer,
    target: InvestigationTarget<'_>,
    messages: &mut Vec<Message>,
    printer: &mut Printer,
) -> Result<InvestigationOutcome> {
    let schema = mystery_function_schema(target.arg_spec)?;
    let mut executor =
        ToolCallExecutor::new(scorer, target.attempt_id, target.arg_spec, target.output_type);
    let max_turns = target.test_limit + TURN_HEADROOM;
    let mut tool_calls = 0u32;

    for turn in 1..=max_turns {
        let completion = model
            .complete(&CompletionRequest::new(messages.as_slice()).with_tools(&schema))
            .await?;

        printer.print("\n--- LLM ---");
        printer.indented_print(completion.text.as_deref().unwrap_or_default());

        if completion.tool_calls.is_empty() {
            printer.print(format!("\n### SYSTEM: The tool was used {} times.", tool_calls));
            messages.push(completion.to_message());
            tracing::debug!(turn, tool_calls, "investigation finished");
            return Ok(InvestigationOutcome::Completed {
                call_history: executor.into_history(),
                tool_calls,
            });
        }

        printer.print("\n### SYSTEM: calling tool");
        messages.push(completion.to_message());
        for call in &completion.tool_calls {
            let reply = executor.execute(call, printer).await?;
            messages.push(reply);
            tool_calls += 1;
        }
    }

    tracing::warn!(turns = max_turns, tool_calls, "investigation loop overrun");
    Ok(InvestigationOutcome::Overrun { turns: max_turns })
}
