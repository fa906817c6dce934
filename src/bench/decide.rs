use super::prompts::decision_messages;
use crate::llm::{CompletionRequest, Message, RateLimitedModel};
use crate::printer::Printer;
use anyhow::Result;

/// Ask the model to explain the function from the call history alone.
///
/// Returns a fresh conversation (the evidence prompt plus the model's
/// hypothesis) for verification to continue from. The hypothesis is only
/// printed, never parsed.
pub async fn decide(
    model: &RateLimitedModel,
    call_history: &str,
    printer: &mut Printer,
) -> Result<Vec<Message>> {
    let mut messages = decision_messages(call_history);
    let completion = model.complete(&CompletionRequest::new(&messages)).await?;

    printer.print("\n--- LLM ---");
    printer.indented_print(completion.text.as_deref().unwrap_or_default());

    messages.push(completion.to_message());
    Ok(messages)
}
