use crate::llm::Message;

const INVESTIGATION_SYSTEM: &str = r#"You are a competent and alert chatbot.

You are provided with a mystery function which you will "interrogate" to try to determine what it does. Use the provided tool to do this.

Once you are confident you know what the function does, you will inform the user.

n.b. it is your job to pick inputs for the mystery function. Do not ask the user to provide you with parameters to test. Test the function pro-actively with the provided tool until you work out what the mystery function does.
"#;

const DECISION_SYSTEM: &str =
    "You are a competent and alert chatbot. You will help to investigate a mystery function.";

pub const TOOL_NAME: &str = "mystery_function";
pub const TOOL_DESCRIPTION: &str = "Use this tool to test the mystery function.";

/// Reply sent for a tool call whose arguments weren't valid JSON.
pub const INVALID_JSON_REPLY: &str = "invalid json when calling tool";

/// Output substituted when the scorer's response has no `output`.
pub const MISSING_OUTPUT: &str = "Error calling tool";

pub fn initial_messages(test_limit: u32) -> Vec<Message> {
    vec![
        Message::system(INVESTIGATION_SYSTEM),
        Message::user(format!(
            "Hi. I have a mystery function and I want to find out what it does.

I would like you to test my function using the provided tool until you think you know what it does, then tell me.

You may test this function up-to {} times.",
            test_limit
        )),
    ]
}

pub fn decision_messages(examples: &str) -> Vec<Message> {
    vec![
        Message::system(DECISION_SYSTEM),
        Message::user(format!(
            "I have a mystery function and I want you to figure out what it does.

Here are some examples of the function's input and output:

{}

Based on these examples, please determine what the function does and summarise.",
            examples
        )),
    ]
}

/// Ask for a prediction. `tool_withdrawn` adds the note that the tool is no
/// longer available, used when the conversation still shows tool traffic.
pub fn verification_message(formatted_input: &str, tool_withdrawn: bool) -> Message {
    let withdrawn = if tool_withdrawn {
        "You no-longer have access to the tool because I am testing if you have got it right.\n\n"
    } else {
        ""
    };
    Message::user(format!(
        "To test your theory, please tell me what is the expected output from the function with this input:

{}

{}Please respond in JSON with two keys: \"thoughts\" and \"expected_output\".
expected_output should contain the output you expect from the function.",
        formatted_input, withdrawn
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_text(message: &Message) -> &str {
        match message {
            Message::User(text) => text,
            other => panic!("expected user message, got {:?}", other),
        }
    }

    #[test]
    fn test_initial_messages_mention_limit() {
        let messages = initial_messages(12);
        assert!(matches!(messages[0], Message::System(_)));
        assert!(user_text(&messages[1]).ends_with("You may test this function up-to 12 times."));
    }

    #[test]
    fn test_decision_embeds_examples() {
        let messages = decision_messages("(3, 4) → 7\n(1, 1) → 2");
        assert!(user_text(&messages[1]).contains("output:\n\n(3, 4) → 7\n(1, 1) → 2\n\nBased"));
    }

    #[test]
    fn test_verification_message_variants() {
        let two_phase = verification_message("(5, 5)", true);
        assert!(user_text(&two_phase).contains("no-longer have access"));
        assert!(user_text(&two_phase).contains("input:\n\n(5, 5)\n\n"));

        let three_phase = verification_message("(5, 5)", false);
        assert!(!user_text(&three_phase).contains("no-longer"));
        assert!(user_text(&three_phase).contains("\"thoughts\" and \"expected_output\""));
    }
}
