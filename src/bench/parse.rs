//! Pull a `{thoughts, expected_output}` prediction out of model text.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub thoughts: String,
    pub expected_output: Value,
}

#[derive(Debug, Error, PartialEq)]
pub enum PredictionError {
    #[error("no JSON object in response")]
    NoObject,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing key `{0}`")]
    MissingKey(&'static str),
}

/// The last complete brace-enclosed block in `s`, nested braces included.
///
/// Unmatched braces are ignored. Of several blocks, the one whose closing
/// brace comes last wins, which is the outermost block of the final region.
/// Returns `""` when there is no complete block.
pub fn last_brace_block(s: &str) -> &str {
    let mut stack: Vec<usize> = Vec::new();
    let mut last: Option<(usize, usize)> = None;

    for (i, c) in s.char_indices() {
        match c {
            '{' => stack.push(i),
            '}' => {
                if let Some(start) = stack.pop() {
                    last = Some((start, i));
                }
            }
            _ => {}
        }
    }

    match last {
        Some((start, end)) => &s[start..=end],
        None => "",
    }
}

/// Parse a prediction from free text that may wrap the JSON in chatter or
/// code fences. Keys other than the two required are ignored.
pub fn parse_prediction(text: &str) -> Result<Prediction, PredictionError> {
    let block = last_brace_block(text);
    if block.is_empty() {
        return Err(PredictionError::NoObject);
    }
    let value: Value =
        serde_json::from_str(block).map_err(|e| PredictionError::InvalidJson(e.to_string()))?;
    prediction_from_value(&value)
}

pub fn prediction_from_value(value: &Value) -> Result<Prediction, PredictionError> {
    let thoughts = value
        .get("thoughts")
        .ok_or(PredictionError::MissingKey("thoughts"))?;
    let expected_output = value
        .get("expected_output")
        .ok_or(PredictionError::MissingKey("expected_output"))?;

    Ok(Prediction {
        thoughts: match thoughts {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        expected_output: expected_output.clone(),
    })
}
