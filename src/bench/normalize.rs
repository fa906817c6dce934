//! Positional argument keys.
//!
//! Several providers only accept named tool parameters, so the argument list
//! is offered as keys `a`, `b`, `c`... and recovered by sorting the keys of
//! whatever map the model sends back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Keys available for positional arguments.
pub const MAX_ARGUMENTS: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    String,
    Integer,
    Boolean,
    Float,
}

impl TypeTag {
    /// JSON Schema spelling; floats are `number`.
    pub fn json_schema_type(&self) -> &'static str {
        match self {
            TypeTag::String => "string",
            TypeTag::Integer => "integer",
            TypeTag::Boolean => "boolean",
            TypeTag::Float => "number",
        }
    }

    /// OpenAPI-subset spelling used by Gemini.
    pub fn openapi_type(&self) -> &'static str {
        match self {
            TypeTag::String => "STRING",
            TypeTag::Integer => "INTEGER",
            TypeTag::Boolean => "BOOLEAN",
            TypeTag::Float => "NUMBER",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::String => "string",
            TypeTag::Integer => "integer",
            TypeTag::Boolean => "boolean",
            TypeTag::Float => "float",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{0} arguments is more than the 26 positional keys available")]
    TooManyArguments(usize),
    #[error("tool arguments are not a JSON object")]
    NotAnObject,
}

fn positional_key(index: usize) -> String {
    char::from(b'a' + index as u8).to_string()
}

/// Key each type by its position: `a` for the first, `b` for the second...
pub fn assign_positional_keys(types: &[TypeTag]) -> Result<BTreeMap<String, TypeTag>, NormalizeError> {
    if types.len() > MAX_ARGUMENTS {
        return Err(NormalizeError::TooManyArguments(types.len()));
    }
    Ok(types
        .iter()
        .enumerate()
        .map(|(i, tag)| (positional_key(i), *tag))
        .collect())
}

/// Key a list of values the same way.
pub fn key_values(values: &[Value]) -> Result<Map<String, Value>, NormalizeError> {
    if values.len() > MAX_ARGUMENTS {
        return Err(NormalizeError::TooManyArguments(values.len()));
    }
    Ok(values
        .iter()
        .enumerate()
        .map(|(i, v)| (positional_key(i), v.clone()))
        .collect())
}

/// Values ordered by ascending key.
pub fn normalize_args(keyed: &Map<String, Value>) -> Vec<Value> {
    let mut entries: Vec<(&String, &Value)> = keyed.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, v)| v.clone()).collect()
}

pub fn normalize_value(value: &Value) -> Result<Vec<Value>, NormalizeError> {
    match value {
        Value::Object(map) => Ok(normalize_args(map)),
        _ => Err(NormalizeError::NotAnObject),
    }
}
