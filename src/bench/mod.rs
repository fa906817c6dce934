//! The investigate / decide / verify protocol.
//!
//! One attempt is one conversation: the model tests the mystery function
//! through a tool (`investigate`), optionally summarises what it learned
//! from the call history alone (`decide`), then predicts outputs for
//! server-chosen inputs (`verify`). `attempt::run_attempt` strings the phases
//! together for a run mode.

pub mod attempt;
pub mod decide;
pub mod executor;
pub mod investigate;
pub mod normalize;
pub mod parse;
pub mod prompts;
pub mod verify;

#[cfg(test)]
mod tests;

use thiserror::Error;

pub use attempt::{run_attempt, AttemptEnv, AttemptReport};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Investigation loop overrun after {turns} turns.")]
    InvestigationOverrun { turns: u32 },
    #[error("run can't be resumed: {0}")]
    UnresumableRun(String),
    #[error("no API key for {0}; set {1} or add it to credentials.toml")]
    MissingApiKey(String, String),
}

impl HarnessError {
    pub fn variant_name(&self) -> &'static str {
        match self {
            HarnessError::InvestigationOverrun { .. } => "InvestigationOverrun",
            HarnessError::UnresumableRun(_) => "UnresumableRun",
            HarnessError::MissingApiKey(..) => "MissingApiKey",
        }
    }
}
