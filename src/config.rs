//! Configuration management for the benchmark client
//!
//! Two TOML files live in a resources directory:
//! - `config.toml`: server URL, run mode, per-provider model settings
//! - `credentials.toml`: database URL and API keys
//!
//! The resources directory is `$SHERLOCKBENCH_RESOURCES`, else `./resources`,
//! else `~/.config/sherlockbench`.

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const CREDENTIALS_FILE: &str = "credentials.toml";

/// LLM vendors the client can drive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[value(name = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Google,
    #[value(name = "deepseek")]
    #[serde(rename = "deepseek")]
    DeepSeek,
    Fireworks,
    Xai,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::DeepSeek => "deepseek",
            Provider::Fireworks => "fireworks",
            Provider::Xai => "xai",
        }
    }

    /// Environment variable that overrides the stored key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
            Provider::DeepSeek => "DEEPSEEK_API_KEY",
            Provider::Fireworks => "FIREWORKS_API_KEY",
            Provider::Xai => "XAI_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-phase: investigate then verify in the same conversation.
/// Three-phase: investigate, decide from the call history alone, verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum RunMode {
    #[serde(rename = "2-phase")]
    #[value(name = "2-phase")]
    TwoPhase,
    #[serde(rename = "3-phase")]
    #[value(name = "3-phase")]
    ThreePhase,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::TwoPhase => "2-phase",
            RunMode::ThreePhase => "3-phase",
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::TwoPhase
    }
}

/// Settings for one model under `[providers.<provider>.<name>]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelSettings {
    /// Identifier sent to the vendor API.
    pub model: String,
    /// Minimum seconds between model calls.
    #[serde(default)]
    pub rate_limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Merged verbatim into OpenAI-compatible request bodies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_body: Option<serde_json::Value>,
    /// Remove `<think>...</think>` spans before replaying assistant turns.
    #[serde(default)]
    pub strip_think_blocks: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct JudgeRef {
    provider: Provider,
    model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    base_url: String,
    #[serde(default)]
    default_run_mode: RunMode,
    #[serde(default)]
    subset: Option<String>,
    #[serde(default)]
    decision: Option<JudgeRef>,
    #[serde(default)]
    providers: BTreeMap<Provider, BTreeMap<String, ModelSettings>>,
}

/// A provider/model pair with resolved settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelTarget {
    pub provider: Provider,
    pub model_name: String,
    #[serde(flatten)]
    pub settings: ModelSettings,
}

impl ModelTarget {
    /// `provider/model` as sent to the scorer in `client-id`.
    pub fn client_id(&self) -> String {
        format!("{}/{}", self.provider, self.settings.model)
    }
}

/// Non-sensitive configuration for one run. This is the snapshot stored in
/// `runs.config` and restored when a failed run is resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    pub base_url: String,
    pub run_mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<String>,
    pub target: ModelTarget,
    /// Fixed judge model for the decision and verification phases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ModelTarget>,
    /// Set by the scorer when the run starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_type: Option<String>,
}

impl RunConfig {
    /// Load the configuration for `provider`/`model_name` from the default
    /// resources directory.
    pub fn load(provider: Provider, model_name: &str) -> Result<Self> {
        Self::load_from(&resources_dir(), provider, model_name)
    }

    pub fn load_from(dir: &Path, provider: Provider, model_name: &str) -> Result<Self> {
        let file = read_config_file(dir)?;
        let target = lookup_model(&file, provider, model_name)?;
        let decision = match &file.decision {
            Some(judge) => Some(lookup_model(&file, judge.provider, &judge.model)?),
            None => None,
        };

        Ok(RunConfig {
            base_url: file.base_url,
            run_mode: file.default_run_mode,
            subset: file.subset,
            target,
            decision,
            run_type: None,
        })
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).context("Failed to serialize run config")
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).context("Stored run config is not readable")
    }
}

/// Server base URL only, for commands that don't need a model.
pub fn load_base_url() -> Result<String> {
    Ok(read_config_file(&resources_dir())?.base_url)
}

fn read_config_file(dir: &Path) -> Result<ConfigFile> {
    let path = dir.join(CONFIG_FILE);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn lookup_model(file: &ConfigFile, provider: Provider, model_name: &str) -> Result<ModelTarget> {
    let models = file
        .providers
        .get(&provider)
        .ok_or_else(|| anyhow!("No [providers.{}] section in {}", provider, CONFIG_FILE))?;
    let settings = models.get(model_name).cloned().ok_or_else(|| {
        let known = models.keys().cloned().collect::<Vec<_>>().join(", ");
        anyhow!(
            "Unknown model '{}' for provider {} (configured: {})",
            model_name,
            provider,
            known
        )
    })?;
    Ok(ModelTarget {
        provider,
        model_name: model_name.to_string(),
        settings,
    })
}

/// Secrets. Never written to the database.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Credentials {
    #[serde(default)]
    postgres_url: Option<String>,
    #[serde(default)]
    api_keys: BTreeMap<String, String>,
}

impl Credentials {
    /// Load `credentials.toml`; a missing file yields empty credentials so
    /// environment variables alone can be used.
    pub fn load() -> Result<Self> {
        Self::load_from(&resources_dir())
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CREDENTIALS_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// `DATABASE_URL` takes precedence over the file.
    pub fn database_url(&self) -> Result<String> {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return Ok(url);
        }
        self.postgres_url
            .clone()
            .ok_or_else(|| anyhow!("No postgres-url in {} and DATABASE_URL is unset", CREDENTIALS_FILE))
    }

    /// Environment variable, then credentials file, then system keychain.
    pub fn api_key(&self, provider: Provider) -> Option<String> {
        if let Ok(key) = std::env::var(provider.api_key_env()) {
            if !key.is_empty() {
                return Some(key);
            }
        }
        if let Some(key) = self.api_keys.get(provider.as_str()).filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        match crate::keyring::get_api_key(provider.as_str()) {
            Ok(key) => key,
            Err(err) => {
                crate::keyring::warn_keychain_error_once(provider.as_str(), &err);
                None
            }
        }
    }
}

/// Directory holding `config.toml` and `credentials.toml`.
pub fn resources_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SHERLOCKBENCH_RESOURCES") {
        return PathBuf::from(dir);
    }
    let local = PathBuf::from("resources");
    if local.join(CONFIG_FILE).exists() {
        return local;
    }
    dirs::config_dir()
        .map(|p| p.join("sherlockbench"))
        .unwrap_or(local)
}
