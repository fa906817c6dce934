//! Provider API keys in the system keychain
//!
//! All keys live in a single keychain entry, stored as JSON keyed by
//! provider name, so a run only ever triggers one keychain prompt.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

const KEYRING_SERVICE: &str = "sherlockbench-credentials";
const KEYRING_USERNAME: &str = "default";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    api_keys: BTreeMap<String, String>,
}

type KeyringResult<T> = Result<T, String>;

static CREDENTIALS_CACHE: OnceLock<Mutex<Option<StoredCredentials>>> = OnceLock::new();
static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

fn credentials_cache() -> &'static Mutex<Option<StoredCredentials>> {
    CREDENTIALS_CACHE.get_or_init(|| Mutex::new(None))
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("SHERLOCKBENCH_DISABLE_KEYRING")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

/// Warn about keychain errors only once per process
pub fn warn_keychain_error_once(context: &str, err: &str) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    tracing::warn!(context, error = err, "couldn't access system keychain");
    eprintln!("  Tip: set <PROVIDER>_API_KEY or use resources/credentials.toml to bypass the keychain.");
}

fn read_credentials_uncached() -> KeyringResult<StoredCredentials> {
    if keyring_disabled() {
        return Ok(StoredCredentials::default());
    }
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    match entry.get_password() {
        Ok(json) => {
            serde_json::from_str(&json).map_err(|e| format!("Failed to parse credentials: {}", e))
        }
        Err(keyring::Error::NoEntry) => Ok(StoredCredentials::default()),
        Err(err) => Err(err.to_string()),
    }
}

fn read_credentials_cached() -> KeyringResult<StoredCredentials> {
    let mut guard = match credentials_cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(creds) = guard.as_ref() {
        return Ok(creds.clone());
    }
    let creds = read_credentials_uncached()?;
    *guard = Some(creds.clone());
    Ok(creds)
}

fn write_credentials(creds: &StoredCredentials) -> Result<(), String> {
    if keyring_disabled() {
        return Err("System keychain is disabled".to_string());
    }
    let json = serde_json::to_string(creds).map_err(|e| e.to_string())?;
    let entry = keyring_entry().map_err(|e| e.to_string())?;
    entry.set_password(&json).map_err(|e| e.to_string())?;

    let mut guard = match credentials_cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(creds.clone());
    Ok(())
}

/// Get a provider's API key from the keychain
pub fn get_api_key(provider: &str) -> KeyringResult<Option<String>> {
    let creds = read_credentials_cached()?;
    Ok(creds.api_keys.get(provider).cloned())
}

/// Store a provider's API key in the keychain
pub fn set_api_key(provider: &str, key: &str) -> Result<(), String> {
    let mut creds = read_credentials_cached().unwrap_or_default();
    creds.api_keys.insert(provider.to_string(), key.to_string());
    write_credentials(&creds)
}
