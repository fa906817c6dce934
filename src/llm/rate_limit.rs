use super::{Completion, CompletionRequest, ModelAdapter, ProviderError};
use crate::config::Provider;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const MAX_ATTEMPTS: u32 = 3;
/// Added to the minimum spacing every time a retry happens.
const SPACING_STEP: Duration = Duration::from_secs(1);

/// One `(predicate, backoff)` pair. Rules are checked in order.
#[derive(Clone)]
pub struct RetryRule {
    pub name: &'static str,
    pub matches: fn(&ProviderError) -> bool,
    pub backoff: Duration,
}

impl std::fmt::Debug for RetryRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryRule")
            .field("name", &self.name)
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    rules: Vec<RetryRule>,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            rules: Vec::new(),
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub fn rule(
        mut self,
        name: &'static str,
        matches: fn(&ProviderError) -> bool,
        backoff_secs: u64,
    ) -> Self {
        self.rules.push(RetryRule {
            name,
            matches,
            backoff: Duration::from_secs(backoff_secs),
        });
        self
    }

    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::OpenAi => Self::none()
                .rule("timeout", ProviderError::is_timeout, 300)
                .rule("server error", ProviderError::is_server_error, 60),
            Provider::Anthropic => {
                Self::none().rule("overloaded", ProviderError::is_overloaded, 600)
            }
            Provider::Google => Self::none()
                .rule("server error", ProviderError::is_server_error, 60)
                .rule("no candidates", ProviderError::is_empty_response, 60),
            Provider::DeepSeek | Provider::Xai | Provider::Fireworks => Self::none(),
        }
    }

    /// Backoff for the first rule matching `err`.
    pub fn backoff_for(&self, err: &ProviderError) -> Option<Duration> {
        self.rules
            .iter()
            .find(|rule| (rule.matches)(err))
            .map(|rule| rule.backoff)
    }
}

#[derive(Debug)]
struct Spacing {
    min_interval: Duration,
    last_call: Option<Instant>,
}

/// A model adapter behind a minimum call spacing and a retry policy.
///
/// `total_calls` counts logical calls (one per `complete`), not retries.
pub struct RateLimitedModel {
    adapter: Box<dyn ModelAdapter>,
    policy: RetryPolicy,
    spacing: Mutex<Spacing>,
    total_calls: AtomicU64,
}

impl RateLimitedModel {
    pub fn new(adapter: Box<dyn ModelAdapter>, rate_limit_secs: f64, policy: RetryPolicy) -> Self {
        Self {
            adapter,
            policy,
            spacing: Mutex::new(Spacing {
                min_interval: Duration::from_secs_f64(rate_limit_secs.max(0.0)),
                last_call: None,
            }),
            total_calls: AtomicU64::new(0),
        }
    }

    pub fn adapter(&self) -> &dyn ModelAdapter {
        self.adapter.as_ref()
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub async fn min_interval(&self) -> Duration {
        self.spacing.lock().await.min_interval
    }

    pub async fn complete(&self, request: &CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut spacing = self.spacing.lock().await;

        if let Some(last) = spacing.last_call {
            let ready_at = last + spacing.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            spacing.last_call = Some(Instant::now());

            let err = match self.adapter.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(err) => err,
            };
            let Some(backoff) = self.policy.backoff_for(&err) else {
                return Err(err);
            };

            spacing.min_interval += SPACING_STEP;
            println!("\n{}", err);
            println!(
                "\n### SYSTEM: backing off for {} seconds and increasing rate limit to {} seconds (retry {}/{})",
                backoff.as_secs(),
                spacing.min_interval.as_secs_f64(),
                attempt,
                self.policy.max_attempts
            );
            tracing::warn!(
                model = %self.adapter.name(),
                error = %err,
                attempt,
                "retryable provider error"
            );

            if attempt >= self.policy.max_attempts {
                return Err(err);
            }
            tokio::time::sleep(backoff).await;
        }
    }
}
