//! Retry Policy
//!
//! Wraps a remote call (or a whole invoke-and-wait unit) with bounded
//! exponential backoff. Only errors accepted by the classifier are retried;
//! everything else is returned on the first failure.

use crate::domain::context::OperationContext;
use crate::error::{Error, ErrorClass, Result, THROTTLING_CODES};
use crate::observability::MigrationEvent;
use crate::serde_util::seconds;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Randomization applied to each backoff delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Use the computed delay as is
    None,
    /// Uniform in `[0, delay]`
    #[default]
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`
    Equal,
}

/// Which errors are worth another attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Remote error codes to retry
    pub codes: Vec<String>,
    /// Retry when a waiter hit a failure rule
    pub waiter_failures: bool,
    /// Retry when a waiter ran out of attempts
    pub waiter_timeouts: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            codes: THROTTLING_CODES.iter().map(|c| c.to_string()).collect(),
            waiter_failures: false,
            waiter_timeouts: false,
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "seconds")]
    pub base_delay: Duration,
    /// Cap applied before jitter
    #[serde(with = "seconds")]
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    pub jitter: JitterStrategy,
    pub retry_on: ClassifierConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: JitterStrategy::Full,
            retry_on: ClassifierConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt + 1`, before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Configuration(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(Error::Configuration(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::Configuration(
                "retry max_delay must not be below base_delay".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Decides whether an error is worth another attempt
pub trait ErrorClassifier: Send + Sync {
    fn is_retryable(&self, error: &Error) -> bool;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&Error) -> bool + Send + Sync,
{
    fn is_retryable(&self, error: &Error) -> bool {
        self(error)
    }
}

/// Classifier driven by [`ClassifierConfig`]
#[derive(Debug, Clone)]
pub struct CodeClassifier {
    config: ClassifierConfig,
}

impl CodeClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }
}

impl ErrorClassifier for CodeClassifier {
    fn is_retryable(&self, error: &Error) -> bool {
        let root = root_cause(error);
        if let Some(code) = root.remote_code() {
            return self.config.codes.iter().any(|c| c == code);
        }
        match root {
            Error::WaiterRuleFailure { .. } => self.config.waiter_failures,
            Error::WaiterTimeout { .. } => self.config.waiter_timeouts,
            _ => false,
        }
    }
}

fn root_cause(error: &Error) -> &Error {
    match error {
        Error::Stage { cause, .. } | Error::RunAborted { cause, .. } => root_cause(cause),
        other => other,
    }
}

pub type ErrorClassifierRef = Arc<dyn ErrorClassifier>;

// =============================================================================
// Policy
// =============================================================================

/// Bounded exponential backoff filtered by a classifier
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    classifier: ErrorClassifierRef,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, classifier: ErrorClassifierRef) -> Self {
        Self { config, classifier }
    }

    /// Policy using the configured code classifier
    pub fn from_config(config: RetryConfig) -> Self {
        let classifier = Arc::new(CodeClassifier::new(config.retry_on.clone()));
        Self::new(config, classifier)
    }

    pub fn none() -> Self {
        Self::from_config(RetryConfig::none())
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number. On exhaustion the
    /// last error is returned unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        ctx: &OperationContext,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            ctx.check_cancelled()?;

            let err = match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.class() == ErrorClass::Cancelled || !self.classifier.is_retryable(&err) {
                debug!(operation, attempt, error = %err, "Error is not retryable");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(operation, attempt, error = %err, "Retry attempts exhausted");
                return Err(err);
            }

            let delay = self.delay(attempt);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient failure"
            );
            ctx.emit(MigrationEvent::RetryAttempt {
                run_id: ctx.run_id().to_string(),
                stage: ctx.stage().to_string(),
                operation: operation.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });

            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }

    /// Jittered delay after failed attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.config.backoff(attempt);
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self.config.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => Duration::from_millis(rng.gen_range(0..=ms)),
            JitterStrategy::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.gen_range(0..=ms - half))
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(RetryConfig::default())
    }
}
