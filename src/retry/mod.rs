//! Staged retry for one logical call to the generative API.
//!
//! Truncation raises the output-token budget, malformed output repeats the
//! call at the same budget, and a response that is still incomplete after a
//! downshift can be handed to a one-shot segment retry. Everything else is
//! returned to the caller on the first failure.

use std::future::{Future, Ready};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{GenerationError, GenerationResult};

/// Growth applied to the output-token budget after a truncation.
pub const BUDGET_SCALE_FACTOR: f64 = 1.5;

/// Which retry path produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStage {
    Primary,
    Downshift,
    Segment,
}

impl RetryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStage::Primary => "primary",
            RetryStage::Downshift => "downshift",
            RetryStage::Segment => "segment",
        }
    }
}

impl std::fmt::Display for RetryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttemptContext {
    /// Zero-based.
    pub attempt_index: u32,
    pub stage: RetryStage,
    pub max_output_tokens: u32,
}

/// Why a response that did not fail is still incomplete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    MaxOutputTokens,
    Other(String),
}

impl IncompleteReason {
    /// Map a wire `incomplete_details.reason`.
    pub fn parse(reason: &str) -> Self {
        match reason {
            "max_output_tokens" => IncompleteReason::MaxOutputTokens,
            other => IncompleteReason::Other(other.to_string()),
        }
    }
}

/// Successful result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome<T> {
    pub value: T,
    pub incomplete_reason: Option<IncompleteReason>,
}

impl<T> AttemptOutcome<T> {
    /// A complete result.
    pub fn complete(value: T) -> Self {
        Self {
            value,
            incomplete_reason: None,
        }
    }

    /// A result the API flagged as incomplete.
    pub fn incomplete(value: T, reason: IncompleteReason) -> Self {
        Self {
            value,
            incomplete_reason: Some(reason),
        }
    }

    fn hit_token_ceiling(&self) -> bool {
        self.incomplete_reason == Some(IncompleteReason::MaxOutputTokens)
    }
}

/// Final result of [`run_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub result: T,
    /// Every call made, segment included.
    pub attempts: u32,
    /// Budget of the call whose result was accepted.
    pub max_output_tokens: u32,
    /// Accepted result is still flagged incomplete.
    pub truncated: bool,
}

/// Budget and attempt limits.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    pub initial_max_output_tokens: u32,
    pub max_output_tokens_cap: u32,
    pub min_output_tokens: u32,
    pub max_attempts: u32,
    /// Base delay between retries; zero disables sleeping.
    pub backoff_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), 1024)
    }
}

impl RetryOptions {
    pub fn from_config(config: &RetryConfig, initial_max_output_tokens: u32) -> Self {
        Self {
            initial_max_output_tokens,
            max_output_tokens_cap: config.max_output_tokens_cap,
            min_output_tokens: config.min_output_tokens,
            max_attempts: config.max_attempts,
            backoff_ms: config.backoff_ms,
        }
    }

    pub fn with_budget(mut self, initial: u32, min: u32, cap: u32) -> Self {
        self.initial_max_output_tokens = initial;
        self.min_output_tokens = min;
        self.max_output_tokens_cap = cap;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    /// Budget for the attempt after a truncation at `current`.
    pub fn scaled_budget(&self, current: u32) -> u32 {
        let scaled = (current as f64 * BUDGET_SCALE_FACTOR).ceil() as u32;
        let cap = self.max_output_tokens_cap.max(1);
        scaled.max(self.min_output_tokens).min(cap)
    }
}

type NoSegment<T> = fn(RetryAttemptContext) -> Ready<GenerationResult<AttemptOutcome<T>>>;

/// Run `attempt` with staged retries and no segment path.
pub async fn run_with_retry<T, F, Fut>(
    options: &RetryOptions,
    attempt: F,
) -> GenerationResult<RetryOutcome<T>>
where
    F: FnMut(RetryAttemptContext) -> Fut,
    Fut: Future<Output = GenerationResult<AttemptOutcome<T>>>,
{
    drive(options, attempt, None::<NoSegment<T>>).await
}

/// Run `attempt` with staged retries, falling back to `segment` once when a
/// downshifted response still reports hitting the token ceiling.
pub async fn run_with_segment_retry<T, F, Fut, S, SFut>(
    options: &RetryOptions,
    attempt: F,
    segment: S,
) -> GenerationResult<RetryOutcome<T>>
where
    F: FnMut(RetryAttemptContext) -> Fut,
    Fut: Future<Output = GenerationResult<AttemptOutcome<T>>>,
    S: FnOnce(RetryAttemptContext) -> SFut,
    SFut: Future<Output = GenerationResult<AttemptOutcome<T>>>,
{
    drive(options, attempt, Some(segment)).await
}

async fn drive<T, F, Fut, S, SFut>(
    options: &RetryOptions,
    mut attempt: F,
    segment: Option<S>,
) -> GenerationResult<RetryOutcome<T>>
where
    F: FnMut(RetryAttemptContext) -> Fut,
    Fut: Future<Output = GenerationResult<AttemptOutcome<T>>>,
    S: FnOnce(RetryAttemptContext) -> SFut,
    SFut: Future<Output = GenerationResult<AttemptOutcome<T>>>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut budget = options.initial_max_output_tokens;
    let mut stage = RetryStage::Primary;
    let mut attempts: u32 = 0;
    let mut segment = segment;

    loop {
        let ctx = RetryAttemptContext {
            attempt_index: attempts,
            stage,
            max_output_tokens: budget,
        };
        attempts += 1;

        debug!(
            attempt = ctx.attempt_index,
            stage = %ctx.stage,
            max_output_tokens = ctx.max_output_tokens,
            "Generation attempt"
        );

        let error: GenerationError = match attempt(ctx).await {
            Ok(outcome) => {
                if stage == RetryStage::Downshift && outcome.hit_token_ceiling() {
                    if let Some(segment) = segment.take() {
                        let seg_ctx = RetryAttemptContext {
                            attempt_index: attempts,
                            stage: RetryStage::Segment,
                            max_output_tokens: options.initial_max_output_tokens,
                        };
                        attempts += 1;
                        info!(
                            attempt = seg_ctx.attempt_index,
                            stage = %seg_ctx.stage,
                            max_output_tokens = seg_ctx.max_output_tokens,
                            "Still incomplete after downshift, running segment retry"
                        );
                        let outcome = segment(seg_ctx).await?;
                        return Ok(RetryOutcome {
                            truncated: outcome.incomplete_reason.is_some(),
                            result: outcome.value,
                            attempts,
                            max_output_tokens: seg_ctx.max_output_tokens,
                        });
                    }
                }

                return Ok(RetryOutcome {
                    truncated: outcome.incomplete_reason.is_some(),
                    result: outcome.value,
                    attempts,
                    max_output_tokens: budget,
                });
            }
            Err(e) => e,
        };

        if !error.is_truncation() && !error.is_malformed_output() {
            return Err(error);
        }
        if attempts >= max_attempts {
            warn!(attempts = attempts, error = %error, "Generation retries exhausted");
            return Err(error);
        }

        if error.is_truncation() {
            budget = options.scaled_budget(budget);
        }
        stage = RetryStage::Downshift;

        warn!(
            attempt = attempts,
            stage = %stage,
            max_output_tokens = budget,
            error = %error,
            "Retrying generation"
        );

        if options.backoff_ms > 0 {
            tokio::time::sleep(Duration::from_millis(options.backoff_ms * attempts as u64)).await;
        }
    }
}
