//! Integration tests for the staged retry orchestrator
//!
//! Drives run_with_retry with scripted attempt closures and checks the
//! budgets and stages each attempt was given.

use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};

use proofread_relay::error::{GenerationError, GenerationResult};
use proofread_relay::retry::{
    run_with_retry, run_with_segment_retry, AttemptOutcome, IncompleteReason,
    RetryAttemptContext, RetryOptions, RetryStage,
};

type Attempt<T> = Ready<GenerationResult<AttemptOutcome<T>>>;

fn create_test_options(initial: u32, min: u32, cap: u32) -> RetryOptions {
    RetryOptions::default()
        .with_budget(initial, min, cap)
        .with_backoff_ms(0)
}

/// Attempt function replaying `script` in order and recording every context.
fn scripted<T: Clone + 'static>(
    script: Vec<GenerationResult<AttemptOutcome<T>>>,
) -> (
    impl FnMut(RetryAttemptContext) -> Attempt<T>,
    Arc<Mutex<Vec<RetryAttemptContext>>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let mut script = script.into_iter();
    let attempt = move |ctx: RetryAttemptContext| {
        log.lock().unwrap().push(ctx);
        ready(script.next().expect("attempt beyond script"))
    };
    (attempt, seen)
}

fn truncated() -> GenerationError {
    GenerationError::Truncated {
        max_output_tokens: 0,
    }
}

#[tokio::test]
async fn test_truncation_then_success_scales_budget() {
    let (attempt, seen) = scripted(vec![Err(truncated()), Ok(AttemptOutcome::complete("done"))]);

    let outcome = run_with_retry(&create_test_options(300, 200, 2000), attempt)
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 2);
    assert!(outcome.max_output_tokens > 300);
    assert!(outcome.max_output_tokens <= 2000);
    assert!(!outcome.truncated);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].max_output_tokens, 300);
    assert_eq!(seen[0].stage, RetryStage::Primary);
    assert_eq!(seen[1].max_output_tokens, outcome.max_output_tokens);
    assert_eq!(seen[1].stage, RetryStage::Downshift);
}

#[tokio::test]
async fn test_budget_never_exceeds_cap() {
    let (attempt, seen) = scripted(vec![
        Err(truncated()),
        Err(truncated()),
        Err(truncated()),
        Ok(AttemptOutcome::complete(())),
    ]);

    let outcome = run_with_retry(&create_test_options(800, 200, 1000), attempt)
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 4);
    let budgets: Vec<u32> = seen.lock().unwrap().iter().map(|c| c.max_output_tokens).collect();
    assert_eq!(budgets, vec![800, 1000, 1000, 1000]);
}

#[tokio::test]
async fn test_malformed_json_keeps_budget() {
    let parse_error: GenerationError = serde_json::from_str::<serde_json::Value>("{\"items\": [")
        .unwrap_err()
        .into();
    let (attempt, seen) = scripted(vec![Err(parse_error), Ok(AttemptOutcome::complete(1))]);

    let outcome = run_with_retry(&create_test_options(150, 100, 4000), attempt)
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.max_output_tokens, 150);
    let budgets: Vec<u32> = seen.lock().unwrap().iter().map(|c| c.max_output_tokens).collect();
    assert_eq!(budgets, vec![150, 150]);
}

#[tokio::test]
async fn test_non_retryable_error_bubbles_immediately() {
    let (attempt, seen) = scripted::<()>(vec![Err(GenerationError::Timeout { timeout_ms: 30000 })]);

    let err = run_with_retry(&create_test_options(300, 200, 2000), attempt)
        .await
        .unwrap_err();

    assert!(matches!(err, GenerationError::Timeout { timeout_ms: 30000 }));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_exhausted_attempts_return_last_error() {
    let parse_error = || GenerationError::MalformedOutput {
        message: "unexpected end".to_string(),
    };
    let (attempt, seen) = scripted::<()>(vec![Err(parse_error()), Err(parse_error())]);

    let err = run_with_retry(
        &create_test_options(300, 200, 2000).with_max_attempts(2),
        attempt,
    )
    .await
    .unwrap_err();

    assert!(err.is_malformed_output());
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_segment_retry_uses_original_budget() {
    let (attempt, _seen) = scripted(vec![
        Err(truncated()),
        Ok(AttemptOutcome::incomplete(
            "partial".to_string(),
            IncompleteReason::MaxOutputTokens,
        )),
    ]);
    let segment_ctx = Arc::new(Mutex::new(None));
    let segment_log = Arc::clone(&segment_ctx);

    let outcome = run_with_segment_retry(&create_test_options(300, 200, 2000), attempt, move |ctx| {
        *segment_log.lock().unwrap() = Some(ctx);
        ready(Ok(AttemptOutcome::complete("whole".to_string())))
    })
    .await
    .unwrap();

    assert_eq!(outcome.result, "whole");
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.max_output_tokens, 300);

    let ctx = segment_ctx.lock().unwrap().expect("segment retry ran");
    assert_eq!(ctx.stage, RetryStage::Segment);
    assert_eq!(ctx.max_output_tokens, 300);
}

#[tokio::test]
async fn test_incomplete_without_segment_is_flagged_truncated() {
    let (attempt, _seen) = scripted(vec![
        Err(truncated()),
        Ok(AttemptOutcome::incomplete(
            "partial".to_string(),
            IncompleteReason::MaxOutputTokens,
        )),
    ]);

    let outcome = run_with_retry(&create_test_options(300, 200, 2000), attempt)
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 2);
    assert!(outcome.truncated);
    assert_eq!(outcome.result, "partial");
}
