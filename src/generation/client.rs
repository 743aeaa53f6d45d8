use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{
    Generation, GenerationRequest, ResponsesRequest, ResponsesResponse, TextOptions,
};
use crate::config::{GenerationConfig, RequestConfig};
use crate::error::{GenerationError, GenerationResult};
use crate::retry::{
    run_with_segment_retry, AttemptOutcome, IncompleteReason, RetryAttemptContext, RetryOptions,
    RetryOutcome,
};
use crate::storage::TokenUsage;

/// Client for the generative text API
#[derive(Clone)]
pub struct GenerationClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    request_config: RequestConfig,
}

impl GenerationClient {
    /// Create a new generation client
    pub fn new(config: &GenerationConfig, request_config: RequestConfig) -> GenerationResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(GenerationError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform exactly one call with the attempt's output-token budget.
    ///
    /// A response cut off by the token ceiling with no usable output is
    /// [`GenerationError::Truncated`]; one with partial output is returned with
    /// its incomplete reason so the caller can decide.
    pub async fn generate_once(
        &self,
        request: &GenerationRequest,
        ctx: RetryAttemptContext,
    ) -> GenerationResult<AttemptOutcome<Generation>> {
        let url = format!("{}/v1/responses", self.base_url);
        let model = request.model.as_deref().unwrap_or(&self.model);

        let body = ResponsesRequest {
            model,
            instructions: request.instructions.as_deref(),
            input: &request.input,
            max_output_tokens: ctx.max_output_tokens,
            temperature: request.temperature,
            text: request.json_output.then(TextOptions::json_object),
        };

        debug!(
            model = %model,
            attempt = ctx.attempt_index,
            stage = %ctx.stage,
            max_output_tokens = ctx.max_output_tokens,
            messages = request.input.len(),
            "Calling generation API"
        );

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    GenerationError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                latency_ms = start.elapsed().as_millis(),
                "Generation API returned an error"
            );
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let parsed: ResponsesResponse =
            response
                .json()
                .await
                .map_err(|e| GenerationError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        if parsed.status.as_deref() == Some("failed") {
            return Err(GenerationError::InvalidResponse {
                message: parsed
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "response failed".to_string()),
            });
        }

        let text = parsed.output_text();
        let incomplete_reason = parsed.incomplete_reason();

        if incomplete_reason == Some(IncompleteReason::MaxOutputTokens) && text.trim().is_empty() {
            return Err(GenerationError::Truncated {
                max_output_tokens: ctx.max_output_tokens,
            });
        }

        let json = if request.json_output {
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => Some(value),
                // Partial JSON is expected when the response is incomplete.
                Err(_) if incomplete_reason.is_some() => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        info!(
            model = ?parsed.model,
            latency_ms = start.elapsed().as_millis(),
            incomplete = incomplete_reason.is_some(),
            "Generation call succeeded"
        );

        Ok(AttemptOutcome {
            value: Generation {
                text,
                json,
                model: parsed.model,
                usage: parsed.usage.as_ref().map(TokenUsage::from),
            },
            incomplete_reason,
        })
    }

    /// One logical call with staged retry. A response still cut off after a
    /// downshift is re-requested once as a condensed continuation.
    pub async fn generate_with_retry(
        &self,
        request: &GenerationRequest,
        options: &RetryOptions,
    ) -> GenerationResult<RetryOutcome<Generation>> {
        let client = self;
        let segment_request = request.continuation();

        run_with_segment_retry(
            options,
            move |ctx| client.generate_once(request, ctx),
            move |ctx| async move { client.generate_once(&segment_request, ctx).await },
        )
        .await
    }
}
