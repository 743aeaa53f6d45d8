use serde::{Deserialize, Serialize};

use crate::retry::IncompleteReason;
use crate::storage::TokenUsage;

/// Message in a generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// One logical generation call, independent of the per-attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Overrides the configured model.
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub input: Vec<Message>,
    /// Ask for a JSON object and parse the output.
    pub json_output: bool,
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    /// Create a request from input messages
    pub fn new(input: Vec<Message>) -> Self {
        Self {
            model: None,
            instructions: None,
            input,
            json_output: false,
            temperature: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_json_output(mut self, json_output: bool) -> Self {
        self.json_output = json_output;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Follow-up asking for a shorter answer after the previous one was cut off.
    pub fn continuation(&self) -> Self {
        let mut next = self.clone();
        next.input.push(Message::user(
            "Your previous answer was cut off. Answer again in full, keeping only the most \
             important findings so the response fits.",
        ));
        next
    }
}

/// Wire body of `POST /v1/responses`
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ResponsesRequest<'a> {
    pub model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'a str>,
    pub input: &'a [Message],
    pub max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<TextOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TextOptions {
    pub format: TextFormat,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TextFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl TextOptions {
    pub fn json_object() -> Self {
        Self {
            format: TextFormat {
                kind: "json_object",
            },
        }
    }
}

/// Response from `POST /v1/responses`
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
    pub incomplete_details: Option<IncompleteDetails>,
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    pub usage: Option<ResponseUsage>,
}

/// Why the API stopped early
#[derive(Debug, Clone, Deserialize)]
pub struct IncompleteDetails {
    pub reason: String,
}

/// Error object on a failed response
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseError {
    pub code: Option<String>,
    pub message: String,
}

/// One output item
#[derive(Debug, Clone, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Vec<OutputContent>,
}

/// One content part of an output item
#[derive(Debug, Clone, Deserialize)]
pub struct OutputContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Token usage information
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl ResponsesResponse {
    /// Concatenated text of every `output_text` part.
    pub fn output_text(&self) -> String {
        self.output
            .iter()
            .filter(|item| item.kind == "message")
            .flat_map(|item| item.content.iter())
            .filter(|part| part.kind == "output_text")
            .filter_map(|part| part.text.as_deref())
            .collect()
    }

    /// Incomplete reason, if the response is flagged incomplete.
    pub fn incomplete_reason(&self) -> Option<IncompleteReason> {
        if self.status.as_deref() != Some("incomplete") {
            return None;
        }
        Some(
            self.incomplete_details
                .as_ref()
                .map(|d| IncompleteReason::parse(&d.reason))
                .unwrap_or_else(|| IncompleteReason::Other("unknown".to_string())),
        )
    }
}

impl From<&ResponseUsage> for TokenUsage {
    fn from(usage: &ResponseUsage) -> Self {
        let input_tokens = usage.input_tokens.unwrap_or(0);
        let output_tokens = usage.output_tokens.unwrap_or(0);
        TokenUsage {
            input_tokens,
            output_tokens,
            total_tokens: usage.total_tokens.unwrap_or(input_tokens + output_tokens),
        }
    }
}

/// Text produced by one accepted call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Parsed output for JSON-mode requests.
    pub json: Option<serde_json::Value>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: serde_json::Value) -> ResponsesResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_output_text_joins_message_parts() {
        let resp = response(json!({
            "status": "completed",
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "{\"items\":"},
                    {"type": "output_text", "text": "[]}"}
                ]}
            ]
        }));
        assert_eq!(resp.output_text(), "{\"items\":[]}");
        assert!(resp.incomplete_reason().is_none());
    }

    #[test]
    fn test_incomplete_reason() {
        let resp = response(json!({
            "status": "incomplete",
            "incomplete_details": {"reason": "max_output_tokens"}
        }));
        assert_eq!(resp.incomplete_reason(), Some(IncompleteReason::MaxOutputTokens));

        let resp = response(json!({
            "status": "incomplete",
            "incomplete_details": {"reason": "content_filter"}
        }));
        assert_eq!(
            resp.incomplete_reason(),
            Some(IncompleteReason::Other("content_filter".to_string()))
        );
    }

    #[test]
    fn test_usage_total_fallback() {
        let usage = ResponseUsage {
            input_tokens: Some(10),
            output_tokens: Some(5),
            total_tokens: None,
        };
        assert_eq!(TokenUsage::from(&usage).total_tokens, 15);
    }

    #[test]
    fn test_continuation_appends_follow_up() {
        let request = GenerationRequest::new(vec![Message::user("check this")])
            .with_instructions("Return JSON.");
        let next = request.continuation();
        assert_eq!(next.input.len(), 2);
        assert_eq!(next.input[1].role, MessageRole::User);
        assert!(next.input[1].content.contains("cut off"));
        assert_eq!(next.instructions, request.instructions);
    }

    #[test]
    fn test_request_serializes_json_format() {
        let input = vec![Message::user("hi")];
        let body = ResponsesRequest {
            model: "gpt-4o-mini",
            instructions: None,
            input: &input,
            max_output_tokens: 300,
            temperature: None,
            text: Some(TextOptions::json_object()),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["max_output_tokens"], 300);
        assert_eq!(value["text"]["format"]["type"], "json_object");
        assert_eq!(value["input"][0]["role"], "user");
        assert!(value.get("instructions").is_none());
    }
}
