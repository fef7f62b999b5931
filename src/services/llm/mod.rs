//! LLM provider integration.
//!
//! The pipeline consumes one contract: `chat(messages, model, max_tokens,
//! expect_json)`. The concrete client speaks the OpenAI-compatible chat API;
//! tests plug in scripted doubles.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::OpenAiCompatClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TokenUsage {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<LlmError> for crate::utils::ApiError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(secs) => crate::utils::ApiError::LlmTimeout(secs),
            other => crate::utils::ApiError::LlmError(other.to_string()),
        }
    }
}

/// Chat contract every agent stage depends on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
        expect_json: bool,
    ) -> Result<ChatResponse, LlmError>;
}

/// Salvage a single JSON object from raw model output (fenced blocks, prose
/// prefixes). Returns the parsed object or a ParseError.
pub fn extract_json_object(content: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&trimmed[start..=end]) {
                if value.is_object() {
                    return Ok(value);
                }
            }
        }
    }
    Err(LlmError::ParseError(format!(
        "expected a single JSON object, got: {}",
        trimmed.chars().take(200).collect::<String>()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_is_extracted_from_fenced_output() {
        let content = "Here you go:\n```json\n{\"final_sql\": \"SELECT 1 FROM DUAL\"}\n```";
        let value = extract_json_object(content).expect("object");
        assert_eq!(value["final_sql"], "SELECT 1 FROM DUAL");
    }

    #[test]
    fn non_object_output_is_rejected() {
        assert!(extract_json_object("[1, 2, 3]").is_err());
        assert!(extract_json_object("no json here").is_err());
    }
}
