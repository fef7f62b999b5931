//! OpenAI-compatible chat client.
//!
//! Compatible with OpenAI, Azure OpenAI, DeepSeek, and local gateways that
//! expose `/chat/completions`. Strict-JSON calls set
//! `response_format=json_object`; when the provider returns non-JSON anyway,
//! the hint is dropped and the request is re-sent once.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, ChatResponse, LlmClient, LlmError, TokenUsage, extract_json_object};
use crate::config::LlmConfig;

pub struct OpenAiCompatClient {
    http_client: Client,
    api_base: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(config: &LlmConfig) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build LLM HTTP client: {}. Using defaults.", e);
                Client::default()
            });
        Self {
            http_client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout_sec),
        }
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
        expect_json: bool,
    ) -> Result<ChatResponse, LlmError> {
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            max_tokens: Some(max_tokens),
            temperature: Some(0.0),
            response_format: expect_json
                .then(|| ResponseFormat { r#type: "json_object".to_string() }),
        };

        let url = format!("{}/chat/completions", self.api_base);
        tracing::debug!("Calling LLM API: {} with model {}", url, model);

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout.as_secs())
                } else {
                    LlmError::ApiError(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::ApiError(format!("API error {}: {}", status, error_text)));
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .ok_or_else(|| LlmError::ParseError("Empty response from LLM".to_string()))?;

        let usage = chat_response
            .usage
            .map(|u| TokenUsage {
                prompt: u.prompt_tokens,
                completion: u.completion_tokens,
                total: u.prompt_tokens + u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ChatResponse { content, usage })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
        expect_json: bool,
    ) -> Result<ChatResponse, LlmError> {
        let response = self.chat_once(messages, model, max_tokens, expect_json).await?;
        if !expect_json {
            return Ok(response);
        }
        if extract_json_object(&response.content).is_ok() {
            return Ok(response);
        }

        // Some providers reject response_format on certain models and answer
        // in prose. Drop the hint, re-send once, and salvage what comes back.
        tracing::warn!("LLM returned non-JSON under json_object format; re-sending without hint");
        let mut retry = self.chat_once(messages, model, max_tokens, false).await?;
        retry.usage.add(&response.usage);
        Ok(retry)
    }
}

// ============================================================================
// OpenAI API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: i64,
    completion_tokens: i64,
}
