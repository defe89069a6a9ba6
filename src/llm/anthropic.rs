//! Anthropic Messages API 提供方
//!
//! 直接用 reqwest 调 `/v1/messages`；system prompt 单独放在 `system` 字段，未提供时用默认助手提示。

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::llm::{CompletionRequest, LlmError, LlmProvider, Message, ProviderReply};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Anthropic 提供方
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    api_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            api_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// 指定端点（代理 / 测试桩）
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// 从环境变量 ANTHROPIC_API_KEY 创建；未设置时返回 None
    pub fn from_env(api_url: Option<&str>) -> Option<Self> {
        let key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())?;
        let client = Self::new(key);
        Some(match api_url {
            Some(url) => client.with_api_url(url),
            None => client,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderReply, LlmError> {
        let body = MessagesRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            system: request
                .system_prompt
                .as_deref()
                .unwrap_or(DEFAULT_SYSTEM_PROMPT),
        };

        tracing::debug!(model = %request.model, "Sending request to Anthropic");

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ApiError(format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::ApiError(format!("Failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(LlmError::ApiError(format!("HTTP {}: {}", status.as_u16(), text)));
        }

        parse_messages_response(&text)
    }
}

/// 解析 Messages API 响应：取第一个 text 块，usage 缺失按 0 计
fn parse_messages_response(body: &str) -> Result<ProviderReply, LlmError> {
    let parsed: MessagesResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::InvalidResponse(format!("Failed to parse response: {}, body: {}", e, body))
    })?;

    let content = parsed
        .content
        .into_iter()
        .find_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .unwrap_or_default();

    let usage = parsed.usage.unwrap_or_default();
    Ok(ProviderReply {
        content,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    })
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    system: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}
