//! LLM 提供方抽象
//!
//! 所有后端（OpenAI 兼容 / Anthropic / Mock）实现 LlmProvider：一次非流式 complete，
//! 返回正文与 token 用量。提供方本身不计价，计价由 ModelClient 统一完成。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 对话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 单条消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// 一次补全请求（对应提供方的 complete(messages, model, temperature, max_tokens, system_prompt)）
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            max_tokens: 4096,
            system_prompt: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 最后一条 user 消息正文
    pub fn last_user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// 提供方原始返回：正文 + 上游报告的 token 用量（未报告时为 0）
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// LLM 调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("{0} API key not configured")]
    MissingCredentials(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),
}

/// LLM 提供方 trait
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// 提供方名称（日志用）
    fn name(&self) -> &str;

    /// 非流式补全
    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderReply, LlmError>;
}
