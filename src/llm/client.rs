//! 模型客户端：按模型名选择提供方、统一计费
//!
//! 无跨调用状态，可在并发运行间共享。提供方选择是模型 id 的纯函数：
//! `claude` 前缀 → Anthropic，其余 → OpenAI 兼容。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::AppConfig;
use crate::engine::ContextInfo;
use crate::llm::prompts::{child_message, program_message, CHILD_SYSTEM_PROMPT, PROGRAM_SYSTEM_PROMPT};
use crate::llm::{
    calculate_cost, is_known_model, AnthropicClient, CompletionRequest, LlmError, LlmProvider,
    Message, OpenAiClient, TokenEstimator,
};
use crate::memory::Memory;

/// 生成程序时的温度（偏确定）
const PROGRAM_TEMPERATURE: f32 = 0.3;
/// 子查询温度
const CHILD_TEMPERATURE: f32 = 0.5;

/// 提供方家族
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("claude") {
            ProviderKind::Anthropic
        } else {
            ProviderKind::OpenAi
        }
    }

    fn label(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Anthropic => "Anthropic",
        }
    }
}

/// 一次模型调用的结果（含计费）
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelReply {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl ModelReply {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// 模型客户端
#[derive(Clone)]
pub struct ModelClient {
    openai: Option<Arc<dyn LlmProvider>>,
    anthropic: Option<Arc<dyn LlmProvider>>,
    request_timeout: Duration,
}

impl ModelClient {
    pub fn new(
        openai: Option<Arc<dyn LlmProvider>>,
        anthropic: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            openai,
            anthropic,
            request_timeout: Duration::from_secs(120),
        }
    }

    /// 所有模型都走同一个提供方（测试 / 单一代理网关）
    pub fn single(provider: Arc<dyn LlmProvider>) -> Self {
        Self::new(Some(provider.clone()), Some(provider))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// 根据配置与环境变量创建：有对应 API Key 才挂载该提供方
    pub fn from_config(cfg: &AppConfig) -> Self {
        let openai = OpenAiClient::from_env(cfg.llm.openai_base_url.as_deref())
            .map(|c| Arc::new(c) as Arc<dyn LlmProvider>);
        let anthropic = AnthropicClient::from_env(cfg.llm.anthropic_base_url.as_deref())
            .map(|c| Arc::new(c) as Arc<dyn LlmProvider>);
        if openai.is_none() && anthropic.is_none() {
            tracing::warn!("No provider API key set; model calls will fail until one is configured");
        }
        Self::new(openai, anthropic)
            .with_request_timeout(Duration::from_secs(cfg.llm.timeouts.request))
    }

    fn provider_for(&self, model: &str) -> Result<&Arc<dyn LlmProvider>, LlmError> {
        let kind = ProviderKind::for_model(model);
        let provider = match kind {
            ProviderKind::OpenAi => self.openai.as_ref(),
            ProviderKind::Anthropic => self.anthropic.as_ref(),
        };
        provider.ok_or_else(|| LlmError::MissingCredentials(kind.label().to_string()))
    }

    /// 底层补全：选提供方 → 调用（带请求超时）→ 补齐 usage → 计费
    pub async fn complete(&self, request: CompletionRequest) -> Result<ModelReply, LlmError> {
        let provider = self.provider_for(&request.model)?;
        let reply = tokio::time::timeout(self.request_timeout, provider.complete(&request))
            .await
            .map_err(|_| LlmError::Timeout(self.request_timeout.as_secs()))??;

        let (input_tokens, output_tokens) = if reply.input_tokens == 0 && reply.output_tokens == 0 {
            (
                TokenEstimator::estimate_request(&request),
                TokenEstimator::estimate(&reply.content),
            )
        } else {
            (reply.input_tokens, reply.output_tokens)
        };
        if !is_known_model(&request.model) {
            tracing::warn!(model = %request.model, "model not in price table; billing at default rate");
        }
        let cost_usd = calculate_cost(&request.model, input_tokens, output_tokens);

        tracing::debug!(
            provider = provider.name(),
            model = %request.model,
            input_tokens,
            output_tokens,
            cost_usd,
            "model call"
        );

        Ok(ModelReply {
            content: reply.content,
            model: request.model,
            input_tokens,
            output_tokens,
            cost_usd,
        })
    }

    /// 为查询生成程序；只使用文档元信息
    pub async fn generate_program(
        &self,
        query: &str,
        info: &ContextInfo,
        memory: &Memory,
        model: &str,
    ) -> Result<ModelReply, LlmError> {
        let request = CompletionRequest::new(model, vec![Message::user(program_message(query, info, memory))])
            .with_system_prompt(PROGRAM_SYSTEM_PROMPT)
            .with_temperature(PROGRAM_TEMPERATURE);
        self.complete(request).await
    }

    /// 直接回答一次委派
    pub async fn complete_child(
        &self,
        prompt: &str,
        parent_memory: &Memory,
        model: &str,
    ) -> Result<ModelReply, LlmError> {
        let request = CompletionRequest::new(model, vec![Message::user(child_message(prompt, parent_memory))])
            .with_system_prompt(CHILD_SYSTEM_PROMPT)
            .with_temperature(CHILD_TEMPERATURE);
        self.complete(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_provider_selection_by_prefix() {
        assert_eq!(ProviderKind::for_model("claude-3-haiku-20240307"), ProviderKind::Anthropic);
        assert_eq!(ProviderKind::for_model("gpt-4o"), ProviderKind::OpenAi);
        assert_eq!(ProviderKind::for_model("mistral-large"), ProviderKind::OpenAi);
    }

    #[tokio::test]
    async fn test_missing_provider_is_credentials_error() {
        let mock: Arc<dyn LlmProvider> = Arc::new(MockLlmClient::new("complete(1);"));
        let client = ModelClient::new(Some(mock), None);
        let err = client
            .complete_child("hi", &Memory::new(), "claude-3-haiku-20240307")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn test_unknown_model_falls_back_to_default_pricing() {
        let mock = MockLlmClient::new("complete(1);").with_usage(1_000, 0);
        let client = ModelClient::single(Arc::new(mock));
        let reply = client
            .complete_child("hi", &Memory::new(), "brand-new-model")
            .await
            .unwrap();
        assert_eq!(reply.input_tokens, 1_000);
        assert!((reply.cost_usd - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_usage_is_estimated() {
        let mock = MockLlmClient::new("complete(1);").with_usage(0, 0);
        let client = ModelClient::single(Arc::new(mock));
        let reply = client
            .complete_child("a reasonably long prompt for estimation", &Memory::new(), "gpt-4o")
            .await
            .unwrap();
        assert!(reply.input_tokens > 0);
        assert!(reply.output_tokens > 0);
        assert!(reply.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn test_generate_program_uses_program_prompt() {
        let mock = Arc::new(MockLlmClient::new("complete(\"done\");"));
        let client = ModelClient::single(mock.clone());
        let info = ContextInfo::from_document("abc");
        let reply = client
            .generate_program("q", &info, &Memory::new(), "gpt-4o-mini")
            .await
            .unwrap();
        assert_eq!(reply.content, "complete(\"done\");");
        assert_eq!(mock.generation_calls(), 1);
        assert_eq!(mock.child_calls(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let mock = MockLlmClient::new("complete(1);")
            .with_child_delay(Duration::from_millis(500));
        let client = ModelClient::single(Arc::new(mock))
            .with_request_timeout(Duration::from_millis(50));
        let err = client
            .complete_child("slow", &Memory::new(), "gpt-4o")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }
}
