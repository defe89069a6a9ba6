//! OpenAI 兼容 API 提供方
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；system prompt 作为首条 system 消息发送。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{CompletionRequest, LlmError, LlmProvider, ProviderReply, Role};

/// OpenAI 兼容提供方：持有 Client，模型名由每次请求指定
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: &str) -> Self {
        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
        }
    }

    /// 从环境变量 OPENAI_API_KEY 创建；未设置时返回 None
    pub fn from_env(base_url: Option<&str>) -> Option<Self> {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(|key| Self::new(base_url, &key))
    }

    fn to_openai_messages(
        request: &CompletionRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let invalid = |e: async_openai::error::OpenAIError| LlmError::InvalidResponse(e.to_string());
        let mut out = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system_prompt {
            out.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.clone())
                    .build()
                    .map_err(invalid)?,
            ));
        }

        for m in &request.messages {
            let msg = match m.role {
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }

    /// 取首个 choice 的文本与 usage；未上报 usage 时为 (0, 0)
    fn to_reply(response: CreateChatCompletionResponse) -> ProviderReply {
        let (input_tokens, output_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or((0, 0));

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        ProviderReply {
            content,
            input_tokens,
            output_tokens,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ProviderReply, LlmError> {
        let body = CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .messages(Self::to_openai_messages(request)?)
            .temperature(request.temperature)
            .max_completion_tokens(request.max_tokens)
            .build()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(body)
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        Ok(Self::to_reply(response))
    }
}
